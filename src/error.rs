use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Upstream request failed ({context}): {message}")]
    Upstream { context: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to fetch page {page}: {source}")]
    PageFetch {
        page: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to enrich {unit}: {source}")]
    UnitFetch {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("Build superseded (generation {generation} is no longer current)")]
    Superseded { generation: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid period format: {0}")]
    PeriodParse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn upstream(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upstream {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Whether the failed operation can be retried as a whole.
    ///
    /// Collection failures surface to the caller with a retry affordance;
    /// configuration and authentication problems need user action first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Upstream { .. } | Error::Http(_) => true,
            Error::PageFetch { source, .. } | Error::UnitFetch { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
