pub mod fixture;
pub mod http;

use std::collections::BTreeSet;
use std::future::Future;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::date_util::DateRange;
use crate::error::{Error, Result};

pub use fixture::FixtureSource;
pub use http::HttpSource;

/// One contributor-day row as reported by the paged upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContributionRecord {
    pub repository: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub contributions: u64,
    #[serde(default)]
    pub added_lines: u64,
    #[serde(default)]
    pub removed_lines: u64,
}

/// The set of repositories a report covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub repositories: BTreeSet<String>,
}

impl Selector {
    pub fn new<I, S>(repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            repositories: repositories
                .into_iter()
                .map(|r| {
                    let r: String = r.into();
                    r.trim().to_string()
                })
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Reject an empty selection before anything is fetched.
    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            return Err(Error::Misconfiguration("no repository selected".into()));
        }
        Ok(())
    }

    pub fn contains(&self, repository: &str) -> bool {
        self.repositories.contains(repository)
    }

    /// Comma-joined repository list as sent upstream.
    pub fn joined(&self) -> String {
        self.repositories
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.joined())
    }
}

/// Request for one page of contribution rows. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub selector: Selector,
    pub range: DateRange,
    pub page: u32,
    pub per_page: u32,
}

/// One page of the paged upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub total_rows: u64,
    pub page: u32,
    pub per_page: u32,
    pub rows: Vec<RawContributionRecord>,
}

impl Page {
    /// Pages needed to cover `total_rows`; never less than one.
    pub fn page_count(&self) -> u32 {
        page_count(self.total_rows, self.per_page)
    }
}

/// `ceil(total_rows / per_page)`, at least one so an empty result still has
/// the page that reported it.
pub fn page_count(total_rows: u64, per_page: u32) -> u32 {
    let per_page = per_page.max(1) as u64;
    total_rows.div_ceil(per_page).clamp(1, u32::MAX as u64) as u32
}

/// Request for the detail records behind one enrichment unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRequest {
    pub repository: String,
    /// Upstream handle of the contributor.
    pub identity: String,
    pub date: NaiveDate,
}

/// Task / pull-request level record returned by the detail upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: String,
    #[serde(default)]
    pub task_ref: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub file_change_count: u64,
    #[serde(default)]
    pub files_added: u64,
    #[serde(default)]
    pub files_deleted: u64,
    #[serde(default)]
    pub files_modified: u64,
    #[serde(default)]
    pub approver: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub external_link: Option<String>,
}

/// Server-paginated source of contribution rows.
pub trait PagedSource: Send + Sync {
    fn fetch_page(&self, request: &PageRequest) -> impl Future<Output = Result<Page>> + Send;

    /// Fail fast when no credential is available.
    fn check_credentials(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of per-unit detail records used by enrichment.
pub trait DetailSource: Send + Sync {
    fn fetch_details(
        &self,
        request: &DetailRequest,
    ) -> impl Future<Output = Result<Vec<DetailRecord>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(237, 50), 5);
        assert_eq!(page_count(250, 50), 5);
        assert_eq!(page_count(251, 50), 6);
        assert_eq!(page_count(0, 50), 1);
        assert_eq!(page_count(10, 0), 10);
    }

    #[test]
    fn test_selector_trims_and_dedups() {
        let s = Selector::new(["a/b", " a/b ", "", "c/d"]);
        assert_eq!(s.joined(), "a/b,c/d");
        assert!(s.validate().is_ok());
        assert!(Selector::new(Vec::<String>::new()).validate().is_err());
    }

    #[test]
    fn test_record_deserializes_with_missing_identity() {
        let json = r#"{"repository":"a/b","date":"2024-01-01","contributions":2}"#;
        let r: RawContributionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.login, None);
        assert_eq!(r.contributions, 2);
        assert_eq!(r.added_lines, 0);
    }
}
