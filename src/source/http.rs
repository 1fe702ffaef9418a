use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::source::{DetailRecord, DetailRequest, DetailSource, Page, PageRequest, PagedSource};

const USER_AGENT: &str = concat!("contribreport/", env!("CARGO_PKG_VERSION"));

/// REST adapter for the contributions upstream.
///
/// Every request carries its own timeout; the pipeline as a whole is not
/// time-bounded.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| Error::Config(format!("invalid base_url '{base_url}': {e}")))?;
        // Keep the last path segment when joining endpoint names.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn endpoint(&self, name: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(name)
            .map_err(|e| Error::Config(format!("invalid endpoint {name}: {e}")))?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| Error::NotAuthenticated("no API token configured".into()))?;
        let context = format!("GET {}", url.path());
        log::trace!("{context} {}", url.query().unwrap_or(""));

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let hint = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => " (check the API token)",
                StatusCode::TOO_MANY_REQUESTS => " (rate limited)",
                _ => "",
            };
            return Err(Error::upstream(
                context,
                format!("HTTP {status}{hint}: {}", body.chars().take(200).collect::<String>()),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::upstream(context, format!("undecodable body: {e}")))
    }
}

impl PagedSource for HttpSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        let url = self.endpoint(
            "contributions",
            &[
                ("repositories", request.selector.joined()),
                ("start", request.range.start.to_string()),
                ("end", request.range.end.to_string()),
                ("page", request.page.to_string()),
                ("per_page", request.per_page.to_string()),
            ],
        )?;
        self.get_json(url).await
    }

    fn check_credentials(&self) -> Result<()> {
        match self.token {
            Some(_) => Ok(()),
            None => Err(Error::NotAuthenticated(
                "set CONTRIBREPORT_TOKEN or `contribreport config set token <TOKEN>`".into(),
            )),
        }
    }
}

impl DetailSource for HttpSource {
    async fn fetch_details(&self, request: &DetailRequest) -> Result<Vec<DetailRecord>> {
        let url = self.endpoint(
            "details",
            &[
                ("repository", request.repository.clone()),
                ("identity", request.identity.clone()),
                ("date", request.date.to_string()),
            ],
        )?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::DateRange;
    use crate::source::Selector;
    use chrono::NaiveDate;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let source = HttpSource::new(
            "https://example.test/api/v2",
            Some("t".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let url = source
            .endpoint("contributions", &[("page", "2".to_string()), ("repositories", "a/b,c/d".to_string())])
            .unwrap();
        assert_eq!(url.path(), "/api/v2/contributions");
        assert_eq!(url.query(), Some("page=2&repositories=a%2Fb%2Cc%2Fd"));
    }

    #[test]
    fn test_missing_token_is_not_authenticated() {
        let source = HttpSource::new("https://example.test", Some("  ".into()), Duration::from_secs(5)).unwrap();
        assert!(matches!(source.check_credentials(), Err(Error::NotAuthenticated(_))));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpSource::new("not a url", None, Duration::from_secs(5)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_without_token_never_hits_network() {
        let source = HttpSource::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let request = PageRequest {
            selector: Selector::new(["a/b"]),
            range: DateRange::new(d, d).unwrap(),
            page: 1,
            per_page: 50,
        };
        let err = source.fetch_page(&request).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }
}
