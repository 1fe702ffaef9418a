use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::source::{
    DetailRecord, DetailRequest, DetailSource, Page, PageRequest, PagedSource,
    RawContributionRecord,
};

/// Detail records registered for one (repository, identity, date) unit.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureDetails {
    pub repository: String,
    pub identity: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub records: Vec<DetailRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    records: Vec<RawContributionRecord>,
    #[serde(default)]
    details: Vec<FixtureDetails>,
}

/// In-memory upstream that paginates a fixed record set.
///
/// Rows are filtered by the requested selector and date range and served in
/// insertion order, so page boundaries are stable across calls.
#[derive(Debug, Default)]
pub struct FixtureSource {
    records: Vec<RawContributionRecord>,
    details: Vec<FixtureDetails>,
    page_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl FixtureSource {
    pub fn new(records: Vec<RawContributionRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn with_details(mut self, details: Vec<FixtureDetails>) -> Self {
        self.details = details;
        self
    }

    /// Load `{"records": [...], "details": [...]}` from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read fixture {}: {e}", path.display())))?;
        let file: FixtureFile = serde_json::from_str(&text)?;
        log::info!(
            "Loaded fixture {} ({} records, {} detail units)",
            path.display(),
            file.records.len(),
            file.details.len()
        );
        Ok(Self::new(file.records).with_details(file.details))
    }

    /// Page fetches served so far.
    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    /// Detail fetches served so far.
    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

impl PagedSource for FixtureSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<&RawContributionRecord> = self
            .records
            .iter()
            .filter(|r| request.selector.contains(&r.repository) && request.range.contains(r.date))
            .collect();

        let per_page = request.per_page.max(1) as usize;
        let offset = (request.page.max(1) as usize - 1) * per_page;
        let rows = matching
            .iter()
            .skip(offset)
            .take(per_page)
            .map(|r| (*r).clone())
            .collect();

        Ok(Page {
            total_rows: matching.len() as u64,
            page: request.page,
            per_page: request.per_page,
            rows,
        })
    }
}

impl DetailSource for FixtureSource {
    async fn fetch_details(&self, request: &DetailRequest) -> Result<Vec<DetailRecord>> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .details
            .iter()
            .filter(|d| {
                d.repository == request.repository
                    && d.identity == request.identity
                    && d.date == request.date
            })
            .flat_map(|d| d.records.iter().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::DateRange;
    use crate::source::Selector;
    use std::io::Write;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn record(repo: &str, login: &str, day: u32) -> RawContributionRecord {
        RawContributionRecord {
            repository: repo.into(),
            login: Some(login.into()),
            display_name: None,
            email: None,
            date: d(day),
            contributions: 1,
            added_lines: 0,
            removed_lines: 0,
        }
    }

    #[tokio::test]
    async fn test_pages_filter_by_selector_and_range() {
        let source = FixtureSource::new(vec![
            record("a/b", "alice", 1),
            record("x/y", "bob", 1),
            record("a/b", "carol", 2),
            record("a/b", "dave", 20),
            record("a/b", "erin", 3),
        ]);
        let request = PageRequest {
            selector: Selector::new(["a/b"]),
            range: DateRange::new(d(1), d(10)).unwrap(),
            page: 2,
            per_page: 2,
        };
        let page = source.fetch_page(&request).await.unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].login.as_deref(), Some("erin"));
        assert_eq!(source.page_calls(), 1);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"records":[{{"repository":"a/b","login":"alice","date":"2024-01-01","contributions":3}}],
               "details":[{{"repository":"a/b","identity":"alice","date":"2024-01-01",
                            "records":[{{"id":"1","date":"2024-01-01","files_added":2}}]}}]}}"#
        )
        .unwrap();
        let source = FixtureSource::from_file(file.path()).unwrap();
        assert_eq!(source.records.len(), 1);
        assert_eq!(source.details[0].records[0].files_added, 2);
    }
}
