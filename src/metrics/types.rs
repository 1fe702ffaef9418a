use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::identity::ResolvedIdentity;
use crate::source::{DetailRecord, RawContributionRecord};

/// Every metric a contributor is measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    Contributions,
    AddedLines,
    RemovedLines,
    Tasks,
    FilesAdded,
    FilesDeleted,
    FilesModified,
}

impl Metric {
    pub const COUNT: usize = 7;

    pub const ALL: [Metric; Metric::COUNT] = [
        Metric::Contributions,
        Metric::AddedLines,
        Metric::RemovedLines,
        Metric::Tasks,
        Metric::FilesAdded,
        Metric::FilesDeleted,
        Metric::FilesModified,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Contributions => "contributions",
            Metric::AddedLines => "added-lines",
            Metric::RemovedLines => "removed-lines",
            Metric::Tasks => "tasks",
            Metric::FilesAdded => "files-added",
            Metric::FilesDeleted => "files-deleted",
            Metric::FilesModified => "files-modified",
        }
    }

    /// Metrics that only enrichment produces.
    pub fn is_detail(self) -> bool {
        matches!(
            self,
            Metric::Tasks | Metric::FilesAdded | Metric::FilesDeleted | Metric::FilesModified
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Metric::ALL.iter().map(|m| m.as_str()).collect();
                Error::Other(format!("unknown metric '{s}' (known: {})", known.join(", ")))
            })
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One value per metric, indexed by `Metric`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricValues([u64; Metric::COUNT]);

impl MetricValues {
    pub fn get(&self, metric: Metric) -> u64 {
        self.0[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: u64) {
        self.0[metric.index()] = value;
    }

    pub fn add(&mut self, metric: Metric, value: u64) {
        let slot = &mut self.0[metric.index()];
        *slot = slot.saturating_add(value);
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, u64)> + '_ {
        Metric::ALL.into_iter().map(|m| (m, self.get(m)))
    }
}

impl AddAssign for MetricValues {
    fn add_assign(&mut self, rhs: Self) {
        for metric in Metric::ALL {
            self.add(metric, rhs.get(metric));
        }
    }
}

impl Add for MetricValues {
    type Output = MetricValues;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Serialize for MetricValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Metric::COUNT))?;
        for (metric, value) in self.iter() {
            map.serialize_entry(metric.as_str(), &value)?;
        }
        map.end()
    }
}

/// Metric values of one contributor on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSeriesPoint {
    pub date: NaiveDate,
    pub values: MetricValues,
}

/// A raw record after identity resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionRow {
    pub repository: String,
    pub canonical_key: String,
    pub display_label: String,
    pub date: NaiveDate,
    pub contributions: u64,
    pub added_lines: u64,
    pub removed_lines: u64,
}

impl ContributionRow {
    pub fn from_record(record: &RawContributionRecord, identity: ResolvedIdentity) -> Self {
        Self {
            repository: record.repository.clone(),
            canonical_key: identity.canonical_key,
            display_label: identity.display_label,
            date: record.date,
            contributions: record.contributions,
            added_lines: record.added_lines,
            removed_lines: record.removed_lines,
        }
    }

    pub fn values(&self) -> MetricValues {
        let mut values = MetricValues::default();
        values.set(Metric::Contributions, self.contributions);
        values.set(Metric::AddedLines, self.added_lines);
        values.set(Metric::RemovedLines, self.removed_lines);
        values
    }

    pub fn unit(&self) -> EnrichmentUnit {
        EnrichmentUnit {
            repository: self.repository.clone(),
            canonical_key: self.canonical_key.clone(),
            date: self.date,
        }
    }
}

/// One (repository, identity, date) triple needing a detail fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EnrichmentUnit {
    pub repository: String,
    pub canonical_key: String,
    pub date: NaiveDate,
}

impl fmt::Display for EnrichmentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.repository, self.canonical_key, self.date)
    }
}

/// Counts derived from the detail records of one enrichment unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetailMetrics {
    /// Distinct task / pull-request records.
    pub tasks: u64,
    pub files_added: u64,
    pub files_deleted: u64,
    pub files_modified: u64,
}

impl DetailMetrics {
    pub fn from_records(records: &[DetailRecord]) -> Self {
        let ids: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let mut metrics = Self {
            tasks: ids.len() as u64,
            ..Self::default()
        };
        for record in records {
            metrics.files_added = metrics.files_added.saturating_add(record.files_added);
            metrics.files_deleted = metrics.files_deleted.saturating_add(record.files_deleted);
            metrics.files_modified = metrics.files_modified.saturating_add(record.files_modified);
        }
        metrics
    }

    pub fn values(&self) -> MetricValues {
        let mut values = MetricValues::default();
        values.set(Metric::Tasks, self.tasks);
        values.set(Metric::FilesAdded, self.files_added);
        values.set(Metric::FilesDeleted, self.files_deleted);
        values.set(Metric::FilesModified, self.files_modified);
        values
    }
}

/// A contributor's position in a top-N listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedContributor {
    pub canonical_key: String,
    pub display_label: String,
    pub value: u64,
    pub totals: MetricValues,
}

/// Per-repository sums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryTotals {
    pub repository: String,
    pub contributors: u64,
    pub totals: MetricValues,
}

/// Whole-report sums.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub totals: MetricValues,
    pub identities: u64,
    pub repositories: u64,
    /// Dates with at least one non-zero value.
    pub active_days: u64,
}
