pub mod types;

pub use types::*;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::identity::ResolvedIdentity;
use crate::report::Generation;
use crate::source::{DetailRecord, DetailRequest, DetailSource};

/// Channel carrying the latest published snapshot, if any build has published.
pub type SnapshotSender = watch::Sender<Option<Arc<ReportSnapshot>>>;
pub type SnapshotReceiver = watch::Receiver<Option<Arc<ReportSnapshot>>>;

/// Finished (or in-progress) aggregates of one report session.
///
/// Every method here is a pure read; nothing mutates a published snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportSnapshot {
    pub generation: u64,
    labels: BTreeMap<String, String>,
    totals: BTreeMap<String, MetricValues>,
    series: BTreeMap<String, BTreeMap<NaiveDate, MetricValues>>,
    by_repository: BTreeMap<String, BTreeMap<String, MetricValues>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    details: BTreeMap<String, Vec<DetailRecord>>,
}

impl ReportSnapshot {
    /// Top `n` identities by `metric`, highest first. Ties fall back to the
    /// display label, then the key.
    pub fn top_n(&self, metric: Metric, n: usize) -> Vec<RankedContributor> {
        let mut ranked: Vec<RankedContributor> = self
            .totals
            .iter()
            .map(|(key, totals)| RankedContributor {
                canonical_key: key.clone(),
                display_label: self.display_label(key).unwrap_or(key).to_string(),
                value: totals.get(metric),
                totals: *totals,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.display_label.cmp(&b.display_label))
                .then_with(|| a.canonical_key.cmp(&b.canonical_key))
        });
        ranked.truncate(n);
        ranked
    }

    /// Per-date values of one identity, oldest first.
    pub fn time_series(&self, canonical_key: &str) -> Vec<TimeSeriesPoint> {
        self.series
            .get(canonical_key)
            .map(|points| {
                points
                    .iter()
                    .map(|(date, values)| TimeSeriesPoint {
                        date: *date,
                        values: *values,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn totals(&self, canonical_key: &str) -> Option<MetricValues> {
        self.totals.get(canonical_key).copied()
    }

    pub fn all_identities(&self) -> Vec<ResolvedIdentity> {
        self.labels
            .iter()
            .map(|(key, label)| ResolvedIdentity {
                canonical_key: key.clone(),
                display_label: label.clone(),
            })
            .collect()
    }

    pub fn display_label(&self, canonical_key: &str) -> Option<&str> {
        self.labels.get(canonical_key).map(String::as_str)
    }

    /// Detail records gathered for one identity during enrichment.
    pub fn details_for(&self, canonical_key: &str) -> &[DetailRecord] {
        self.details
            .get(canonical_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Copy restricted to the given identities.
    pub fn filter_visible(&self, visible: &BTreeSet<String>) -> ReportSnapshot {
        fn keep<V: Clone>(map: &BTreeMap<String, V>, visible: &BTreeSet<String>) -> BTreeMap<String, V> {
            map.iter()
                .filter(|(k, _)| visible.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }

        ReportSnapshot {
            generation: self.generation,
            labels: keep(&self.labels, visible),
            totals: keep(&self.totals, visible),
            series: keep(&self.series, visible),
            by_repository: self
                .by_repository
                .iter()
                .map(|(repo, per_identity)| (repo.clone(), keep(per_identity, visible)))
                .filter(|(_, per_identity)| !per_identity.is_empty())
                .collect(),
            details: keep(&self.details, visible),
        }
    }

    pub fn repository_totals(&self) -> Vec<RepositoryTotals> {
        self.by_repository
            .iter()
            .map(|(repository, per_identity)| RepositoryTotals {
                repository: repository.clone(),
                contributors: per_identity.len() as u64,
                totals: per_identity
                    .values()
                    .fold(MetricValues::default(), |acc, v| acc + *v),
            })
            .collect()
    }

    pub fn summary(&self) -> ReportSummary {
        let active_days: BTreeSet<NaiveDate> = self
            .series
            .values()
            .flat_map(|points| points.iter())
            .filter(|(_, values)| !values.is_zero())
            .map(|(date, _)| *date)
            .collect();
        ReportSummary {
            totals: self
                .totals
                .values()
                .fold(MetricValues::default(), |acc, v| acc + *v),
            identities: self.labels.len() as u64,
            repositories: self.by_repository.len() as u64,
            active_days: active_days.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Publishes snapshots for one build, refusing once the build is stale.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    tx: Arc<SnapshotSender>,
    generation: Generation,
}

impl SnapshotPublisher {
    pub fn new(tx: Arc<SnapshotSender>, generation: Generation) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Replace the published snapshot. The generation check runs under the
    /// channel's write lock, so a stale build can never overwrite a newer one.
    pub fn publish(&self, snapshot: &ReportSnapshot) -> Result<()> {
        let mut published = false;
        self.tx.send_if_modified(|slot| {
            if !self.generation.is_current() {
                return false;
            }
            *slot = Some(Arc::new(snapshot.clone()));
            published = true;
            true
        });
        if published {
            Ok(())
        } else {
            Err(Error::Superseded {
                generation: self.generation.value(),
            })
        }
    }
}

/// Folds contribution rows and enrichment results into running aggregates.
///
/// All mutation is additive: totals, per-date series and per-repository
/// sums only ever grow, and a snapshot is republished after every batch.
#[derive(Debug, Default)]
pub struct AggregationEngine {
    state: ReportSnapshot,
    units: BTreeSet<EnrichmentUnit>,
    enriched: BTreeSet<EnrichmentUnit>,
    rows_ingested: u64,
    publisher: Option<SnapshotPublisher>,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(publisher: SnapshotPublisher) -> Self {
        let mut engine = Self::new();
        engine.state.generation = publisher.generation().value();
        engine.publisher = Some(publisher);
        engine
    }

    pub fn snapshot(&self) -> &ReportSnapshot {
        &self.state
    }

    pub fn publisher(&self) -> Option<&SnapshotPublisher> {
        self.publisher.as_ref()
    }

    pub fn rows_ingested(&self) -> u64 {
        self.rows_ingested
    }

    fn publish(&self) -> Result<()> {
        match &self.publisher {
            Some(publisher) => publisher.publish(&self.state),
            None => Ok(()),
        }
    }

    fn add(&mut self, repository: &str, canonical_key: &str, date: NaiveDate, values: MetricValues) {
        *self.state.totals.entry(canonical_key.to_string()).or_default() += values;
        *self
            .state
            .series
            .entry(canonical_key.to_string())
            .or_default()
            .entry(date)
            .or_default() += values;
        *self
            .state
            .by_repository
            .entry(repository.to_string())
            .or_default()
            .entry(canonical_key.to_string())
            .or_default() += values;
    }

    /// Add one batch of rows and republish.
    pub fn ingest(&mut self, rows: &[ContributionRow]) -> Result<()> {
        for row in rows {
            self.state
                .labels
                .entry(row.canonical_key.clone())
                .or_insert_with(|| row.display_label.clone());
            self.add(&row.repository, &row.canonical_key, row.date, row.values());
            self.units.insert(row.unit());
        }
        self.rows_ingested += rows.len() as u64;
        log::trace!("Ingested {} rows ({} units known)", rows.len(), self.units.len());
        self.publish()
    }

    /// Add the derived metrics of one enrichment unit and republish.
    pub fn apply_enrichment(
        &mut self,
        unit: &EnrichmentUnit,
        metrics: DetailMetrics,
        records: Vec<DetailRecord>,
    ) -> Result<()> {
        if !self.enriched.insert(unit.clone()) {
            log::debug!("Unit {unit} already enriched; ignoring");
            return Ok(());
        }
        self.add(&unit.repository, &unit.canonical_key, unit.date, metrics.values());
        if !records.is_empty() {
            self.state
                .details
                .entry(unit.canonical_key.clone())
                .or_default()
                .extend(records);
        }
        self.publish()
    }

    /// Units still lacking a successful enrichment, in stable order.
    pub fn pending_units(&self) -> Vec<EnrichmentUnit> {
        self.units.difference(&self.enriched).cloned().collect()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn is_enriched(&self, unit: &EnrichmentUnit) -> bool {
        self.enriched.contains(unit)
    }

    /// Move the aggregates under a new build's publisher.
    pub fn rebind(&mut self, publisher: SnapshotPublisher) {
        self.state.generation = publisher.generation().value();
        self.publisher = Some(publisher);
    }
}

/// Fetch the detail records behind one unit and derive its metrics.
///
/// `handle` is the upstream handle of the unit's identity. Failures carry
/// the unit key so the caller can log and skip just this unit.
pub async fn enrich_unit<D: DetailSource>(
    source: &D,
    unit: &EnrichmentUnit,
    handle: &str,
) -> Result<(DetailMetrics, Vec<DetailRecord>)> {
    let request = DetailRequest {
        repository: unit.repository.clone(),
        identity: handle.to_string(),
        date: unit.date,
    };
    let records = source
        .fetch_details(&request)
        .await
        .map_err(|e| Error::UnitFetch {
            unit: unit.to_string(),
            source: Box::new(e),
        })?;
    Ok((DetailMetrics::from_records(&records), records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::GenerationCounter;
    use proptest::prelude::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn row(repo: &str, key: &str, day: u32, c: u64, added: u64, removed: u64) -> ContributionRow {
        ContributionRow {
            repository: repo.into(),
            canonical_key: key.into(),
            display_label: key.into(),
            date: d(day),
            contributions: c,
            added_lines: added,
            removed_lines: removed,
        }
    }

    fn detail(id: &str, added: u64, deleted: u64, modified: u64) -> DetailRecord {
        DetailRecord {
            id: id.into(),
            task_ref: Some(format!("TASK-{id}")),
            branch_name: None,
            file_change_count: added + deleted + modified,
            files_added: added,
            files_deleted: deleted,
            files_modified: modified,
            approver: None,
            date: d(1),
            external_link: None,
        }
    }

    #[test]
    fn test_alice_scenario() {
        let mut engine = AggregationEngine::new();
        engine
            .ingest(&[row("a/b", "alice", 1, 3, 10, 2), row("a/b", "alice", 2, 1, 1, 0)])
            .unwrap();

        let snap = engine.snapshot();
        let totals = snap.totals("alice").unwrap();
        assert_eq!(totals.get(Metric::Contributions), 4);
        assert_eq!(totals.get(Metric::AddedLines), 11);
        assert_eq!(totals.get(Metric::RemovedLines), 2);

        let series = snap.time_series("alice");
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].date, d(1));
        assert_eq!(series[0].values.get(Metric::Contributions), 3);
        assert_eq!(series[1].date, d(2));
        assert_eq!(series[1].values.get(Metric::Contributions), 1);
        assert_eq!(engine.pending_units().len(), 2);
    }

    #[test]
    fn test_batches_add_up() {
        let mut engine = AggregationEngine::new();
        engine.ingest(&[row("a/b", "bob", 1, 1, 0, 0)]).unwrap();
        engine.ingest(&[row("c/d", "bob", 1, 2, 0, 0)]).unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.totals("bob").unwrap().get(Metric::Contributions), 3);
        assert_eq!(snap.time_series("bob").len(), 1);
        let repos = snap.repository_totals();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[1].totals.get(Metric::Contributions), 2);
        assert_eq!(engine.rows_ingested(), 2);
    }

    #[test]
    fn test_enrichment_adds_detail_metrics() {
        let mut engine = AggregationEngine::new();
        engine.ingest(&[row("a/b", "alice", 1, 3, 10, 2)]).unwrap();
        let unit = engine.pending_units().remove(0);
        let records = vec![detail("1", 2, 0, 1), detail("2", 0, 1, 4)];
        let metrics = DetailMetrics::from_records(&records);
        engine.apply_enrichment(&unit, metrics, records).unwrap();
        // Applying the same unit again is a no-op.
        engine.apply_enrichment(&unit, metrics, Vec::new()).unwrap();

        let snap = engine.snapshot();
        let totals = snap.totals("alice").unwrap();
        assert_eq!(totals.get(Metric::Tasks), 2);
        assert_eq!(totals.get(Metric::FilesModified), 5);
        assert_eq!(totals.get(Metric::Contributions), 3);
        assert_eq!(snap.details_for("alice").len(), 2);
        assert!(engine.pending_units().is_empty());
    }

    #[test]
    fn test_top_n_and_visibility_are_read_only() {
        let mut engine = AggregationEngine::new();
        engine
            .ingest(&[
                row("a/b", "alice", 1, 3, 0, 0),
                row("a/b", "bob", 1, 5, 0, 0),
                row("a/b", "carol", 1, 3, 0, 0),
            ])
            .unwrap();
        let snap = engine.snapshot().clone();

        let top = snap.top_n(Metric::Contributions, 2);
        let keys: Vec<&str> = top.iter().map(|r| r.canonical_key.as_str()).collect();
        assert_eq!(keys, vec!["bob", "alice"]);
        assert!(snap.top_n(Metric::Contributions, 0).is_empty());

        let visible: BTreeSet<String> = ["carol".to_string()].into();
        let filtered = snap.filter_visible(&visible);
        assert_eq!(filtered.all_identities().len(), 1);
        assert_eq!(filtered.summary().totals.get(Metric::Contributions), 3);
        assert_eq!(snap.all_identities().len(), 3);
        assert_eq!(engine.snapshot().summary().identities, 3);
    }

    #[test]
    fn test_summary_counts_active_days() {
        let mut engine = AggregationEngine::new();
        engine
            .ingest(&[
                row("a/b", "alice", 1, 1, 0, 0),
                row("a/b", "bob", 1, 1, 0, 0),
                row("a/b", "bob", 3, 0, 0, 0),
            ])
            .unwrap();
        let summary = engine.snapshot().summary();
        assert_eq!(summary.identities, 2);
        assert_eq!(summary.active_days, 1);
        assert_eq!(summary.repositories, 1);
    }

    #[test]
    fn test_stale_publisher_is_refused() {
        let counter = GenerationCounter::default();
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let mut engine = AggregationEngine::with_publisher(SnapshotPublisher::new(tx, counter.bump()));
        engine.ingest(&[row("a/b", "alice", 1, 1, 0, 0)]).unwrap();
        assert!(rx.borrow().is_some());

        counter.bump();
        let err = engine.ingest(&[row("a/b", "alice", 2, 1, 0, 0)]).unwrap_err();
        assert!(matches!(err, Error::Superseded { generation: 1 }));
        let published = rx.borrow().clone().unwrap();
        assert_eq!(published.time_series("alice").len(), 1);
    }

    struct FailingDetails;

    impl DetailSource for FailingDetails {
        async fn fetch_details(&self, _request: &DetailRequest) -> Result<Vec<DetailRecord>> {
            Err(Error::upstream("GET /details", "HTTP 500"))
        }
    }

    #[tokio::test]
    async fn test_enrich_unit_failure_names_the_unit() {
        let unit = EnrichmentUnit {
            repository: "a/b".into(),
            canonical_key: "alice".into(),
            date: d(1),
        };
        let err = enrich_unit(&FailingDetails, &unit, "alice").await.unwrap_err();
        match err {
            Error::UnitFetch { unit, .. } => assert_eq!(unit, "a/b:alice@2024-01-01"),
            other => panic!("unexpected error: {other}"),
        }
    }

    fn arb_row() -> impl Strategy<Value = ContributionRow> {
        (
            prop::sample::select(vec!["a/b", "c/d"]),
            prop::sample::select(vec!["alice", "bob", "carol"]),
            1u32..10,
            0u64..50,
            0u64..500,
            0u64..500,
        )
            .prop_map(|(repo, key, day, c, a, r)| row(repo, key, day, c, a, r))
    }

    proptest! {
        #[test]
        fn prop_series_sums_to_totals(
            batches in prop::collection::vec(prop::collection::vec(arb_row(), 0..20), 1..5),
            tasks in 0u64..5,
        ) {
            let mut engine = AggregationEngine::new();
            for batch in &batches {
                engine.ingest(batch).unwrap();
            }
            for unit in engine.pending_units() {
                let metrics = DetailMetrics { tasks, files_added: 1, files_deleted: 0, files_modified: 2 };
                engine.apply_enrichment(&unit, metrics, Vec::new()).unwrap();
            }

            let snap = engine.snapshot();
            for identity in snap.all_identities() {
                let totals = snap.totals(&identity.canonical_key).unwrap();
                let mut summed = MetricValues::default();
                for point in snap.time_series(&identity.canonical_key) {
                    summed += point.values;
                }
                for metric in Metric::ALL {
                    prop_assert_eq!(summed.get(metric), totals.get(metric));
                }
            }
        }
    }
}
