pub mod cache;
pub mod config;
pub mod date_util;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod period;
pub mod progress;
pub mod report;
pub mod source;
pub mod sync;

pub use config::{Config, ConfigStore};
pub use date_util::DateRange;
pub use error::{Error, Result};
pub use identity::{CanonicalIdentity, IdentityResolver, ResolvedIdentity};
pub use metrics::{
    Metric, MetricValues, RankedContributor, ReportSnapshot, ReportSummary, RepositoryTotals,
    SnapshotReceiver, TimeSeriesPoint,
};
pub use period::Period;
pub use progress::{BuildPhase, NoopProgress, ProgressEvent, ProgressReporter};
pub use report::{BuildReport, BuildStatus, Visibility};
pub use source::{
    DetailRecord, DetailSource, FixtureSource, HttpSource, PagedSource, RawContributionRecord,
    Selector,
};

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use cache::{BoundedCache, PageCache};
use metrics::{SnapshotPublisher, SnapshotSender};
use progress::ProgressState;
use report::builder::BuildOptions;
use report::{GenerationCounter, ReportBuilder, ReportSession};
use sync::CollectRequest;

/// Main entry point: builds contributor reports from one upstream and
/// serves the latest one to readers.
///
/// Builds may overlap; the most recently started one wins and any older
/// build stops at its next step without publishing.
pub struct ContribReport<S> {
    source: S,
    config: Config,
    cache: Arc<Mutex<PageCache>>,
    generations: GenerationCounter,
    snapshots: Arc<SnapshotSender>,
    last_session: Mutex<Option<ReportSession>>,
    visibility: Mutex<Visibility>,
    listeners: Mutex<Vec<Arc<dyn ProgressReporter>>>,
    state: Arc<ProgressState>,
}

impl ContribReport<HttpSource> {
    /// Report over the HTTP upstream described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let source = HttpSource::from_config(&config)?;
        Ok(Self::new(source, config))
    }
}

impl<S: PagedSource + DetailSource> ContribReport<S> {
    pub fn new(source: S, config: Config) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            cache: Arc::new(Mutex::new(BoundedCache::new(
                config.cache_ttl(),
                config.cache_capacity,
            ))),
            source,
            config,
            generations: GenerationCounter::default(),
            snapshots: Arc::new(tx),
            last_session: Mutex::new(None),
            visibility: Mutex::new(Visibility::All),
            listeners: Mutex::new(Vec::new()),
            state: Arc::new(ProgressState::default()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Control API ────────────────────────────────────────────────

    /// Collect every page for `selector` over `range` into a fresh session,
    /// then enrich it if asked.
    pub async fn start_build(
        &self,
        selector: Selector,
        range: DateRange,
        include_enrichment: bool,
    ) -> Result<BuildReport> {
        selector.validate()?;
        self.source.check_credentials()?;

        let generation = self.generations.bump();
        log::info!(
            "Starting build {} for {selector} over {range}{}",
            generation.value(),
            if include_enrichment { " with enrichment" } else { "" }
        );
        self.set_visibility(Visibility::All);

        let request = CollectRequest {
            selector,
            range,
            per_page: self.config.page_size,
        };
        let publisher = SnapshotPublisher::new(self.snapshots.clone(), generation.clone());
        let mut session = ReportSession::new(request, publisher);

        let result = ReportBuilder::new(
            &self.source,
            &mut session,
            self.cache.clone(),
            generation.clone(),
            self.build_options(include_enrichment),
            self.listeners(),
        )
        .run()
        .await;

        match result {
            Ok(report) => {
                self.keep_session(&generation, session);
                Ok(report)
            }
            Err(e) => {
                log::error!("Build {} failed: {e}", generation.value());
                Err(e)
            }
        }
    }

    /// Enrich the last completed report. Units already enriched are skipped,
    /// so this also retries units that failed before.
    pub async fn enrich_current(&self) -> Result<BuildReport> {
        self.source.check_credentials()?;
        let mut session = self
            .last_session
            .lock()
            .map_err(|_| Error::Other("session lock poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Misconfiguration("no prior report to build from".into()))?;

        let generation = self.generations.bump();
        log::info!(
            "Enriching report for {} as build {}",
            session.request().selector,
            generation.value()
        );
        session.rebind(SnapshotPublisher::new(
            self.snapshots.clone(),
            generation.clone(),
        ));

        let result = ReportBuilder::new(
            &self.source,
            &mut session,
            self.cache.clone(),
            generation.clone(),
            self.build_options(true),
            self.listeners(),
        )
        .run()
        .await;

        // A failed pass leaves the session in place so it can be retried.
        self.keep_session(&generation, session);
        result.inspect_err(|e| log::error!("Enrichment {} failed: {e}", generation.value()))
    }

    /// Register a listener for progress events of every later build.
    pub fn on_progress(&self, reporter: Arc<dyn ProgressReporter>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(reporter);
        }
    }

    /// Observe every published snapshot.
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.snapshots.subscribe()
    }

    pub fn set_visible_identities<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        self.set_visibility(Visibility::Selected(keys));
    }

    pub fn select_all(&self) {
        self.set_visibility(Visibility::All);
    }

    pub fn clear_all(&self) {
        self.set_visibility(Visibility::Selected(BTreeSet::new()));
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Forget every cached page so the next build goes to the upstream.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Phase of the most recent build.
    pub fn phase(&self) -> BuildPhase {
        self.state.phase()
    }

    /// Progress of the step in flight, if any.
    pub fn progress(&self) -> Option<ProgressEvent> {
        self.state.current()
    }

    // ── Read API ───────────────────────────────────────────────────

    /// Latest published snapshot, unfiltered.
    pub fn latest(&self) -> Option<Arc<ReportSnapshot>> {
        self.snapshots.borrow().clone()
    }

    /// Latest snapshot restricted to the visible identities.
    pub fn snapshot(&self) -> Option<ReportSnapshot> {
        let latest = self.latest()?;
        Some(self.visibility().apply(&latest))
    }

    pub fn top_n(&self, metric: Metric, n: usize) -> Vec<RankedContributor> {
        self.snapshot()
            .map(|s| s.top_n(metric, n))
            .unwrap_or_default()
    }

    pub fn time_series(&self, canonical_key: &str) -> Vec<TimeSeriesPoint> {
        if !self.visibility().is_visible(canonical_key) {
            return Vec::new();
        }
        self.latest()
            .map(|s| s.time_series(canonical_key))
            .unwrap_or_default()
    }

    /// Every identity of the latest report, visible or not.
    pub fn all_identities(&self) -> Vec<ResolvedIdentity> {
        self.latest()
            .map(|s| s.all_identities())
            .unwrap_or_default()
    }

    pub fn display_label(&self, canonical_key: &str) -> Option<String> {
        self.latest()?
            .display_label(canonical_key)
            .map(str::to_string)
    }

    pub fn details_for(&self, canonical_key: &str) -> Vec<DetailRecord> {
        self.latest()
            .map(|s| s.details_for(canonical_key).to_vec())
            .unwrap_or_default()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn build_options(&self, include_enrichment: bool) -> BuildOptions {
        BuildOptions {
            include_enrichment,
            request_delay: self.config.request_delay(),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ProgressReporter>> {
        let mut all: Vec<Arc<dyn ProgressReporter>> = vec![self.state.clone()];
        if let Ok(listeners) = self.listeners.lock() {
            all.extend(listeners.iter().cloned());
        }
        all
    }

    fn set_visibility(&self, visibility: Visibility) {
        if let Ok(mut current) = self.visibility.lock() {
            *current = visibility;
        }
    }

    /// Keep a collected session for `enrich_current`. A superseded build's
    /// session only fills an empty slot, so the last collected report stays
    /// available until a newer build completes.
    fn keep_session(&self, generation: &report::Generation, session: ReportSession) {
        if !session.is_collected() {
            return;
        }
        if let Ok(mut last) = self.last_session.lock() {
            if generation.is_current() || last.is_none() {
                *last = Some(session);
            }
        }
    }
}
