use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::metrics::{enrich_unit, ContributionRow, EnrichmentUnit};
use crate::progress::{BuildPhase, ProgressEvent, ProgressReporter, ProgressTracker};
use crate::report::{BuildCounts, BuildReport, Generation, ReportSession};
use crate::source::{DetailSource, PagedSource};
use crate::sync::PaginatedCollector;

pub const UNITS_LABEL: &str = "Enriching";

/// One unit of build work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetch and ingest page `i` (1-based).
    FetchPage(u32),
    /// Enrich the `j`-th planned unit (0-based).
    EnrichUnit(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub include_enrichment: bool,
    pub request_delay: Duration,
}

/// Drives one build of a session step by step.
///
/// Pages come first, in order. Once the last page is in and enrichment was
/// requested, the pending units are frozen into a plan and enriched one at a
/// time. The generation is checked before every step, so a superseded build
/// stops at the next step boundary.
pub struct ReportBuilder<'a, S> {
    source: &'a S,
    session: &'a mut ReportSession,
    collector: PaginatedCollector<'a, S>,
    tracker: ProgressTracker,
    generation: Generation,
    include_enrichment: bool,
    units: Option<Vec<EnrichmentUnit>>,
    next_unit: usize,
    counts: BuildCounts,
}

impl<'a, S: PagedSource + DetailSource> ReportBuilder<'a, S> {
    pub fn new(
        source: &'a S,
        session: &'a mut ReportSession,
        cache: Arc<Mutex<PageCache>>,
        generation: Generation,
        options: BuildOptions,
        listeners: Vec<Arc<dyn ProgressReporter>>,
    ) -> Self {
        let mut builder = Self {
            source,
            session,
            collector: PaginatedCollector::new(source, cache, options.request_delay),
            tracker: ProgressTracker::new(listeners).for_generation(generation.clone()),
            generation,
            include_enrichment: options.include_enrichment,
            units: None,
            next_unit: 0,
            counts: BuildCounts::default(),
        };
        builder.plan_units();
        builder
    }

    fn plan_units(&mut self) {
        if self.units.is_some() || !self.include_enrichment || !self.session.is_collected() {
            return;
        }
        let units = self.session.engine().pending_units();
        log::info!("Enrichment planned for {} units", units.len());
        self.units = Some(units);
    }

    /// The step that would run next, if any.
    pub fn next_step(&self) -> Option<Step> {
        if let Some(index) = self.session.walk().next_page() {
            return Some(Step::FetchPage(index));
        }
        match &self.units {
            Some(units) if self.next_unit < units.len() => Some(Step::EnrichUnit(self.next_unit)),
            _ => None,
        }
    }

    pub fn counts(&self) -> BuildCounts {
        self.counts
    }

    pub fn phase(&self) -> &BuildPhase {
        self.tracker.phase()
    }

    pub async fn execute(&mut self, step: Step) -> Result<()> {
        self.generation.check()?;
        match step {
            Step::FetchPage(index) => self.fetch_page(index).await,
            Step::EnrichUnit(j) => self.enrich(j).await,
        }
    }

    async fn fetch_page(&mut self, index: u32) -> Result<()> {
        self.tracker.advance(BuildPhase::Collecting)?;
        let (walk, resolver, engine) = self.session.parts_mut();
        let fetched = self.collector.fetch(walk, index).await?;
        if fetched.from_cache {
            self.counts.pages_from_cache += 1;
        } else {
            self.counts.pages_fetched += 1;
        }

        let rows: Vec<ContributionRow> = fetched
            .page
            .rows
            .iter()
            .map(|r| {
                let identity = resolver.resolve(
                    r.login.as_deref(),
                    r.display_name.as_deref(),
                    r.email.as_deref(),
                );
                ContributionRow::from_record(r, identity)
            })
            .collect();
        engine.ingest(&rows)?;
        self.counts.rows_ingested += rows.len() as u64;

        let event = walk.progress();
        self.tracker.report(event);
        self.plan_units();
        Ok(())
    }

    async fn enrich(&mut self, j: usize) -> Result<()> {
        self.tracker.advance(BuildPhase::Enriching)?;
        let Some(units) = &self.units else {
            return Err(Error::Other("enrichment was not planned".into()));
        };
        let total = units.len();
        let unit = units
            .get(j)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no enrichment unit {j} (of {total})")))?;
        let handle = self
            .session
            .resolver()
            .identity(&unit.canonical_key)
            .map(|identity| identity.query_handle.clone())
            .unwrap_or_else(|| unit.canonical_key.clone());

        self.collector.pacer_mut().pace().await;
        let result = enrich_unit(self.source, &unit, &handle).await;
        self.collector.pacer_mut().finished();

        match result {
            Ok((metrics, records)) => {
                let (_, _, engine) = self.session.parts_mut();
                engine.apply_enrichment(&unit, metrics, records)?;
                self.counts.units_enriched += 1;
            }
            Err(e) => {
                log::warn!("{e}; counting the unit as zero");
                self.counts.units_failed += 1;
            }
        }

        self.next_unit = j + 1;
        self.tracker
            .report(ProgressEvent::new(UNITS_LABEL, (j + 1) as u64, total as u64));
        Ok(())
    }

    async fn drive(&mut self) -> Result<()> {
        while let Some(step) = self.next_step() {
            log::trace!("Running {step:?}");
            self.execute(step).await?;
        }
        self.generation.check()
    }

    /// Run every remaining step. Progress is cleared whatever the outcome.
    pub async fn run(mut self) -> Result<BuildReport> {
        let outcome = self.drive().await;
        self.tracker.finish(outcome.as_ref().map(|_| ()));
        outcome?;

        self.counts.identities = self.session.resolver().len() as u64;
        let report = BuildReport::from_counts(self.generation.value(), self.session, self.counts);
        log::info!(
            "Build {} finished: {} rows, {} identities, {} pages fetched ({} cached), {} units enriched, {} failed",
            report.generation,
            report.rows_ingested,
            report.identities,
            report.pages_fetched,
            report.pages_from_cache,
            report.units_enriched,
            report.units_failed
        );
        Ok(report)
    }
}
