pub mod builder;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::date_util::DateRange;
use crate::error::{Error, Result};
use crate::identity::IdentityResolver;
use crate::metrics::{AggregationEngine, ReportSnapshot, SnapshotPublisher};
use crate::sync::{CollectRequest, PageWalk};

pub use builder::{ReportBuilder, Step};

/// Hands out build generations. Only the most recent one is current.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter(Arc<AtomicU64>);

impl GenerationCounter {
    /// Start a new generation, making every earlier one stale.
    pub fn bump(&self) -> Generation {
        let value = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            current: self.0.clone(),
            value,
        }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// The generation one build runs under.
#[derive(Debug, Clone)]
pub struct Generation {
    current: Arc<AtomicU64>,
    value: u64,
}

impl Generation {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.value
    }

    pub fn check(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::Superseded {
                generation: self.value,
            })
        }
    }
}

/// Everything one report build accumulates: its selection, alias table,
/// page plan and aggregates.
#[derive(Debug)]
pub struct ReportSession {
    walk: PageWalk,
    resolver: IdentityResolver,
    engine: AggregationEngine,
}

impl ReportSession {
    pub fn new(request: CollectRequest, publisher: SnapshotPublisher) -> Self {
        let mut session = Self {
            walk: PageWalk::new(request),
            resolver: IdentityResolver::new(),
            engine: AggregationEngine::with_publisher(publisher),
        };
        session.reset();
        session
    }

    /// Drop every alias and aggregate, keeping the selection.
    pub fn reset(&mut self) {
        self.resolver.reset();
        self.walk = PageWalk::new(self.walk.request().clone());
        let publisher = self.engine.publisher().cloned();
        self.engine = match publisher {
            Some(publisher) => AggregationEngine::with_publisher(publisher),
            None => AggregationEngine::new(),
        };
    }

    pub fn request(&self) -> &CollectRequest {
        self.walk.request()
    }

    pub fn range(&self) -> DateRange {
        self.walk.request().range
    }

    pub fn walk(&self) -> &PageWalk {
        &self.walk
    }

    pub fn is_collected(&self) -> bool {
        self.walk.next_page().is_none()
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    pub fn snapshot(&self) -> &ReportSnapshot {
        self.engine.snapshot()
    }

    /// Continue this session under a newer build's publisher.
    pub fn rebind(&mut self, publisher: SnapshotPublisher) {
        self.engine.rebind(publisher);
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut PageWalk, &mut IdentityResolver, &mut AggregationEngine) {
        (&mut self.walk, &mut self.resolver, &mut self.engine)
    }
}

/// Which identities the read API shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    All,
    Selected(BTreeSet<String>),
}

impl Visibility {
    pub fn is_visible(&self, canonical_key: &str) -> bool {
        match self {
            Visibility::All => true,
            Visibility::Selected(keys) => keys.contains(canonical_key),
        }
    }

    pub fn apply(&self, snapshot: &ReportSnapshot) -> ReportSnapshot {
        match self {
            Visibility::All => snapshot.clone(),
            Visibility::Selected(keys) => snapshot.filter_visible(keys),
        }
    }
}

/// Summary returned after a build completes.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generation: u64,
    pub selector: String,
    pub range: DateRange,
    pub status: BuildStatus,
    pub pages_fetched: u32,
    pub pages_from_cache: u32,
    pub rows_ingested: u64,
    pub identities: u64,
    pub units_enriched: u64,
    pub units_failed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Raw counters gathered while driving a build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildCounts {
    pub pages_fetched: u32,
    pub pages_from_cache: u32,
    pub rows_ingested: u64,
    pub identities: u64,
    pub units_enriched: u64,
    pub units_failed: u64,
}

impl BuildReport {
    /// Create a BuildReport with the status derived from counts.
    pub fn from_counts(generation: u64, session: &ReportSession, counts: BuildCounts) -> Self {
        let status = if counts.units_failed == 0 {
            BuildStatus::Success
        } else if counts.units_enriched > 0 || counts.rows_ingested > 0 {
            BuildStatus::PartialFailure
        } else {
            BuildStatus::Failed
        };
        let error = if counts.units_failed > 0 {
            Some(format!("{} enrichment units failed", counts.units_failed))
        } else {
            None
        };
        Self {
            generation,
            selector: session.request().selector.to_string(),
            range: session.range(),
            status,
            pages_fetched: counts.pages_fetched,
            pages_from_cache: counts.pages_from_cache,
            rows_ingested: counts.rows_ingested,
            identities: counts.identities,
            units_enriched: counts.units_enriched,
            units_failed: counts.units_failed,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_latest_generation_is_current() {
        let counter = GenerationCounter::default();
        let first = counter.bump();
        assert!(first.check().is_ok());
        let second = counter.bump();
        assert!(!first.is_current());
        assert!(matches!(first.check(), Err(Error::Superseded { generation: 1 })));
        assert!(second.is_current());
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_visibility() {
        assert!(Visibility::All.is_visible("anyone"));
        let selected = Visibility::Selected(["alice".to_string()].into());
        assert!(selected.is_visible("alice"));
        assert!(!selected.is_visible("bob"));
        assert!(!Visibility::Selected(BTreeSet::new()).is_visible("alice"));
    }
}
