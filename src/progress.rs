use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::report::Generation;

/// One progress update: `processed` of `total` steps under `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub label: String,
    pub processed: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(label: impl Into<String>, processed: u64, total: u64) -> Self {
        Self {
            label: label.into(),
            processed,
            total,
        }
    }
}

/// Phase of one report build.
///
/// `Idle -> Collecting -> [Enriching ->] Done`; any running phase may move
/// to `Failed`, which returns to `Idle` once surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BuildPhase {
    Idle,
    Collecting,
    Enriching,
    Done,
    Failed(String),
}

impl BuildPhase {
    pub fn can_advance_to(&self, next: &BuildPhase) -> bool {
        use BuildPhase::*;
        matches!(
            (self, next),
            (Idle | Done, Collecting)
                | (Idle | Done, Enriching)
                | (Collecting, Enriching)
                | (Collecting | Enriching, Done)
                | (Collecting | Enriching, Failed(_))
                | (Failed(_), Idle)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BuildPhase::Collecting | BuildPhase::Enriching)
    }
}

/// Receives status updates while a report is being built.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    /// No build step is in progress any more.
    fn on_clear(&self) {}

    fn on_phase(&self, _phase: &BuildPhase) {}
}

/// No-op progress reporter.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Latest phase and progress of the most recent build, for polling readers.
#[derive(Debug, Default)]
pub struct ProgressState {
    inner: Mutex<(Option<BuildPhase>, Option<ProgressEvent>)>,
}

impl ProgressState {
    pub fn phase(&self) -> BuildPhase {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.0.clone())
            .unwrap_or(BuildPhase::Idle)
    }

    pub fn current(&self) -> Option<ProgressEvent> {
        self.inner.lock().ok().and_then(|s| s.1.clone())
    }
}

impl ProgressReporter for ProgressState {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut s) = self.inner.lock() {
            s.1 = Some(event.clone());
        }
    }

    fn on_clear(&self) {
        if let Ok(mut s) = self.inner.lock() {
            s.1 = None;
        }
    }

    fn on_phase(&self, phase: &BuildPhase) {
        if let Ok(mut s) = self.inner.lock() {
            s.0 = Some(phase.clone());
        }
    }
}

/// Drives the phase machine of one build and fans events out to listeners.
///
/// Listeners are shared between builds. Once a tracker's generation is
/// superseded it stops notifying them, so a stale build can never overwrite
/// the phase or progress of the build that replaced it.
pub struct ProgressTracker {
    phase: BuildPhase,
    current: Option<ProgressEvent>,
    listeners: Vec<Arc<dyn ProgressReporter>>,
    generation: Option<Generation>,
}

impl ProgressTracker {
    pub fn new(listeners: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self {
            phase: BuildPhase::Idle,
            current: None,
            listeners,
            generation: None,
        }
    }

    /// Only notify listeners while `generation` is current.
    pub fn for_generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn phase(&self) -> &BuildPhase {
        &self.phase
    }

    pub fn current(&self) -> Option<&ProgressEvent> {
        self.current.as_ref()
    }

    fn listeners(&self) -> &[Arc<dyn ProgressReporter>] {
        match &self.generation {
            Some(generation) if !generation.is_current() => &[],
            _ => &self.listeners[..],
        }
    }

    pub fn advance(&mut self, next: BuildPhase) -> Result<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_advance_to(&next) {
            return Err(Error::Other(format!(
                "invalid build transition {:?} -> {next:?}",
                self.phase
            )));
        }
        log::debug!("Build phase {:?} -> {next:?}", self.phase);
        self.phase = next;
        for listener in self.listeners() {
            listener.on_phase(&self.phase);
        }
        Ok(())
    }

    pub fn report(&mut self, event: ProgressEvent) {
        for listener in self.listeners() {
            listener.on_progress(&event);
        }
        self.current = Some(event);
    }

    /// Clear progress and settle the phase after the build ends either way.
    pub fn finish(&mut self, outcome: std::result::Result<(), &Error>) {
        self.current = None;
        for listener in self.listeners() {
            listener.on_clear();
        }
        match outcome {
            Ok(()) => self.settle(BuildPhase::Done),
            Err(e) => {
                if self.phase.is_running() {
                    self.settle(BuildPhase::Failed(e.to_string()));
                }
                self.settle(BuildPhase::Idle);
            }
        }
    }

    fn settle(&mut self, next: BuildPhase) {
        if let Err(e) = self.advance(next) {
            log::debug!("Ignoring phase change while finishing: {e}");
        }
    }
}

/// Collects every event, for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    phases: Mutex<Vec<BuildPhase>>,
    clears: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RecordingProgress {
    pub(crate) fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn phases(&self) -> Vec<BuildPhase> {
        self.phases.lock().unwrap().clone()
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_clear(&self) {
        self.clears.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_phase(&self, phase: &BuildPhase) {
        self.phases.lock().unwrap().push(phase.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use BuildPhase::*;
        assert!(Idle.can_advance_to(&Collecting));
        assert!(Collecting.can_advance_to(&Enriching));
        assert!(Collecting.can_advance_to(&Done));
        assert!(Enriching.can_advance_to(&Failed("x".into())));
        assert!(Failed("x".into()).can_advance_to(&Idle));
        assert!(!Idle.can_advance_to(&Done));
        assert!(!Enriching.can_advance_to(&Collecting));
        assert!(!Failed("x".into()).can_advance_to(&Collecting));
    }

    #[test]
    fn test_failure_clears_and_returns_to_idle() {
        let recorder = Arc::new(RecordingProgress::default());
        let mut tracker = ProgressTracker::new(vec![recorder.clone()]);
        tracker.advance(BuildPhase::Collecting).unwrap();
        tracker.report(ProgressEvent::new("Fetching pages", 1, 5));
        let err = Error::upstream("GET /contributions", "HTTP 500");
        tracker.finish(Err(&err));

        assert_eq!(tracker.phase(), &BuildPhase::Idle);
        assert!(tracker.current().is_none());
        assert_eq!(recorder.clears(), 1);
        let phases = recorder.phases();
        assert_eq!(phases.len(), 3);
        assert!(matches!(phases[1], BuildPhase::Failed(_)));
    }

    #[test]
    fn test_superseded_tracker_goes_quiet() {
        let counter = crate::report::GenerationCounter::default();
        let recorder = Arc::new(RecordingProgress::default());
        let mut tracker =
            ProgressTracker::new(vec![recorder.clone()]).for_generation(counter.bump());
        tracker.advance(BuildPhase::Collecting).unwrap();
        tracker.report(ProgressEvent::new("Fetching pages", 1, 4));

        counter.bump();
        tracker.report(ProgressEvent::new("Fetching pages", 2, 4));
        tracker.finish(Err(&Error::Superseded { generation: 1 }));

        assert_eq!(tracker.phase(), &BuildPhase::Idle);
        assert_eq!(recorder.phases(), vec![BuildPhase::Collecting]);
        assert_eq!(recorder.events().len(), 1);
        assert_eq!(recorder.clears(), 0);
    }

    #[test]
    fn test_finish_without_running_phase_stays_idle() {
        let recorder = Arc::new(RecordingProgress::default());
        let mut tracker = ProgressTracker::new(vec![recorder.clone()]);
        tracker.finish(Ok(()));
        assert_eq!(tracker.phase(), &BuildPhase::Idle);
        assert!(recorder.phases().is_empty());
        assert_eq!(recorder.clears(), 1);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut tracker = ProgressTracker::new(Vec::new());
        assert!(tracker.advance(BuildPhase::Done).is_err());
        assert_eq!(tracker.phase(), &BuildPhase::Idle);
    }

    #[test]
    fn test_progress_state_tracks_latest() {
        let state = ProgressState::default();
        assert_eq!(state.phase(), BuildPhase::Idle);
        state.on_phase(&BuildPhase::Collecting);
        state.on_progress(&ProgressEvent::new("Fetching pages", 2, 3));
        assert_eq!(state.current().unwrap().processed, 2);
        state.on_clear();
        assert!(state.current().is_none());
        assert_eq!(state.phase(), BuildPhase::Collecting);
    }
}
