//! Pull Progress Accounting
//!
//! Maps the five protocol phases and their per-request sub-progress to
//! a single percentage, weighted so the layer downloads dominate:
//!
//! | phase       | range   |
//! |-------------|---------|
//! | searching   | 0..5    |
//! | resolving   | 5..10   |
//! | metadata    | 10..20  |
//! | downloading | 20..95  |
//! | copying     | 95      |
//!
//! Emitted percentages are clamped monotone non-decreasing for the
//! lifetime of the pull.

use std::sync::Mutex;

/// Events emitted while a pull runs
#[derive(Debug, Clone)]
pub enum PullEvent {
    /// Pull accepted, index lookup starting
    Started { name: String, tag: String },

    /// Index lookup succeeded, directed to a registry
    RegistrySelected { registry: String },

    /// Tag lookup succeeded
    TagResolved { id: String },

    /// Ancestry lookup succeeded
    AncestryResolved { layers: usize },

    /// Layer already materialized, no request issued
    LayerSkipped { id: String },

    /// Layer download starting
    LayerPulling {
        id: String,
        index: usize,
        total: usize,
    },

    /// Layer materialized and promoted
    LayerComplete { id: String },

    /// Combined progress changed
    Progress { percent: u32 },

    /// Pull complete
    Complete { id: String },
}

/// Progress callback for pull operations
pub type ProgressFn = Box<dyn Fn(PullEvent) + Send + Sync>;

/// The protocol phase a session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullPhase {
    Searching,
    Resolving,
    Metadata,
    Downloading,
    Copying,
}

/// The five request kinds a session issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Images,
    Tags,
    Ancestry,
    Json,
    Layer,
}

#[derive(Default)]
struct ProgressState {
    phase: Option<PullPhase>,
    images: u32,
    tags: u32,
    ancestry: u32,
    json: u32,
    layer: u32,
    current_layer: usize,
    total_layers: usize,
    emitted: u32,
}

impl ProgressState {
    fn percent(&self) -> u32 {
        match self.phase {
            None => 0,
            Some(PullPhase::Searching) => self.images * 5 / 100,
            Some(PullPhase::Resolving) => 5 + self.tags * 5 / 100,
            Some(PullPhase::Metadata) => 10 + self.ancestry * 5 / 100 + self.json * 5 / 100,
            Some(PullPhase::Downloading) => {
                let total = self.total_layers.max(1) as u32;
                20 + 75 * self.current_layer as u32 / total + self.layer * 75 / total / 100
            }
            Some(PullPhase::Copying) => 95,
        }
    }
}

/// Combines per-request sub-progress into the session percentage and
/// fans events out to the optional observer.
pub(crate) struct ProgressReporter {
    callback: Option<ProgressFn>,
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressFn>) -> Self {
        Self {
            callback,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Forward a structural milestone to the observer.
    pub fn event(&self, event: PullEvent) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    pub fn enter_phase(&self, phase: PullPhase) {
        let mut state = self.state.lock().unwrap();
        state.phase = Some(phase);
        self.maybe_emit(&mut state);
    }

    /// Record sub-progress (0..=100) for one request kind.
    pub fn request_progress(&self, kind: RequestKind, percent: u32) {
        let mut state = self.state.lock().unwrap();
        let slot = match kind {
            RequestKind::Images => &mut state.images,
            RequestKind::Tags => &mut state.tags,
            RequestKind::Ancestry => &mut state.ancestry,
            RequestKind::Json => &mut state.json,
            RequestKind::Layer => &mut state.layer,
        };
        *slot = percent.min(100);
        self.maybe_emit(&mut state);
    }

    pub fn set_layer_totals(&self, total: usize) {
        let mut state = self.state.lock().unwrap();
        state.total_layers = total;
        state.current_layer = 0;
    }

    /// Move on to the next layer, resetting the per-layer sub-progress.
    pub fn advance_layer(&self, current: usize) {
        let mut state = self.state.lock().unwrap();
        state.current_layer = current;
        state.layer = 0;
        self.maybe_emit(&mut state);
    }

    fn maybe_emit(&self, state: &mut ProgressState) {
        let percent = state.percent();
        if percent > state.emitted {
            state.emitted = percent;
            tracing::debug!("Combined progress {}%", percent);
            if let Some(cb) = &self.callback {
                cb(PullEvent::Progress { percent });
            }
        }
    }

    #[cfg(test)]
    fn current_percent(&self) -> u32 {
        self.state.lock().unwrap().percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collecting_reporter() -> (ProgressReporter, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(Some(Box::new(move |ev| {
            if let PullEvent::Progress { percent } = ev {
                sink.lock().unwrap().push(percent);
            }
        })));
        (reporter, seen)
    }

    #[test]
    fn test_phase_table() {
        let reporter = ProgressReporter::new(None);

        reporter.enter_phase(PullPhase::Searching);
        reporter.request_progress(RequestKind::Images, 100);
        assert_eq!(reporter.current_percent(), 5);

        reporter.enter_phase(PullPhase::Resolving);
        reporter.request_progress(RequestKind::Tags, 50);
        assert_eq!(reporter.current_percent(), 7);

        reporter.enter_phase(PullPhase::Metadata);
        reporter.request_progress(RequestKind::Ancestry, 100);
        reporter.request_progress(RequestKind::Json, 100);
        assert_eq!(reporter.current_percent(), 20);

        reporter.enter_phase(PullPhase::Downloading);
        reporter.set_layer_totals(4);
        reporter.advance_layer(2);
        reporter.request_progress(RequestKind::Layer, 100);
        // 20 + 75*2/4 + 100*75/4/100
        assert_eq!(reporter.current_percent(), 20 + 37 + 18);

        reporter.enter_phase(PullPhase::Copying);
        assert_eq!(reporter.current_percent(), 95);
    }

    #[test]
    fn test_empty_ancestry_guard() {
        let reporter = ProgressReporter::new(None);
        reporter.enter_phase(PullPhase::Downloading);
        reporter.set_layer_totals(0);
        reporter.request_progress(RequestKind::Layer, 100);
        // max(1, total) keeps the math defined.
        assert_eq!(reporter.current_percent(), 95);
    }

    #[test]
    fn test_monotone_emission() {
        let (reporter, seen) = collecting_reporter();

        reporter.enter_phase(PullPhase::Downloading);
        reporter.set_layer_totals(1);
        reporter.request_progress(RequestKind::Layer, 100);

        // A stale low-phase update after the download must not emit a
        // lower percentage.
        reporter.enter_phase(PullPhase::Metadata);
        reporter.request_progress(RequestKind::Json, 100);

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 95);
    }
}
