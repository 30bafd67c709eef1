// Prefetch Scheduler: decides whether and from where to prefetch, given the
// playhead and what the player has already buffered.
//
// The scheduler owns the active generation's cancellation token. Dropping it
// cancels that generation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::manifest::ManifestTimeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    /// No manifest, or the source is not eligible.
    #[default]
    Idle,
    /// Manifest loaded, waiting for the first decision.
    Initializing,
    Steady,
    /// A position jump is waiting out its debounce.
    Seeking,
}

/// One native buffered range, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }
}

/// What the player reports on each time update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackObservation {
    pub current_time: f64,
    #[serde(default)]
    pub buffered: Vec<BufferedRange>,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default)]
    pub is_seeking: bool,
}

impl PlaybackObservation {
    pub fn at(current_time: f64) -> Self {
        Self {
            current_time,
            ..Default::default()
        }
    }

    pub fn with_buffer(mut self, start: f64, end: f64) -> Self {
        self.buffered.push(BufferedRange::new(start, end));
        self
    }

    /// Seconds buffered past the playhead in the range that contains it.
    pub fn buffer_ahead(&self) -> f64 {
        self.buffered
            .iter()
            .find(|r| r.start <= self.current_time && r.end >= self.current_time)
            .map(|r| r.end - self.current_time)
            .unwrap_or(0.0)
    }
}

/// Per-session scheduling state.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    pub last_start_index: Option<usize>,
    pub is_initialized: bool,
    pub last_observed_time: Option<f64>,
    pub generation: Option<CancellationToken>,
    /// Number of generations started since the manifest loaded.
    pub generation_count: u64,
}

impl SchedulerState {
    pub fn has_active_generation(&self) -> bool {
        self.generation.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

#[derive(Debug, Clone)]
pub enum PrefetchDecision {
    /// Nothing loaded, or the timeline is empty.
    Idle,
    /// The player is loading; any active generation was cancelled.
    Paused,
    /// The native buffer is deep enough on its own.
    BufferHealthy { ahead: f64 },
    /// Sequential playback; the running generation keeps going.
    Continue { start_index: usize },
    /// A new generation must run from `start_index` under `token`.
    Start {
        start_index: usize,
        token: CancellationToken,
        cancelled_previous: bool,
    },
}

#[derive(Debug)]
pub struct PrefetchScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
}

impl PrefetchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.state.phase
    }

    /// Active generation token, if one is running.
    pub fn active_generation(&self) -> Option<&CancellationToken> {
        self.state.generation.as_ref().filter(|t| !t.is_cancelled())
    }

    /// A fresh manifest is in place; start over from `Initializing`.
    pub fn manifest_loaded(&mut self) {
        self.cancel_active();
        self.state = SchedulerState {
            phase: SchedulerPhase::Initializing,
            ..Default::default()
        };
    }

    /// Back to `Idle`, cancelling whatever is running. Used on source change and teardown.
    pub fn reset(&mut self) {
        self.cancel_active();
        self.state = SchedulerState::default();
    }

    /// Cancel the active generation. Returns whether one was running.
    pub fn cancel_active(&mut self) -> bool {
        match self.state.generation.take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Record an observation and return how long to wait before deciding on it.
    ///
    /// Returns `None` when no decision should follow: the scheduler is idle, or the
    /// player is loading (which also cancels the active generation).
    pub fn observe(&mut self, observation: &PlaybackObservation) -> Option<Duration> {
        if self.state.phase == SchedulerPhase::Idle {
            return None;
        }

        if observation.is_loading {
            if self.cancel_active() {
                debug!(time = observation.current_time, "Player loading, cancelled prefetch generation");
            }
            return None;
        }

        let delay = if !self.state.is_initialized {
            self.config.initial_debounce_ms
        } else {
            let jumped = self
                .state
                .last_observed_time
                .map(|last| (observation.current_time - last).abs() > self.config.seek_jump_secs)
                .unwrap_or(false);
            if jumped || observation.is_seeking {
                self.state.phase = SchedulerPhase::Seeking;
                self.config.seek_debounce_ms
            } else {
                self.config.steady_debounce_ms
            }
        };
        self.state.last_observed_time = Some(observation.current_time);
        trace!(time = observation.current_time, delay_ms = delay, "Observation debounced");
        Some(Duration::from_millis(delay))
    }

    /// Decide on a (debounced) observation against `timeline`.
    pub fn decide(&mut self, observation: &PlaybackObservation, timeline: &ManifestTimeline) -> PrefetchDecision {
        if self.state.phase == SchedulerPhase::Idle {
            return PrefetchDecision::Idle;
        }
        if observation.is_loading {
            self.cancel_active();
            return PrefetchDecision::Paused;
        }

        let ahead = observation.buffer_ahead();
        if ahead >= self.config.buffer_health_secs {
            trace!(ahead, "Native buffer healthy, not prefetching");
            if self.state.phase == SchedulerPhase::Seeking {
                self.state.phase = SchedulerPhase::Steady;
            }
            return PrefetchDecision::BufferHealthy { ahead };
        }

        let Some(playing) = timeline.segment_index_at(observation.current_time) else {
            return PrefetchDecision::Idle;
        };
        let start_index = (playing + self.config.segment_offset).min(timeline.len() - 1);

        let sequential = self.state.last_start_index.is_some_and(|last| {
            start_index >= last && start_index - last < self.config.sequential_window
        });
        if sequential && self.state.is_initialized && self.state.has_active_generation() {
            self.state.phase = SchedulerPhase::Steady;
            return PrefetchDecision::Continue { start_index };
        }

        let cancelled_previous = self.cancel_active();
        let token = CancellationToken::new();
        self.state.generation = Some(token.clone());
        self.state.last_start_index = Some(start_index);
        self.state.is_initialized = true;
        self.state.phase = SchedulerPhase::Steady;
        self.state.generation_count += 1;

        debug!(
            start_index,
            time = observation.current_time,
            cancelled_previous,
            generation = self.state.generation_count,
            "Starting prefetch generation"
        );
        PrefetchDecision::Start {
            start_index,
            token,
            cancelled_previous,
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.cancel_active();
    }
}
