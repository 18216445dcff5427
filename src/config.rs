//! Centralized configuration for slipstream.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all streaming components.
///
/// Groups related settings into logical sections. Every section carries
/// defaults tuned for media playback over a home connection.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub buffer: BufferConfig,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
}

impl StreamConfig {
    /// Configuration preset for tests: short timeouts, no artificial
    /// buffering delay.
    pub fn for_testing() -> Self {
        Self {
            buffer: BufferConfig::default(),
            session: SessionConfig {
                event_timeout: Duration::from_millis(100),
                resume_timeout: Duration::from_secs(1),
            },
            scheduler: SchedulerConfig {
                initial_buffering: Duration::ZERO,
                pipeline_depth: 10,
            },
        }
    }
}

/// Sizing policy for the playback reorder buffer.
///
/// A sliding window bounds memory to a handful of pieces and applies
/// backpressure to the feeder; `WholeFile` admits every piece at once,
/// trading memory for tolerance of arbitrary arrival orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// At most this many unconsumed pieces resident at a time.
    SlidingWindow(usize),
    /// Capacity equal to the torrent's piece count.
    WholeFile,
}

impl WindowMode {
    /// Resolves the mode into a concrete piece capacity for a torrent.
    pub fn capacity_for(self, total_pieces: u32) -> usize {
        match self {
            WindowMode::SlidingWindow(window) => window.min(total_pieces as usize).max(1),
            WindowMode::WholeFile => total_pieces as usize,
        }
    }
}

/// Playback buffer configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// How buffer capacity is derived from the torrent's piece count
    pub window: WindowMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window: WindowMode::SlidingWindow(10),
        }
    }
}

/// Session lifecycle configuration.
///
/// Controls how long the feeder waits for engine events and how long
/// shutdown waits for resume data before giving up on persisting it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on a single engine event poll
    pub event_timeout: Duration,
    /// Total wait for resume data during shutdown
    pub resume_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_secs(1),
            resume_timeout: Duration::from_secs(5),
        }
    }
}

/// Piece selection configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Playback delay assumed when priming deadlines at open time.
    /// `Duration::ZERO` disables priming entirely.
    pub initial_buffering: Duration,
    /// Outstanding request target for custom pickers
    pub pipeline_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_buffering: Duration::from_secs(10),
            pipeline_depth: 10,
        }
    }
}
