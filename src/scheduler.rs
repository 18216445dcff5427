//! Piece selection strategies layered over the engine's own picker.
//!
//! The scheduler never picks pieces itself. It steers the engine through
//! sequential-mode toggles and per-piece deadlines: rarest-first and
//! sequential are one-shot configurations, the deadline strategy re-plans
//! from playback progress, and a custom picker drives an explicit request
//! pipeline.

use std::fmt;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::engine::{SwarmEngine, SwarmStatus};
use crate::torrent::PieceIndex;
use crate::{Result, StreamError};

/// User-supplied piece selection hook for [`SelectionStrategy::Custom`].
///
/// Each picked piece is handed to the engine with a monotonically
/// increasing deadline, so earlier picks keep higher priority. Returning
/// `None` ends the request pipeline.
pub trait PiecePicker: Send {
    /// Picks the next piece to request, or `None` when done.
    fn pick_piece(&mut self, status: &SwarmStatus) -> Option<PieceIndex>;

    /// Observes a finished piece. Default implementation ignores it.
    fn mark_completed(&mut self, _piece: PieceIndex) {}
}

/// How pieces are prioritized for a streaming session.
pub enum SelectionStrategy {
    /// Engine-default swarm-health ordering
    RarestFirst,
    /// Strict index order
    Sequential,
    /// Deadline-driven ordering replanned from playback progress.
    /// `stream_duration` is the playback length of the whole content.
    Deadline { stream_duration: Duration },
    /// Caller-provided picker driving a fixed-depth request pipeline
    Custom(Box<dyn PiecePicker>),
}

impl fmt::Debug for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::RarestFirst => write!(f, "RarestFirst"),
            SelectionStrategy::Sequential => write!(f, "Sequential"),
            SelectionStrategy::Deadline { stream_duration } => f
                .debug_struct("Deadline")
                .field("stream_duration", stream_duration)
                .finish(),
            SelectionStrategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

struct DeadlineState {
    /// Playback time of one piece: stream duration over piece count
    decoded_piece_length: Duration,
    /// Cursor position at the last stall, the baseline for buffered time
    last_played_piece: u32,
}

struct CustomState {
    picker: Box<dyn PiecePicker>,
    /// Next deadline tick in milliseconds; grows by one per request
    deadline_tick: u64,
}

enum SchedulerMode {
    RarestFirst,
    Sequential,
    Deadline(DeadlineState),
    Custom(CustomState),
}

/// Per-session piece scheduler dispatching one [`SelectionStrategy`].
///
/// Driven by the session under its own lock: `init` once after the torrent
/// is registered, then playback and completion notifications as they
/// happen.
pub struct PieceScheduler {
    piece_count: u32,
    pipeline_depth: usize,
    initial_buffering: Duration,
    mode: SchedulerMode,
}

impl PieceScheduler {
    /// Creates a scheduler for a torrent with `piece_count` pieces.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If `piece_count` is zero, or the
    ///   deadline strategy is given a zero stream duration
    pub fn new(
        strategy: SelectionStrategy,
        piece_count: u32,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        if piece_count == 0 {
            return Err(StreamError::invalid_input(
                "scheduler requires at least one piece",
            ));
        }

        let mode = match strategy {
            SelectionStrategy::RarestFirst => SchedulerMode::RarestFirst,
            SelectionStrategy::Sequential => SchedulerMode::Sequential,
            SelectionStrategy::Deadline { stream_duration } => {
                if stream_duration.is_zero() {
                    return Err(StreamError::invalid_input(
                        "deadline strategy requires a non-zero stream duration",
                    ));
                }
                SchedulerMode::Deadline(DeadlineState {
                    decoded_piece_length: stream_duration / piece_count,
                    last_played_piece: 0,
                })
            }
            SelectionStrategy::Custom(picker) => SchedulerMode::Custom(CustomState {
                picker,
                deadline_tick: 0,
            }),
        };

        Ok(Self {
            piece_count,
            pipeline_depth: config.pipeline_depth,
            initial_buffering: config.initial_buffering,
            mode,
        })
    }

    /// Applies the strategy's starting configuration to the engine.
    ///
    /// The deadline strategy primes every piece with a deadline offset by
    /// the configured initial buffering delay, then starts sequential
    /// until the first playback notification. A custom picker issues its
    /// initial burst of requests here.
    pub fn init<E: SwarmEngine>(&mut self, engine: &E) {
        match &mut self.mode {
            SchedulerMode::RarestFirst => engine.set_sequential(false),
            SchedulerMode::Sequential => engine.set_sequential(true),
            SchedulerMode::Deadline(state) => {
                if !self.initial_buffering.is_zero() {
                    for index in 0..self.piece_count {
                        engine.set_piece_deadline(
                            PieceIndex::new(index),
                            state.decoded_piece_length * index + self.initial_buffering,
                        );
                    }
                }
                engine.set_sequential(true);
            }
            SchedulerMode::Custom(state) => {
                for _ in 0..self.pipeline_depth {
                    if !Self::request_one(state, engine) {
                        break;
                    }
                }
            }
        }
    }

    /// Reacts to playback starting or resuming at buffer cursor
    /// `next_index`.
    ///
    /// For the deadline strategy: every outstanding piece gets a deadline
    /// spaced one decoded piece length apart, pushed out by the playback
    /// time already buffered, and sequential mode switches off. Other
    /// strategies ignore playback.
    pub fn notify_playback<E: SwarmEngine>(&mut self, engine: &E, next_index: u32) {
        if let SchedulerMode::Deadline(state) = &mut self.mode {
            let pieces_on_buffer = next_index.saturating_sub(state.last_played_piece);
            let buffer_time = state.decoded_piece_length * pieces_on_buffer;
            for index in next_index..self.piece_count {
                engine.set_piece_deadline(
                    PieceIndex::new(index),
                    state.decoded_piece_length * (index - next_index) + buffer_time,
                );
            }
            engine.set_sequential(false);
        }
    }

    /// Reacts to playback stalling with the buffer drained to
    /// `next_index`.
    ///
    /// The deadline strategy re-bases its buffered-time estimate on the
    /// stall position and falls back to sequential mode until playback
    /// resumes. Other strategies ignore stalls.
    pub fn notify_stall<E: SwarmEngine>(&mut self, engine: &E, next_index: u32) {
        if let SchedulerMode::Deadline(state) = &mut self.mode {
            state.last_played_piece = next_index;
            engine.set_sequential(true);
        }
    }

    /// Observes a finished piece; a custom picker refills its pipeline.
    pub fn on_piece_finished<E: SwarmEngine>(&mut self, engine: &E, piece: PieceIndex) {
        if let SchedulerMode::Custom(state) = &mut self.mode {
            state.picker.mark_completed(piece);
            Self::request_one(state, engine);
        }
    }

    fn request_one<E: SwarmEngine>(state: &mut CustomState, engine: &E) -> bool {
        let status = engine.status();
        match state.picker.pick_piece(&status) {
            Some(piece) => {
                engine.set_piece_deadline(piece, Duration::from_millis(state.deadline_tick));
                state.deadline_tick += 1;
                true
            }
            None => false,
        }
    }
}
