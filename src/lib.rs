//! Slipstream - In-order piece delivery out of a BitTorrent swarm
//!
//! This crate turns an out-of-order swarm download into a strictly ordered
//! stream of pieces suitable for playback: a bounded reorder buffer, pluggable
//! piece selection strategies, and a per-torrent session that feeds completed
//! pieces from a swarm engine into the buffer as they arrive.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use buffer::{Piece, PlaybackBuffer};
pub use config::StreamConfig;
pub use engine::{SimulatedSwarm, SwarmEngine, SwarmEvent, SwarmStatus, TorrentParams};
pub use scheduler::{PiecePicker, SelectionStrategy};
pub use session::{SessionState, StreamRequest, SwarmSession};
pub use stream::TorrentStream;
pub use torrent::{InfoHash, PieceBitmap, PieceIndex, TorrentInfo, TorrentSource};

/// Errors that can bubble up from any streaming subsystem.
///
/// Cancellation is not an error: operations interrupted by a closed buffer
/// or a shut-down session report it through `Option::None` results instead.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {reason}")]
    Engine { reason: String },
}

impl StreamError {
    /// Creates an `InvalidInput` error from any displayable reason.
    pub fn invalid_input(reason: impl std::fmt::Display) -> Self {
        StreamError::InvalidInput {
            reason: reason.to_string(),
        }
    }

    /// Creates an `Engine` error from any displayable reason.
    pub fn engine(reason: impl std::fmt::Display) -> Self {
        StreamError::Engine {
            reason: reason.to_string(),
        }
    }

    /// Checks if this error is due to caller input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, StreamError::InvalidInput { .. })
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
