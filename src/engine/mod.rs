//! Swarm engine abstraction with trait-based backends.
//!
//! The engine downloads pieces from the swarm; everything above it only
//! observes completions, requests piece reads, and adjusts piece priority.
//! A deterministic in-memory implementation lives in [`simulation`].

pub mod simulation;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;
use crate::torrent::{PieceBitmap, PieceIndex, TorrentInfo};

pub use simulation::{ContentCatalog, SimulatedSwarm};

/// Arguments for registering a torrent with the engine.
#[derive(Debug, Clone)]
pub struct TorrentParams {
    /// Raw torrent descriptor bytes
    pub descriptor: Vec<u8>,
    /// Directory downloaded data is stored under
    pub save_path: PathBuf,
    /// Previously captured resume state, if any
    pub resume_data: Option<Vec<u8>>,
}

/// Asynchronous notifications produced by the engine.
///
/// Consumed through [`SwarmEngine::next_event`] by a single logical
/// consumer: the session feeder while streaming, then the session itself
/// while waiting out resume-data capture during shutdown.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A piece finished downloading and verified
    PieceFinished { piece: PieceIndex },
    /// A requested piece read completed
    PieceRead { piece: PieceIndex, data: Bytes },
    /// Resume state was captured
    ResumeDataReady { data: Vec<u8> },
    /// Resume state could not be captured
    ResumeDataFailed { reason: String },
}

/// Snapshot of swarm-side download state.
///
/// All fields are instantaneous values; rates are bytes per second.
#[derive(Debug, Clone, Default)]
pub struct SwarmStatus {
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Completed fraction of the torrent, 0.0 to 1.0
    pub progress: f32,
    /// Per-piece completion map
    pub pieces: PieceBitmap,
    pub complete_pieces: u32,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub connected_peers: u32,
    pub connected_seeds: u32,
    pub num_uploads: u32,
    pub distributed_copies: f32,
    pub seconds_to_next_announce: u64,
}

/// Abstract interface to a BitTorrent download engine driving one torrent.
///
/// Implementations are internally synchronized; every method takes `&self`
/// and may be called from the session, the feeder task, and the playback
/// side concurrently.
#[async_trait]
pub trait SwarmEngine: Send + Sync + 'static {
    /// Parses a descriptor and registers its torrent, paused.
    ///
    /// Restores completion state from `resume_data` when provided and
    /// intact; a damaged blob is ignored and the download starts fresh.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If the descriptor holds zero pieces
    /// - `StreamError::Engine` - If the descriptor cannot be parsed or
    ///   names unknown content
    async fn add_torrent(&self, params: TorrentParams) -> Result<TorrentInfo>;

    /// Starts or restarts downloading.
    fn resume(&self);

    /// Stops downloading without discarding state.
    fn pause(&self);

    /// Switches between sequential and engine-default piece ordering.
    fn set_sequential(&self, enabled: bool);

    /// Asks the engine to complete a piece by the given deadline,
    /// measured from now. Earlier deadlines win priority.
    fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration);

    /// Connects a known peer, typically a seed.
    fn connect_peer(&self, addr: SocketAddr);

    /// Adds a DHT bootstrap node.
    fn add_dht_node(&self, addr: SocketAddr);

    /// Checks if a piece has finished downloading.
    fn has_piece(&self, piece: PieceIndex) -> bool;

    /// Requests the data of a completed piece; the engine answers with a
    /// `PieceRead` event.
    fn request_piece_read(&self, piece: PieceIndex);

    /// Requests capture of resume state; the engine answers with a
    /// `ResumeDataReady` or `ResumeDataFailed` event.
    fn request_resume_data(&self);

    /// Waits for the next engine event, up to `timeout`.
    ///
    /// Returns `None` when the timeout elapses with nothing to report.
    async fn next_event(&self, timeout: Duration) -> Option<SwarmEvent>;

    /// Returns a snapshot of current download state.
    fn status(&self) -> SwarmStatus;
}
