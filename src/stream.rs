//! Host-facing streaming facade over one active torrent.
//!
//! `TorrentStream` owns at most one [`SwarmSession`] at a time. Adding a
//! torrent while one is active replaces it: the old session shuts down,
//! its buffer closes, and any consumer parked on it wakes with `None`.

use std::sync::Arc;

use tracing::info;

use crate::buffer::{Piece, PlaybackBuffer};
use crate::config::StreamConfig;
use crate::engine::{SwarmEngine, SwarmStatus};
use crate::session::{SessionState, StreamRequest, SwarmSession};
use crate::torrent::TorrentInfo;
use crate::{Result, StreamError};

/// One streaming torrent at a time, delivered in playback order.
///
/// The playback side either polls [`next_piece`](Self::next_piece)
/// directly or owns a [`playback_handle`](Self::playback_handle) in its
/// own task; control calls stay on this object.
pub struct TorrentStream<E: SwarmEngine> {
    config: StreamConfig,
    session: Option<SwarmSession<E>>,
}

impl<E: SwarmEngine> TorrentStream<E> {
    /// Creates a stream with no torrent attached.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Opens a torrent on the given engine and starts feeding, replacing
    /// any active torrent. Returns the new torrent's piece count.
    ///
    /// Replacement is latest-wins: the previous session is shut down
    /// first and the new stream starts over at piece 0. There is no
    /// queueing or handoff between the two.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If the request is malformed
    /// - `StreamError::Io` - If the descriptor file cannot be read
    /// - `StreamError::Engine` - If the engine rejects the descriptor
    pub async fn add_torrent(&mut self, engine: E, request: StreamRequest) -> Result<u32> {
        if let Some(mut old) = self.session.take() {
            info!("Replacing active torrent {}", old.info().name);
            old.shutdown().await;
        }

        let mut session = SwarmSession::open(engine, request, self.config.clone()).await?;
        session.begin_feeding()?;
        let piece_count = session.info().piece_count;
        self.session = Some(session);
        Ok(piece_count)
    }

    /// Returns the next piece in playback order, waiting for it to
    /// download.
    ///
    /// Returns `None` with no torrent attached, after the last piece, or
    /// once the stream is unlocked.
    pub async fn next_piece(&self) -> Option<Piece> {
        match &self.session {
            Some(session) => session.buffer().next_piece().await,
            None => None,
        }
    }

    /// Returns a consumer handle to the active torrent's buffer, usable
    /// from another task. The handle reports `None` forever once this
    /// torrent is replaced or unlocked.
    pub fn playback_handle(&self) -> Option<Arc<PlaybackBuffer>> {
        self.session.as_ref().map(|session| Arc::clone(session.buffer()))
    }

    /// Returns swarm-side download state of the active torrent.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If no torrent is attached
    pub fn status(&self) -> Result<SwarmStatus> {
        match &self.session {
            Some(session) => Ok(session.status()),
            None => Err(StreamError::invalid_input("no torrent attached")),
        }
    }

    /// Signals that playback is running. No-op without a torrent.
    pub fn notify_playback(&self) {
        if let Some(session) = &self.session {
            session.notify_playback();
        }
    }

    /// Signals that playback has stalled. No-op without a torrent.
    pub fn notify_stall(&self) {
        if let Some(session) = &self.session {
            session.notify_stall();
        }
    }

    /// Stops piece delivery immediately, waking a blocked consumer, while
    /// the download itself keeps running. No-op without a torrent.
    pub fn unlock(&self) {
        if let Some(session) = &self.session {
            session.buffer().close();
        }
    }

    /// Returns whether delivery has been stopped by [`unlock`](Self::unlock).
    pub fn is_unlocked(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.buffer().is_closed())
            .unwrap_or(false)
    }

    /// Returns the active session's lifecycle state, `Idle` without one.
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|session| session.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Returns the active torrent's metadata.
    pub fn info(&self) -> Option<&TorrentInfo> {
        self.session.as_ref().map(|session| session.info())
    }

    /// Returns the active session, if any.
    pub fn session(&self) -> Option<&SwarmSession<E>> {
        self.session.as_ref()
    }

    /// Shuts the active session down, persisting resume state.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::engine::{ContentCatalog, SimulatedSwarm};
    use crate::scheduler::SelectionStrategy;
    use crate::torrent::TorrentSource;

    const PIECE_LENGTH: u32 = 16;

    fn registered(name: &str, piece_count: u32) -> (ContentCatalog, Vec<u8>) {
        let catalog = ContentCatalog::new();
        let content: Vec<u8> = (0..piece_count * PIECE_LENGTH)
            .map(|byte| (byte % 251) as u8)
            .collect();
        let descriptor = catalog
            .register(name, PIECE_LENGTH, Bytes::from(content))
            .unwrap();
        (catalog, descriptor)
    }

    fn request(descriptor: &[u8], save_path: &Path) -> StreamRequest {
        StreamRequest {
            source: TorrentSource::Bytes(descriptor.to_vec()),
            save_path: save_path.to_path_buf(),
            strategy: SelectionStrategy::Sequential,
            seed: None,
        }
    }

    #[tokio::test]
    async fn test_empty_stream_reports_nothing() {
        let stream: TorrentStream<SimulatedSwarm> =
            TorrentStream::new(StreamConfig::for_testing());

        assert!(stream.next_piece().await.is_none());
        assert!(matches!(
            stream.status(),
            Err(StreamError::InvalidInput { .. })
        ));
        assert_eq!(stream.state(), SessionState::Idle);
        assert!(!stream.is_unlocked());
        assert!(stream.info().is_none());

        // Notifications and unlock must be safe no-ops.
        stream.notify_playback();
        stream.notify_stall();
        stream.unlock();
    }

    #[tokio::test]
    async fn test_add_torrent_streams_to_completion() {
        let (catalog, descriptor) = registered("movie", 16);
        let save_dir = tempfile::tempdir().unwrap();
        let mut stream = TorrentStream::new(StreamConfig::for_testing());

        let piece_count = stream
            .add_torrent(
                SimulatedSwarm::new(catalog),
                request(&descriptor, save_dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(piece_count, 16);
        assert_eq!(stream.state(), SessionState::Downloading);

        for expected in 0..piece_count {
            let piece = tokio::time::timeout(Duration::from_secs(5), stream.next_piece())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(piece.index.as_u32(), expected);
        }

        let after_end = tokio::time::timeout(Duration::from_millis(200), stream.next_piece())
            .await
            .unwrap();
        assert!(after_end.is_none());

        stream.shutdown().await;
    }

    #[tokio::test]
    async fn test_unlock_stops_delivery_but_not_download() {
        let piece_count = 16;
        let (catalog, descriptor) = registered("movie", piece_count);
        let save_dir = tempfile::tempdir().unwrap();
        let mut stream = TorrentStream::new(StreamConfig::for_testing());
        stream
            .add_torrent(
                SimulatedSwarm::new(catalog),
                request(&descriptor, save_dir.path()),
            )
            .await
            .unwrap();

        stream.next_piece().await.unwrap();
        stream.unlock();

        assert!(stream.is_unlocked());
        assert!(stream.next_piece().await.is_none());

        // The swarm download carries on behind the closed buffer.
        let mut complete = 0;
        for _ in 0..200 {
            complete = stream.status().unwrap().complete_pieces;
            if complete == piece_count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(complete, piece_count);

        stream.shutdown().await;
    }

    #[tokio::test]
    async fn test_replacement_wakes_parked_consumer() {
        let (catalog, first_descriptor) = registered("first", 16);
        let second_content: Vec<u8> = (0..8 * PIECE_LENGTH).map(|byte| byte as u8).collect();
        let second_descriptor = catalog
            .register("second", PIECE_LENGTH, Bytes::from(second_content))
            .unwrap();

        let save_dir = tempfile::tempdir().unwrap();
        let mut stream = TorrentStream::new(StreamConfig::for_testing());
        stream
            .add_torrent(
                SimulatedSwarm::new(catalog.clone()),
                request(&first_descriptor, save_dir.path()),
            )
            .await
            .unwrap();

        let handle = stream.playback_handle().unwrap();
        let consumer = tokio::spawn(async move {
            let mut delivered = 0u32;
            while handle.next_piece().await.is_some() {
                delivered += 1;
            }
            delivered
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let piece_count = stream
            .add_torrent(
                SimulatedSwarm::new(catalog),
                request(&second_descriptor, save_dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(piece_count, 8);

        // The old handle drains whatever it got, then ends.
        let delivered = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(delivered <= 16);

        // The replacement stream starts over at piece 0.
        let piece = tokio::time::timeout(Duration::from_secs(5), stream.next_piece())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(piece.index.as_u32(), 0);
        assert_eq!(stream.info().unwrap().name, "second");

        stream.shutdown().await;
    }
}
