//! Per-torrent streaming session: open, feed, observe, shut down.
//!
//! A session ties one engine-registered torrent to one playback buffer.
//! After `open` the torrent sits paused with its strategy applied;
//! `begin_feeding` starts the download and spawns the feeder task, which
//! turns engine events into in-order buffer inserts until the last piece
//! is delivered or the session shuts down.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::{Piece, PlaybackBuffer};
use crate::config::StreamConfig;
use crate::engine::{SwarmEngine, SwarmEvent, SwarmStatus, TorrentParams};
use crate::scheduler::{PieceScheduler, SelectionStrategy};
use crate::torrent::{InfoHash, PieceIndex, TorrentInfo, TorrentSource};
use crate::{Result, StreamError};

/// Everything needed to start streaming one torrent.
#[derive(Debug)]
pub struct StreamRequest {
    /// Torrent descriptor location
    pub source: TorrentSource,
    /// Directory for downloaded data and resume state
    pub save_path: PathBuf,
    /// Piece prioritization for this stream
    pub strategy: SelectionStrategy,
    /// Known seed to connect directly and register with the DHT
    pub seed: Option<SocketAddr>,
}

/// Lifecycle of a [`SwarmSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No torrent attached
    Idle,
    /// Torrent registered and configured, download paused
    Opening,
    /// Feeder running, pieces flowing into the buffer
    Downloading,
    /// Shutdown in progress, feeder winding down
    Draining,
    /// Fully shut down
    Closed,
}

/// One torrent bound to one engine, one buffer, and one scheduler.
///
/// All methods are callable while the feeder task runs; the buffer and the
/// scheduler lock are the only coordination points between them.
pub struct SwarmSession<E: SwarmEngine> {
    engine: Arc<E>,
    info: TorrentInfo,
    buffer: Arc<PlaybackBuffer>,
    scheduler: Arc<Mutex<PieceScheduler>>,
    resume_path: PathBuf,
    config: StreamConfig,
    state: SessionState,
    feeder: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<E: SwarmEngine> SwarmSession<E> {
    /// Opens a torrent: reads the descriptor, restores resume state if a
    /// previous session saved any, registers the torrent paused, and
    /// applies the selection strategy. Fails fast without partial state.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If the descriptor path or content
    ///   is empty, the torrent has no pieces, or the strategy is
    ///   misconfigured
    /// - `StreamError::Io` - If the descriptor file cannot be read
    /// - `StreamError::Engine` - If the engine rejects the descriptor
    pub async fn open(engine: E, request: StreamRequest, config: StreamConfig) -> Result<Self> {
        let engine = Arc::new(engine);

        let descriptor = match &request.source {
            TorrentSource::File(path) => {
                if path.as_os_str().is_empty() {
                    return Err(StreamError::invalid_input("torrent path must not be empty"));
                }
                tokio::fs::read(path).await?
            }
            TorrentSource::Bytes(bytes) => bytes.clone(),
        };
        if descriptor.is_empty() {
            return Err(StreamError::invalid_input(
                "torrent descriptor must not be empty",
            ));
        }

        let resume_path = resume_file_path(&request.save_path, &descriptor);
        let resume_data = match tokio::fs::read(&resume_path).await {
            Ok(data) => {
                debug!("Loaded resume data from {}", resume_path.display());
                Some(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    "Could not read resume file {}, starting fresh: {e}",
                    resume_path.display()
                );
                None
            }
        };

        let info = engine
            .add_torrent(TorrentParams {
                descriptor,
                save_path: request.save_path.clone(),
                resume_data,
            })
            .await?;
        if info.piece_count == 0 {
            return Err(StreamError::invalid_input("torrent has no pieces"));
        }

        let capacity = config.buffer.window.capacity_for(info.piece_count);
        let buffer = Arc::new(PlaybackBuffer::new(info.piece_count, capacity)?);

        let mut scheduler = PieceScheduler::new(request.strategy, info.piece_count, &config.scheduler)?;
        scheduler.init(engine.as_ref());

        if let Some(seed) = request.seed {
            engine.connect_peer(seed);
            engine.add_dht_node(seed);
            info!("Bootstrapping from seed {seed}");
        }

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Opened torrent {} ({} pieces of {} bytes)",
            info.name, info.piece_count, info.piece_length
        );
        Ok(Self {
            engine,
            info,
            buffer,
            scheduler: Arc::new(Mutex::new(scheduler)),
            resume_path,
            config,
            state: SessionState::Opening,
            feeder: None,
            shutdown_tx,
        })
    }

    /// Starts the download and the feeder task.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If the session is not freshly opened
    pub fn begin_feeding(&mut self) -> Result<()> {
        if self.state != SessionState::Opening {
            return Err(StreamError::invalid_input(format!(
                "cannot start feeding in {:?} state",
                self.state
            )));
        }

        self.engine.resume();
        let handle = tokio::spawn(feed(
            Arc::clone(&self.engine),
            Arc::clone(&self.buffer),
            Arc::clone(&self.scheduler),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.feeder = Some(handle);
        self.state = SessionState::Downloading;

        info!("Feeding {}", self.info.name);
        Ok(())
    }

    /// Tells the scheduler playback has started or resumed at the current
    /// buffer cursor.
    pub fn notify_playback(&self) {
        let next_index = self.buffer.next_index();
        self.scheduler
            .lock()
            .notify_playback(self.engine.as_ref(), next_index);
        debug!("Playback running at piece {next_index}");
    }

    /// Tells the scheduler playback has stalled at the current buffer
    /// cursor.
    pub fn notify_stall(&self) {
        let next_index = self.buffer.next_index();
        self.scheduler
            .lock()
            .notify_stall(self.engine.as_ref(), next_index);
        debug!("Playback stalled at piece {next_index}");
    }

    /// Returns a snapshot of swarm-side download state.
    pub fn status(&self) -> SwarmStatus {
        self.engine.status()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the torrent's metadata.
    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// Returns the playback buffer this session feeds.
    pub fn buffer(&self) -> &Arc<PlaybackBuffer> {
        &self.buffer
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Shuts the session down: stops the feeder, pauses the download, and
    /// makes a bounded attempt to persist resume state. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Draining;
        info!("Shutting down session for {}", self.info.name);

        let _ = self.shutdown_tx.send(true);
        self.buffer.close();
        if let Some(handle) = self.feeder.take() {
            if let Err(e) = handle.await {
                warn!("Feeder task failed: {e}");
            }
        }

        self.engine.pause();
        self.persist_resume_data().await;

        self.state = SessionState::Closed;
    }

    /// Asks the engine for resume data and writes it next to the saved
    /// content. Failures are logged, never propagated; losing resume state
    /// only costs a redownload.
    async fn persist_resume_data(&self) {
        self.engine.request_resume_data();
        let deadline = Instant::now() + self.config.session.resume_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Timed out waiting for resume data");
                return;
            }

            match self.engine.next_event(remaining).await {
                Some(SwarmEvent::ResumeDataReady { data }) => {
                    match write_resume_file(&self.resume_path, &data).await {
                        Ok(()) => info!("Saved resume data to {}", self.resume_path.display()),
                        Err(e) => warn!(
                            "Could not write resume file {}: {e}",
                            self.resume_path.display()
                        ),
                    }
                    return;
                }
                Some(SwarmEvent::ResumeDataFailed { reason }) => {
                    warn!("Engine could not capture resume data: {reason}");
                    return;
                }
                // Stale streaming events may still be queued; skip them.
                Some(_) => {}
                None => {
                    warn!("Timed out waiting for resume data");
                    return;
                }
            }
        }
    }
}

impl<E: SwarmEngine> Drop for SwarmSession<E> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.buffer.close();
    }
}

/// Feeder loop: drives engine events into in-order buffer inserts.
///
/// Reads are only ever requested for the next undelivered index, so inserts
/// reach the buffer in fetch order and a sliding-window capacity cannot
/// strand a hole outside the window. Event timeouts are routine polling,
/// not failures.
async fn feed<E: SwarmEngine>(
    engine: Arc<E>,
    buffer: Arc<PlaybackBuffer>,
    scheduler: Arc<Mutex<PieceScheduler>>,
    config: StreamConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let piece_count = buffer.piece_count();
    let mut next_piece: u32 = 0;

    // Pieces restored from resume state never emit completion events, so
    // probe the cursor once before waiting on the engine.
    if engine.has_piece(PieceIndex::new(next_piece)) {
        engine.request_piece_read(PieceIndex::new(next_piece));
    }

    while next_piece < piece_count {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Feeder received shutdown signal");
                break;
            }
            event = engine.next_event(config.session.event_timeout) => {
                match event {
                    Some(SwarmEvent::PieceFinished { piece }) => {
                        debug!("Piece {piece} finished");
                        scheduler.lock().on_piece_finished(engine.as_ref(), piece);
                        if piece.as_u32() == next_piece {
                            engine.request_piece_read(piece);
                        }
                    }
                    Some(SwarmEvent::PieceRead { piece, data }) => {
                        if piece.as_u32() != next_piece {
                            debug!("Ignoring stale read of piece {piece}");
                            continue;
                        }
                        match buffer.insert(Piece::new(piece, data)).await {
                            Ok(()) => {
                                next_piece += 1;
                                let upcoming = PieceIndex::new(next_piece);
                                if next_piece < piece_count && engine.has_piece(upcoming) {
                                    engine.request_piece_read(upcoming);
                                }
                            }
                            Err(e) => {
                                error!("Buffer rejected piece {piece}, ending stream: {e}");
                                buffer.close();
                                return;
                            }
                        }
                    }
                    // Resume-data events belong to shutdown, not to us.
                    Some(_) => {}
                    None => {
                        debug!("No engine events within {:?}", config.session.event_timeout);
                    }
                }
            }
        }
    }

    if next_piece >= piece_count {
        info!("All {piece_count} pieces delivered");
    }
}

fn resume_file_path(save_path: &Path, descriptor: &[u8]) -> PathBuf {
    // Keyed by descriptor digest: known before the engine has parsed
    // anything, stable across sessions for the same descriptor.
    save_path.join(format!("{}.resume", InfoHash::of(descriptor)))
}

async fn write_resume_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("resume.tmp");
    tokio::fs::write(&temp_path, data).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
