//! Deterministic in-memory swarm engine for development and tests.
//!
//! Content is registered up front in a shared [`ContentCatalog`]; a
//! [`SimulatedSwarm`] then "downloads" it piece by piece in a seeded
//! pseudo-random order, honoring sequential mode, piece deadlines, pause
//! state, and the resume-data protocol of the real engine boundary.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SwarmEngine, SwarmEvent, SwarmStatus, TorrentParams};
use crate::torrent::{InfoHash, PieceBitmap, PieceIndex, TorrentInfo};
use crate::{Result, StreamError};

/// Default RNG seed for reproducible piece arrival orders.
pub const DEFAULT_SIMULATION_SEED: u64 = 42;

#[derive(Debug, Clone)]
struct RegisteredContent {
    name: String,
    piece_length: u32,
    content: Bytes,
}

/// Shared registry of simulated torrent content.
///
/// Cloning is cheap and clones share the registry, so several engine
/// instances can serve the same content across session lifetimes.
#[derive(Debug, Clone, Default)]
pub struct ContentCatalog {
    entries: Arc<Mutex<HashMap<InfoHash, RegisteredContent>>>,
}

impl ContentCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers content and returns the descriptor bytes a
    /// [`SimulatedSwarm`] accepts for it: the hex-encoded info hash.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If `piece_length` is zero or
    ///   `content` is empty
    pub fn register(&self, name: &str, piece_length: u32, content: Bytes) -> Result<Vec<u8>> {
        if piece_length == 0 {
            return Err(StreamError::invalid_input("piece length must be non-zero"));
        }
        if content.is_empty() {
            return Err(StreamError::invalid_input("content must not be empty"));
        }

        let info_hash = InfoHash::of(&content);
        self.entries.lock().insert(
            info_hash,
            RegisteredContent {
                name: name.to_string(),
                piece_length,
                content,
            },
        );
        Ok(info_hash.to_string().into_bytes())
    }

    fn lookup(&self, info_hash: InfoHash) -> Option<RegisteredContent> {
        self.entries.lock().get(&info_hash).cloned()
    }
}

/// Resume state blob format: the indices of completed pieces.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    completed: Vec<u32>,
}

#[derive(Debug, Default)]
struct CallLog {
    sequential_toggles: Vec<bool>,
    piece_deadlines: Vec<(PieceIndex, Duration)>,
    connected_peers: Vec<SocketAddr>,
    dht_nodes: Vec<SocketAddr>,
    resume_requests: u32,
}

struct ActiveTorrent {
    info: TorrentInfo,
    /// Content split into piece payloads
    pieces: Vec<Bytes>,
    complete: Vec<bool>,
    remaining: BTreeSet<u32>,
    deadlines: HashMap<u32, Duration>,
    /// Position of each piece in the seeded arrival order
    scramble_rank: Vec<u32>,
}

impl ActiveTorrent {
    /// Picks and completes the next piece per current ordering rules.
    fn complete_next(&mut self, sequential: bool) -> Option<PieceIndex> {
        let next = if sequential {
            self.remaining.iter().next().copied()
        } else {
            self.remaining
                .iter()
                .min_by_key(|&&piece| {
                    (
                        self.deadlines.get(&piece).copied().unwrap_or(Duration::MAX),
                        self.scramble_rank[piece as usize],
                    )
                })
                .copied()
        }?;

        self.remaining.remove(&next);
        self.complete[next as usize] = true;
        Some(PieceIndex::new(next))
    }
}

struct SimState {
    torrent: Option<ActiveTorrent>,
    events: VecDeque<SwarmEvent>,
    paused: bool,
    sequential: bool,
    log: CallLog,
}

/// In-memory [`SwarmEngine`] with deterministic piece arrival.
///
/// Pieces complete lazily as events are polled: whenever the event queue is
/// empty and the engine is not paused, the next piece in the planned order
/// finishes. Deadline hints pull pieces ahead of the scrambled base order,
/// earliest deadline first.
pub struct SimulatedSwarm {
    catalog: ContentCatalog,
    state: Mutex<SimState>,
    event_notify: Notify,
    seed: u64,
}

impl SimulatedSwarm {
    /// Creates an engine over the given catalog with the default seed.
    pub fn new(catalog: ContentCatalog) -> Self {
        Self::with_seed(catalog, DEFAULT_SIMULATION_SEED)
    }

    /// Creates an engine whose arrival order derives from `seed`.
    pub fn with_seed(catalog: ContentCatalog, seed: u64) -> Self {
        Self {
            catalog,
            state: Mutex::new(SimState {
                torrent: None,
                events: VecDeque::new(),
                paused: true,
                sequential: false,
                log: CallLog::default(),
            }),
            event_notify: Notify::new(),
            seed,
        }
    }

    /// Returns every `set_sequential` argument seen so far, in call order.
    pub fn sequential_calls(&self) -> Vec<bool> {
        self.state.lock().log.sequential_toggles.clone()
    }

    /// Returns every piece deadline set so far, in call order.
    pub fn piece_deadlines(&self) -> Vec<(PieceIndex, Duration)> {
        self.state.lock().log.piece_deadlines.clone()
    }

    /// Returns the peers connected so far.
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.state.lock().log.connected_peers.clone()
    }

    /// Returns the DHT nodes added so far.
    pub fn dht_nodes(&self) -> Vec<SocketAddr> {
        self.state.lock().log.dht_nodes.clone()
    }

    /// Returns how many resume-data captures were requested.
    pub fn resume_requests(&self) -> u32 {
        self.state.lock().log.resume_requests
    }

    fn parse_descriptor(descriptor: &[u8]) -> Result<InfoHash> {
        let token = std::str::from_utf8(descriptor)
            .map_err(|_| StreamError::engine("descriptor is not valid UTF-8"))?;
        let raw = hex::decode(token.trim())
            .map_err(|e| StreamError::engine(format!("descriptor is not a hex info hash: {e}")))?;
        let hash: [u8; 20] = raw
            .try_into()
            .map_err(|_| StreamError::engine("info hash must be 20 bytes"))?;
        Ok(InfoHash::new(hash))
    }
}

#[async_trait]
impl SwarmEngine for SimulatedSwarm {
    async fn add_torrent(&self, params: TorrentParams) -> Result<TorrentInfo> {
        let info_hash = Self::parse_descriptor(&params.descriptor)?;
        let registered = self
            .catalog
            .lookup(info_hash)
            .ok_or_else(|| StreamError::engine(format!("unknown torrent {info_hash}")))?;

        let piece_length = registered.piece_length;
        let total_length = registered.content.len() as u64;
        let piece_count = (registered.content.len()).div_ceil(piece_length as usize) as u32;

        let mut pieces = Vec::with_capacity(piece_count as usize);
        for index in 0..piece_count {
            let start = index as usize * piece_length as usize;
            let end = (start + piece_length as usize).min(registered.content.len());
            pieces.push(registered.content.slice(start..end));
        }

        let mut complete = vec![false; piece_count as usize];
        let mut remaining: BTreeSet<u32> = (0..piece_count).collect();
        if let Some(blob) = params.resume_data {
            match serde_json::from_slice::<ResumeState>(&blob) {
                Ok(resume) => {
                    for index in resume.completed {
                        if index < piece_count {
                            complete[index as usize] = true;
                            remaining.remove(&index);
                        }
                    }
                }
                Err(e) => warn!("Ignoring damaged resume data: {e}"),
            }
        }

        let mut order: Vec<u32> = (0..piece_count).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);
        let mut scramble_rank = vec![0u32; piece_count as usize];
        for (position, piece) in order.iter().enumerate() {
            scramble_rank[*piece as usize] = position as u32;
        }

        let info = TorrentInfo {
            name: registered.name,
            info_hash,
            piece_count,
            piece_length,
            total_length,
        };

        let mut state = self.state.lock();
        state.torrent = Some(ActiveTorrent {
            info: info.clone(),
            pieces,
            complete,
            remaining,
            deadlines: HashMap::new(),
            scramble_rank,
        });
        state.events.clear();
        state.paused = true;
        state.sequential = false;

        debug!("Registered torrent {info_hash} with {piece_count} pieces, paused");
        Ok(info)
    }

    fn resume(&self) {
        self.state.lock().paused = false;
        self.event_notify.notify_waiters();
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn set_sequential(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.sequential = enabled;
        state.log.sequential_toggles.push(enabled);
    }

    fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration) {
        let mut state = self.state.lock();
        state.log.piece_deadlines.push((piece, deadline));
        if let Some(torrent) = state.torrent.as_mut() {
            torrent.deadlines.insert(piece.as_u32(), deadline);
        }
    }

    fn connect_peer(&self, addr: SocketAddr) {
        self.state.lock().log.connected_peers.push(addr);
    }

    fn add_dht_node(&self, addr: SocketAddr) {
        self.state.lock().log.dht_nodes.push(addr);
    }

    fn has_piece(&self, piece: PieceIndex) -> bool {
        let state = self.state.lock();
        state
            .torrent
            .as_ref()
            .and_then(|torrent| torrent.complete.get(piece.as_u32() as usize).copied())
            .unwrap_or(false)
    }

    fn request_piece_read(&self, piece: PieceIndex) {
        let mut state = self.state.lock();
        let event = match state.torrent.as_ref() {
            Some(torrent) => {
                let index = piece.as_u32() as usize;
                if index < torrent.pieces.len() && torrent.complete[index] {
                    Some(SwarmEvent::PieceRead {
                        piece,
                        data: torrent.pieces[index].clone(),
                    })
                } else {
                    debug!("Ignoring read request for incomplete piece {piece}");
                    None
                }
            }
            None => None,
        };

        if let Some(event) = event {
            state.events.push_back(event);
            self.event_notify.notify_waiters();
        }
    }

    fn request_resume_data(&self) {
        let mut state = self.state.lock();
        state.log.resume_requests += 1;

        let event = match state.torrent.as_ref() {
            Some(torrent) => {
                let completed: Vec<u32> = torrent
                    .complete
                    .iter()
                    .enumerate()
                    .filter(|(_, done)| **done)
                    .map(|(index, _)| index as u32)
                    .collect();
                match serde_json::to_vec(&ResumeState { completed }) {
                    Ok(data) => SwarmEvent::ResumeDataReady { data },
                    Err(e) => SwarmEvent::ResumeDataFailed {
                        reason: e.to_string(),
                    },
                }
            }
            None => SwarmEvent::ResumeDataFailed {
                reason: "no active torrent".to_string(),
            },
        };

        state.events.push_back(event);
        self.event_notify.notify_waiters();
    }

    async fn next_event(&self, timeout: Duration) -> Option<SwarmEvent> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if !state.paused {
                    let sequential = state.sequential;
                    if let Some(torrent) = state.torrent.as_mut() {
                        if let Some(piece) = torrent.complete_next(sequential) {
                            return Some(SwarmEvent::PieceFinished { piece });
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn status(&self) -> SwarmStatus {
        let state = self.state.lock();
        let Some(torrent) = state.torrent.as_ref() else {
            return SwarmStatus::default();
        };

        let piece_count = torrent.info.piece_count;
        let mut pieces = PieceBitmap::new(piece_count);
        for (index, done) in torrent.complete.iter().enumerate() {
            if *done {
                pieces.set(PieceIndex::new(index as u32));
            }
        }
        let complete_pieces = pieces.count_complete();
        let downloading = !state.paused && !torrent.remaining.is_empty();
        let connected = state.log.connected_peers.len() as u32;

        SwarmStatus {
            download_rate: if downloading {
                u64::from(torrent.info.piece_length)
            } else {
                0
            },
            upload_rate: 0,
            progress: complete_pieces as f32 / piece_count as f32,
            pieces,
            complete_pieces,
            num_peers: connected,
            num_seeds: connected,
            connected_peers: connected,
            connected_seeds: connected,
            num_uploads: 0,
            distributed_copies: connected as f32,
            seconds_to_next_announce: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered_swarm(piece_count: u32, piece_length: u32) -> (SimulatedSwarm, Vec<u8>) {
        let catalog = ContentCatalog::new();
        let content: Vec<u8> = (0..piece_count * piece_length)
            .map(|byte| (byte % 251) as u8)
            .collect();
        let descriptor = catalog
            .register("movie", piece_length, Bytes::from(content))
            .unwrap();
        (SimulatedSwarm::new(catalog), descriptor)
    }

    fn params(descriptor: &[u8]) -> TorrentParams {
        TorrentParams {
            descriptor: descriptor.to_vec(),
            save_path: std::path::PathBuf::from("/tmp"),
            resume_data: None,
        }
    }

    async fn drain_finished(swarm: &SimulatedSwarm, count: usize) -> Vec<u32> {
        let mut finished = Vec::new();
        while finished.len() < count {
            match swarm.next_event(Duration::from_millis(200)).await {
                Some(SwarmEvent::PieceFinished { piece }) => finished.push(piece.as_u32()),
                Some(_) => {}
                None => panic!("engine produced no event while pieces remain"),
            }
        }
        finished
    }

    #[tokio::test]
    async fn test_register_and_add_torrent() {
        let (swarm, descriptor) = registered_swarm(4, 16);

        let info = swarm.add_torrent(params(&descriptor)).await.unwrap();

        assert_eq!(info.name, "movie");
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_length, 16);
        assert_eq!(info.total_length, 64);
    }

    #[tokio::test]
    async fn test_short_last_piece_geometry() {
        let catalog = ContentCatalog::new();
        let descriptor = catalog
            .register("movie", 16, Bytes::from(vec![1u8; 40]))
            .unwrap();
        let swarm = SimulatedSwarm::new(catalog);

        let info = swarm.add_torrent(params(&descriptor)).await.unwrap();

        assert_eq!(info.piece_count, 3);
        assert_eq!(info.piece_size(PieceIndex::new(2)), 8);
    }

    #[tokio::test]
    async fn test_add_torrent_rejects_garbage_descriptor() {
        let (swarm, _) = registered_swarm(4, 16);

        let result = swarm.add_torrent(params(b"not a hash")).await;

        assert!(matches!(result, Err(StreamError::Engine { .. })));
    }

    #[tokio::test]
    async fn test_add_torrent_rejects_unknown_content() {
        let (swarm, _) = registered_swarm(4, 16);
        let unknown = InfoHash::new([9u8; 20]).to_string().into_bytes();

        let result = swarm.add_torrent(params(&unknown)).await;

        assert!(matches!(result, Err(StreamError::Engine { .. })));
    }

    #[tokio::test]
    async fn test_paused_engine_emits_no_completions() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();

        let event = swarm.next_event(Duration::from_millis(50)).await;

        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_sequential_mode_completes_in_index_order() {
        let (swarm, descriptor) = registered_swarm(6, 8);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_sequential(true);
        swarm.resume();

        let finished = drain_finished(&swarm, 6).await;

        assert_eq!(finished, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_scrambled_order_is_reproducible() {
        let (first, descriptor) = registered_swarm(16, 4);
        first.add_torrent(params(&descriptor)).await.unwrap();
        first.resume();
        let first_order = drain_finished(&first, 16).await;

        let catalog = ContentCatalog::new();
        let content: Vec<u8> = (0..64).map(|byte| (byte % 251) as u8).collect();
        let descriptor = catalog.register("movie", 4, Bytes::from(content)).unwrap();
        let second = SimulatedSwarm::new(catalog);
        second.add_torrent(params(&descriptor)).await.unwrap();
        second.resume();
        let second_order = drain_finished(&second, 16).await;

        assert_eq!(first_order, second_order);

        let mut sorted = first_order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_deadlines_pull_pieces_forward() {
        let (swarm, descriptor) = registered_swarm(6, 8);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_piece_deadline(PieceIndex::new(3), Duration::from_millis(1));
        swarm.set_piece_deadline(PieceIndex::new(0), Duration::from_millis(2));
        swarm.resume();

        let finished = drain_finished(&swarm, 6).await;

        assert_eq!(finished[0], 3);
        assert_eq!(finished[1], 0);
    }

    #[tokio::test]
    async fn test_piece_read_round_trip() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_sequential(true);
        swarm.resume();
        drain_finished(&swarm, 1).await;

        swarm.request_piece_read(PieceIndex::new(0));
        swarm.pause();

        let event = swarm.next_event(Duration::from_millis(200)).await.unwrap();
        match event {
            SwarmEvent::PieceRead { piece, data } => {
                assert_eq!(piece, PieceIndex::new(0));
                assert_eq!(data.len(), 16);
            }
            other => panic!("expected PieceRead, got {other:?}"),
        }
        assert!(swarm.has_piece(PieceIndex::new(0)));
    }

    #[tokio::test]
    async fn test_read_of_incomplete_piece_is_ignored() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();

        swarm.request_piece_read(PieceIndex::new(0));

        let event = swarm.next_event(Duration::from_millis(50)).await;
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_resume_data_round_trip() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_sequential(true);
        swarm.resume();
        drain_finished(&swarm, 2).await;
        swarm.pause();

        swarm.request_resume_data();
        let blob = match swarm.next_event(Duration::from_millis(200)).await.unwrap() {
            SwarmEvent::ResumeDataReady { data } => data,
            other => panic!("expected ResumeDataReady, got {other:?}"),
        };

        let catalog = ContentCatalog::new();
        let content: Vec<u8> = (0..64).map(|byte| (byte % 251) as u8).collect();
        let descriptor = catalog.register("movie", 16, Bytes::from(content)).unwrap();
        let reopened = SimulatedSwarm::new(catalog);
        let mut reopen_params = params(&descriptor);
        reopen_params.resume_data = Some(blob);
        reopened.add_torrent(reopen_params).await.unwrap();

        assert!(reopened.has_piece(PieceIndex::new(0)));
        assert!(reopened.has_piece(PieceIndex::new(1)));
        assert_eq!(reopened.status().complete_pieces, 2);
    }

    #[tokio::test]
    async fn test_damaged_resume_data_starts_fresh() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        let mut damaged = params(&descriptor);
        damaged.resume_data = Some(b"definitely not json".to_vec());

        swarm.add_torrent(damaged).await.unwrap();

        assert_eq!(swarm.status().complete_pieces, 0);
    }

    #[tokio::test]
    async fn test_status_tracks_progress() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_sequential(true);
        swarm.resume();
        drain_finished(&swarm, 2).await;

        let status = swarm.status();

        assert_eq!(status.complete_pieces, 2);
        assert!((status.progress - 0.5).abs() < f32::EPSILON);
        assert!(status.pieces.has(PieceIndex::new(0)));
        assert!(status.pieces.has(PieceIndex::new(1)));
        assert!(!status.pieces.has(PieceIndex::new(2)));
    }

    #[tokio::test]
    async fn test_pause_stops_completions() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.resume();
        drain_finished(&swarm, 1).await;
        swarm.pause();

        let event = swarm.next_event(Duration::from_millis(50)).await;

        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_call_log_records_scheduler_interactions() {
        let (swarm, descriptor) = registered_swarm(4, 16);
        swarm.add_torrent(params(&descriptor)).await.unwrap();
        swarm.set_sequential(true);
        swarm.set_sequential(false);
        swarm.set_piece_deadline(PieceIndex::new(2), Duration::from_millis(100));
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        swarm.connect_peer(addr);
        swarm.add_dht_node(addr);

        assert_eq!(swarm.sequential_calls(), vec![true, false]);
        assert_eq!(
            swarm.piece_deadlines(),
            vec![(PieceIndex::new(2), Duration::from_millis(100))]
        );
        assert_eq!(swarm.connected_peers(), vec![addr]);
        assert_eq!(swarm.dht_nodes(), vec![addr]);
    }
}
