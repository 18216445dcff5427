//! Bounded reorder buffer bridging swarm arrival order and playback order.
//!
//! Producers insert pieces in whatever order the swarm completes them; a
//! consumer drains them strictly by index. The buffer is the only
//! synchronization point between the feeder task and the playback side.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::torrent::PieceIndex;
use crate::{Result, StreamError};

/// One downloaded piece, ready for playback.
///
/// Built by the feeder from engine read events. The payload length always
/// matches what the engine delivered for this index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: PieceIndex,
    pub data: Bytes,
}

impl Piece {
    /// Creates a piece from an index and its payload.
    pub fn new(index: PieceIndex, data: Bytes) -> Self {
        Self { index, data }
    }

    /// Returns the payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct BufferState {
    /// Resident pieces keyed by index, at most `capacity` entries
    slots: HashMap<u32, Piece>,
    /// Index the consumer will receive next
    next_index: u32,
    closed: bool,
}

/// Reorder buffer with out-of-order inserts and strictly in-order drain.
///
/// Inserts block while `capacity` unconsumed pieces are resident, which
/// bounds memory and applies backpressure to the producer. `close` releases
/// every blocked task; after it, drains report `None` and inserts are
/// silently discarded.
///
/// A capacity smaller than the piece count assumes producers deliver
/// indices in non-decreasing fetch order, as the session feeder does. A
/// producer inserting arbitrary permutations can otherwise block forever on
/// a full window whose hole lies outside it; such producers need
/// `capacity == piece_count`.
pub struct PlaybackBuffer {
    state: Mutex<BufferState>,
    /// Signaled when the piece at the cursor becomes resident
    data_ready: Notify,
    /// Signaled when a slot frees up
    space_ready: Notify,
    piece_count: u32,
    capacity: usize,
}

impl PlaybackBuffer {
    /// Creates a buffer for a torrent with `piece_count` pieces, admitting
    /// at most `capacity` unconsumed pieces at a time.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If `piece_count` or `capacity` is zero
    pub fn new(piece_count: u32, capacity: usize) -> Result<Self> {
        if piece_count == 0 {
            return Err(StreamError::invalid_input(
                "buffer requires at least one piece",
            ));
        }
        if capacity == 0 {
            return Err(StreamError::invalid_input(
                "buffer requires a non-zero capacity",
            ));
        }

        Ok(Self {
            state: Mutex::new(BufferState {
                slots: HashMap::new(),
                next_index: 0,
                closed: false,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            piece_count,
            capacity,
        })
    }

    /// Inserts a downloaded piece, waiting while the buffer is full.
    ///
    /// Re-inserting an index that is resident but unconsumed replaces its
    /// payload without consuming extra capacity. Inserting into a closed
    /// buffer discards the piece and reports success, so producers drain
    /// cleanly during teardown.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidInput` - If the index is outside the torrent,
    ///   the payload is empty, or the index was already consumed
    pub async fn insert(&self, piece: Piece) -> Result<()> {
        let index = piece.index.as_u32();
        if index >= self.piece_count {
            return Err(StreamError::invalid_input(format!(
                "piece {index} out of range for {} pieces",
                self.piece_count
            )));
        }
        if piece.data.is_empty() {
            return Err(StreamError::invalid_input(format!(
                "piece {index} has an empty payload"
            )));
        }

        loop {
            // Register for wakeup before checking state so a close or take
            // landing in between still reaches us.
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Ok(());
                }
                if index < state.next_index {
                    return Err(StreamError::invalid_input(format!(
                        "piece {index} was already consumed"
                    )));
                }
                if state.slots.contains_key(&index) || state.slots.len() < self.capacity {
                    let at_cursor = index == state.next_index;
                    state.slots.insert(index, piece);
                    if at_cursor {
                        self.data_ready.notify_waiters();
                    }
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Removes and returns the next piece in playback order, waiting until
    /// it arrives.
    ///
    /// Returns `None` once every piece has been consumed, or as soon as the
    /// buffer is closed, even when later pieces are still resident.
    pub async fn next_piece(&self) -> Option<Piece> {
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.next_index >= self.piece_count {
                    return None;
                }
                let cursor = state.next_index;
                if let Some(piece) = state.slots.remove(&cursor) {
                    state.next_index += 1;
                    self.space_ready.notify_waiters();
                    return Some(piece);
                }
            }

            notified.await;
        }
    }

    /// Closes the buffer and wakes every blocked producer and consumer.
    ///
    /// Idempotent. Resident pieces are kept but never delivered.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Returns whether the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the index the consumer will receive next.
    pub fn next_index(&self) -> u32 {
        self.state.lock().next_index
    }

    /// Returns the number of resident unconsumed pieces.
    pub fn buffered(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Returns the piece count this buffer was created for.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Returns the maximum number of resident unconsumed pieces.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
