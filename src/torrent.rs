//! Torrent identity and descriptor types shared across the crate.

use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the torrent's info dictionary. Used to uniquely
/// identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Computes the InfoHash of raw bytes.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash = hasher.finalize();

        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&hash[..20]);
        Self(hash_array)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent content is divided into fixed-size pieces for downloading.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a torrent descriptor comes from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Path to a descriptor file on disk
    File(PathBuf),
    /// Descriptor already held in memory
    Bytes(Vec<u8>),
}

/// Torrent metadata reported by the engine after a descriptor is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub info_hash: InfoHash,
    /// Number of pieces the content is divided into
    pub piece_count: u32,
    /// Nominal piece size in bytes; the final piece may be shorter
    pub piece_length: u32,
    /// Total content length in bytes
    pub total_length: u64,
}

impl TorrentInfo {
    /// Returns the byte size of the given piece, accounting for the
    /// shorter final piece.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let index = piece.as_u32();
        if index + 1 < self.piece_count {
            return self.piece_length;
        }

        let remainder = self.total_length % u64::from(self.piece_length);
        if remainder == 0 {
            self.piece_length
        } else {
            remainder as u32
        }
    }
}

/// Packed per-piece completion map.
///
/// One bit per piece, most significant bit first within each byte, matching
/// the BitTorrent bitfield wire convention.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PieceBitmap {
    bits: Vec<u8>,
    piece_count: u32,
}

impl PieceBitmap {
    /// Creates an empty bitmap for the given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Marks a piece complete. Indices past the end are ignored.
    pub fn set(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index < self.piece_count {
            self.bits[(index / 8) as usize] |= 0x80 >> (index % 8);
        }
    }

    /// Returns whether the given piece is marked complete.
    pub fn has(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return false;
        }
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    /// Returns the number of pieces marked complete.
    pub fn count_complete(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Returns the number of pieces this bitmap tracks.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }
}
