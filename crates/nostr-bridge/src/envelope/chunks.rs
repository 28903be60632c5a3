use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use tracing::warn;

use super::EnvelopeError;

/// `group_id[16] ‖ index u16 BE ‖ total u16 BE`
pub const CHUNK_HEADER_LEN: usize = 20;
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_GROUPS: usize = 32;

pub type GroupId = [u8; 16];

pub(crate) fn new_group_id() -> GroupId {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    id
}

/// One decrypted chunk of a chunk group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub group_id: GroupId,
    pub index: u16,
    pub total: u16,
    pub data: Vec<u8>,
}

impl Chunk {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.group_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(EnvelopeError::InvalidChunkHeader);
        }
        let mut group_id = [0u8; 16];
        group_id.copy_from_slice(&bytes[..16]);
        let index = u16::from_be_bytes([bytes[16], bytes[17]]);
        let total = u16::from_be_bytes([bytes[18], bytes[19]]);
        if total == 0 || index >= total {
            return Err(EnvelopeError::InvalidChunkHeader);
        }
        Ok(Self {
            group_id,
            index,
            total,
            data: bytes[CHUNK_HEADER_LEN..].to_vec(),
        })
    }
}

/// Reassembly state for a single chunk group.
#[derive(Debug)]
pub struct ChunkGroup {
    group_id: GroupId,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Instant,
}

impl ChunkGroup {
    pub fn new(group_id: GroupId, total: u16, now: Instant) -> Self {
        Self {
            group_id,
            parts: vec![None; total as usize],
            received: 0,
            first_seen: now,
        }
    }

    /// Reassemble a group delivered in full, in index order.
    pub fn assemble(chunks: Vec<Chunk>) -> Result<Vec<u8>, EnvelopeError> {
        let first = chunks.first().ok_or(EnvelopeError::MissingChunks {
            received: 0,
            total: 0,
        })?;
        let mut group = Self::new(first.group_id, first.total, Instant::now());
        for (position, chunk) in chunks.into_iter().enumerate() {
            if chunk.group_id != group.group_id {
                return Err(EnvelopeError::GroupMismatch);
            }
            if chunk.index as usize != position {
                return Err(EnvelopeError::OutOfOrder {
                    index: chunk.index,
                    expected: position,
                });
            }
            group.insert(chunk)?;
        }
        group.into_bytes()
    }

    pub fn insert(&mut self, chunk: Chunk) -> Result<(), EnvelopeError> {
        if chunk.group_id != self.group_id {
            return Err(EnvelopeError::GroupMismatch);
        }
        if chunk.total as usize != self.parts.len() {
            return Err(EnvelopeError::InvalidChunkHeader);
        }
        let index = chunk.index;
        match &self.parts[index as usize] {
            None => {
                self.parts[index as usize] = Some(chunk.data);
                self.received += 1;
                Ok(())
            }
            Some(existing) if *existing == chunk.data => Ok(()),
            Some(_) => Err(EnvelopeError::ConflictingChunk(index)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.parts.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn total(&self) -> usize {
        self.parts.len()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, EnvelopeError> {
        if !self.is_complete() {
            return Err(EnvelopeError::MissingChunks {
                received: self.received,
                total: self.parts.len(),
            });
        }
        Ok(self.parts.into_iter().flatten().flatten().collect())
    }
}

/// Holds incomplete chunk groups across events until they complete or expire.
///
/// A failed insert discards the whole group; nothing from a broken group is
/// ever emitted.
#[derive(Debug)]
pub struct ChunkReassembler {
    groups: HashMap<GroupId, ChunkGroup>,
    ttl: Duration,
    max_groups: usize,
}

impl ChunkReassembler {
    pub fn new(ttl: Duration, max_groups: usize) -> Self {
        Self {
            groups: HashMap::new(),
            ttl,
            max_groups: max_groups.max(1),
        }
    }

    /// Add the chunks of one wrapper. Returns the full plaintext bytes once the
    /// group is complete.
    ///
    /// Chunks within one wrapper must belong to one group and carry ascending,
    /// gap-free indices.
    pub fn accept(
        &mut self,
        chunks: Vec<Chunk>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, EnvelopeError> {
        self.prune(now);

        let (group_id, total) = match chunks.first() {
            Some(first) => (first.group_id, first.total),
            None => return Err(EnvelopeError::MalformedWrapper("no chunks".to_string())),
        };
        for pair in chunks.windows(2) {
            if pair[1].group_id != group_id {
                return Err(EnvelopeError::GroupMismatch);
            }
            let expected = pair[0].index as usize + 1;
            if pair[1].index as usize != expected {
                return Err(EnvelopeError::OutOfOrder {
                    index: pair[1].index,
                    expected,
                });
            }
        }

        if !self.groups.contains_key(&group_id) {
            self.evict_oldest_if_full();
        }
        let group = self
            .groups
            .entry(group_id)
            .or_insert_with(|| ChunkGroup::new(group_id, total, now));

        for chunk in chunks {
            if let Err(err) = group.insert(chunk) {
                self.groups.remove(&group_id);
                return Err(err);
            }
        }

        if !group.is_complete() {
            return Ok(None);
        }
        match self.groups.remove(&group_id) {
            Some(group) => group.into_bytes().map(Some),
            None => Ok(None),
        }
    }

    /// Drop groups older than the retention bound. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.groups.len();
        self.groups.retain(|_, group| group.age(now) < ttl);
        let dropped = before - self.groups.len();
        if dropped > 0 {
            warn!(dropped, "Discarded incomplete chunk groups after retention bound");
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    fn evict_oldest_if_full(&mut self) {
        if self.groups.len() < self.max_groups {
            return;
        }
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.first_seen)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            if let Some(group) = self.groups.remove(&id) {
                warn!(
                    received = group.received(),
                    total = group.total(),
                    "Discarded oldest incomplete chunk group"
                );
            }
        }
    }
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_TTL, DEFAULT_MAX_GROUPS)
    }
}
