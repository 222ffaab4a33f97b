//! Per-node fragment log with LZ4 compression and compaction.
//!
//! Every committed change to a node is kept as one CRDT update fragment in
//! the `fragments` column family, keyed by `node_id ++ seq`. Replaying the
//! fragments of a node in key order rebuilds its document. Compaction folds
//! all fragments of a node into a single snapshot fragment.
//!
//! ```text
//!  node ++ 0007  [snapshot]  ◄── node ++ 0012 ◄── node ++ 0019
//!                (LZ4)            (LZ4)            (LZ4)
//! ```

use canopy_core::{NodeId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rocks::{keys, ReplicaStore, StoreError, UnitOfWork, CF_FRAGMENTS};

const FRAGMENT_SEQUENCE: &str = "fragment";

/// A compressed fragment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedDelta {
    /// Position in the node's fragment log
    pub seq: u64,
    /// Original uncompressed size in bytes
    pub original_size: u32,
    /// LZ4-compressed payload
    pub compressed: Vec<u8>,
}

impl CompressedDelta {
    pub fn compress(seq: u64, data: &[u8]) -> Self {
        let compressed = lz4_flex::compress_prepend_size(data);
        Self {
            seq,
            original_size: data.len() as u32,
            compressed,
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

/// One CRDT update, as produced by a writer or merged from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFragment {
    pub id: Uuid,
    pub node_id: NodeId,
    pub data: Vec<u8>,
    pub created_at: u64,
    pub created_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFragment {
    id: Uuid,
    created_at: u64,
    created_by: UserId,
    delta: CompressedDelta,
}

/// Statistics for one node's fragment log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentStats {
    pub fragment_count: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub head_seq: u64,
}

impl FragmentStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

/// Fragment log view over a [`ReplicaStore`].
pub struct FragmentLog<'a> {
    store: &'a ReplicaStore,
}

impl<'a> FragmentLog<'a> {
    pub fn new(store: &'a ReplicaStore) -> Self {
        Self { store }
    }

    /// Stage `fragment` at the tail of its node's log.
    pub fn append(&self, uow: &mut UnitOfWork<'_>, fragment: &UpdateFragment) -> Result<u64, StoreError> {
        let seq = uow.next_sequence(FRAGMENT_SEQUENCE)?;
        let stored = StoredFragment {
            id: fragment.id,
            created_at: fragment.created_at,
            created_by: fragment.created_by,
            delta: CompressedDelta::compress(seq, &fragment.data),
        };
        uow.put(CF_FRAGMENTS, &keys::sequenced(fragment.node_id, seq), &stored)?;
        Ok(seq)
    }

    fn stored(&self, node_id: NodeId) -> Result<Vec<StoredFragment>, StoreError> {
        self.store
            .scan_prefix(CF_FRAGMENTS, node_id.as_bytes())?
            .iter()
            .map(|(_, value)| super::rocks::decode::<StoredFragment>(value))
            .collect()
    }

    /// All fragments of a node in log order.
    pub fn load(&self, node_id: NodeId) -> Result<Vec<UpdateFragment>, StoreError> {
        self.stored(node_id)?
            .into_iter()
            .map(|stored| {
                Ok(UpdateFragment {
                    id: stored.id,
                    node_id,
                    data: stored.delta.decompress()?,
                    created_at: stored.created_at,
                    created_by: stored.created_by,
                })
            })
            .collect()
    }

    pub fn contains(&self, node_id: NodeId, fragment_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.stored(node_id)?.iter().any(|f| f.id == fragment_id))
    }

    pub fn count(&self, node_id: NodeId) -> Result<usize, StoreError> {
        Ok(self.store.scan_prefix(CF_FRAGMENTS, node_id.as_bytes())?.len())
    }

    pub fn stats(&self, node_id: NodeId) -> Result<FragmentStats, StoreError> {
        let mut stats = FragmentStats::default();
        for fragment in self.stored(node_id)? {
            stats.fragment_count += 1;
            stats.total_original_bytes += fragment.delta.original_size as u64;
            stats.total_compressed_bytes += fragment.delta.compressed.len() as u64;
            stats.head_seq = stats.head_seq.max(fragment.delta.seq);
        }
        Ok(stats)
    }

    /// Stage removal of every fragment of a node.
    pub fn remove_all(&self, uow: &mut UnitOfWork<'_>, node_id: NodeId) -> Result<usize, StoreError> {
        let rows = self.store.scan_prefix(CF_FRAGMENTS, node_id.as_bytes())?;
        for (key, _) in &rows {
            uow.delete(CF_FRAGMENTS, key)?;
        }
        Ok(rows.len())
    }

    /// Stage replacement of the node's current fragments by `snapshot`.
    ///
    /// The snapshot takes the key and id of the newest fragment, so
    /// fragments appended later keep sorting after it. Returns the number of
    /// fragments folded away.
    pub fn compact(
        &self,
        uow: &mut UnitOfWork<'_>,
        node_id: NodeId,
        snapshot: &[u8],
    ) -> Result<usize, StoreError> {
        let rows = self.store.scan_prefix(CF_FRAGMENTS, node_id.as_bytes())?;
        let Some((head_key, head_value)) = rows.last() else {
            return Ok(0);
        };
        let head: StoredFragment = super::rocks::decode(head_value)?;

        for (key, _) in &rows[..rows.len() - 1] {
            uow.delete(CF_FRAGMENTS, key)?;
        }
        let merged = StoredFragment {
            id: head.id,
            created_at: head.created_at,
            created_by: head.created_by,
            delta: CompressedDelta::compress(head.delta.seq, snapshot),
        };
        uow.put(CF_FRAGMENTS, head_key, &merged)?;
        Ok(rows.len() - 1)
    }
}
