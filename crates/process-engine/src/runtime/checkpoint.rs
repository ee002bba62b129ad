//! Compressed snapshots of the execution arena
//!
//! Each command captures the arena before it runs. A failed command restores
//! the snapshot, so either the instance reaches a new consistent wait state
//! or nothing it did is observable.

use super::tree::ExecutionTree;
use crate::error::{ProcessEngineError, Result};

/// One zstd-compressed JSON snapshot of an `ExecutionTree`
#[derive(Debug, Clone)]
pub struct Checkpoint {
    compressed: Vec<u8>,
}

impl Checkpoint {
    /// Capture the arena at the given zstd level
    pub fn capture(tree: &ExecutionTree, level: i32) -> Result<Self> {
        let json = serde_json::to_vec(tree)?;
        let compressed = zstd::encode_all(&json[..], level)
            .map_err(|e| ProcessEngineError::Compression(e.to_string()))?;
        Ok(Self { compressed })
    }

    /// Decompress the arena; the restored tree starts with no pending changes
    pub fn restore(&self) -> Result<ExecutionTree> {
        let json = zstd::decode_all(&self.compressed[..])
            .map_err(|e| ProcessEngineError::Compression(e.to_string()))?;
        let tree: ExecutionTree = serde_json::from_slice(&json)?;
        Ok(tree)
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}
