// src/delta.rs - Block-based binary deltas between artifact versions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeltaError {
    #[error("Delta base mismatch - patch built against {expected}, local base is {actual}")]
    BaseMismatch { expected: String, actual: String },
    #[error("Malformed delta patch: {reason}")]
    MalformedPatch { reason: String },
    #[error("Delta produced wrong output - expected checksum {expected}, got {actual}")]
    TargetMismatch { expected: String, actual: String },
    #[error("Failed to encode delta patch: {reason}")]
    EncodeFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct DeltaConfig {
    pub block_size: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DeltaOp {
    /// Copy `len` bytes from `offset` in the base payload.
    Copy { offset: u64, len: u64 },
    /// Insert literal bytes not present in the base.
    Insert { data: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaPatch {
    base_checksum: String,
    target_checksum: String,
    target_len: u64,
    ops: Vec<DeltaOp>,
}

/// Computes and applies binary deltas between two versions of the same
/// artifact. Application is fenced on the base checksum: a patch never
/// touches a base it was not computed against.
pub struct DeltaUpdateManager {
    config: DeltaConfig,
}

impl DeltaUpdateManager {
    pub fn new(config: DeltaConfig) -> Self {
        Self { config }
    }

    /// Greedy block matcher: base blocks are indexed by content hash, the
    /// new payload is scanned for reuse, unmatched bytes become literals.
    pub fn compute_delta(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let block_size = self.config.block_size.max(1);

        let mut base_blocks: HashMap<[u8; 32], u64> = HashMap::new();
        for (i, block) in old.chunks_exact(block_size).enumerate() {
            base_blocks
                .entry(block_hash(block))
                .or_insert((i * block_size) as u64);
        }

        let mut ops = Vec::new();
        let mut literal = Vec::new();
        let mut pos = 0usize;

        while pos < new.len() {
            if pos + block_size <= new.len() {
                let candidate = &new[pos..pos + block_size];
                if let Some(&offset) = base_blocks.get(&block_hash(candidate)) {
                    // Hash hit; confirm against the base bytes before reusing
                    let base_block = &old[offset as usize..offset as usize + block_size];
                    if base_block == candidate {
                        if !literal.is_empty() {
                            ops.push(DeltaOp::Insert {
                                data: std::mem::take(&mut literal),
                            });
                        }
                        match ops.last_mut() {
                            Some(DeltaOp::Copy {
                                offset: prev_offset,
                                len,
                            }) if *prev_offset + *len == offset => {
                                *len += block_size as u64;
                            }
                            _ => ops.push(DeltaOp::Copy {
                                offset,
                                len: block_size as u64,
                            }),
                        }
                        pos += block_size;
                        continue;
                    }
                }
            }
            literal.push(new[pos]);
            pos += 1;
        }

        if !literal.is_empty() {
            ops.push(DeltaOp::Insert { data: literal });
        }

        let patch = DeltaPatch {
            base_checksum: hex_digest(old),
            target_checksum: hex_digest(new),
            target_len: new.len() as u64,
            ops,
        };

        let encoded = bincode::serialize(&patch).map_err(|e| DeltaError::EncodeFailed {
            reason: e.to_string(),
        })?;
        debug!(
            base_len = old.len(),
            target_len = new.len(),
            patch_len = encoded.len(),
            "computed delta patch"
        );
        Ok(encoded)
    }

    /// Applies a patch to a local base. Fails fast with `BaseMismatch` when
    /// the local base is not the version the patch was computed against.
    pub fn apply_delta(&self, base: &[u8], patch_bytes: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let patch: DeltaPatch =
            bincode::deserialize(patch_bytes).map_err(|e| DeltaError::MalformedPatch {
                reason: e.to_string(),
            })?;

        let base_checksum = hex_digest(base);
        if base_checksum != patch.base_checksum {
            return Err(DeltaError::BaseMismatch {
                expected: patch.base_checksum,
                actual: base_checksum,
            });
        }

        // Validate every op and the declared output length before allocating
        // anything sized by the patch; the header is untrusted input.
        let mut expected_len: u64 = 0;
        for op in &patch.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    let end = offset
                        .checked_add(*len)
                        .ok_or_else(|| malformed("copy range overflow"))?;
                    if end > base.len() as u64 {
                        return Err(malformed("copy range exceeds base payload"));
                    }
                    expected_len = expected_len
                        .checked_add(*len)
                        .ok_or_else(|| malformed("op lengths overflow"))?;
                }
                DeltaOp::Insert { data } => {
                    expected_len = expected_len
                        .checked_add(data.len() as u64)
                        .ok_or_else(|| malformed("op lengths overflow"))?;
                }
            }
        }
        if expected_len != patch.target_len {
            return Err(malformed("op lengths disagree with patch header"));
        }

        let mut out = Vec::with_capacity(patch.target_len as usize);
        for op in &patch.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    let start = *offset as usize;
                    out.extend_from_slice(&base[start..start + *len as usize]);
                }
                DeltaOp::Insert { data } => out.extend_from_slice(data),
            }
        }

        if out.len() as u64 != patch.target_len {
            return Err(malformed("reconstructed length disagrees with patch header"));
        }
        let actual = hex_digest(&out);
        if actual != patch.target_checksum {
            return Err(DeltaError::TargetMismatch {
                expected: patch.target_checksum,
                actual,
            });
        }

        Ok(out)
    }

    /// Fraction of transfer saved by shipping a delta instead of the full
    /// new payload. Zero when the delta would not be smaller.
    pub fn estimate_savings(&self, old: &[u8], new: &[u8]) -> Result<f32, DeltaError> {
        if new.is_empty() {
            return Ok(0.0);
        }
        let patch = self.compute_delta(old, new)?;
        let ratio = patch.len() as f32 / new.len() as f32;
        Ok((1.0 - ratio).max(0.0))
    }
}

impl Default for DeltaUpdateManager {
    fn default() -> Self {
        Self::new(DeltaConfig::default())
    }
}

fn block_hash(block: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(block);
    hasher.finalize().into()
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn malformed(reason: &str) -> DeltaError {
    DeltaError::MalformedPatch {
        reason: reason.to_string(),
    }
}
