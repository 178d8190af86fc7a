// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tamper-evidence for assignment histories: every persisted record is a
//! leaf, and a study's history digest is the RFC 6962 style Merkle root
//! over its leaves in insertion order.

use sha2::{Digest, Sha256};

use crate::error::{UrnError, UrnResult};
use crate::participant::ParticipantRow;

pub type Hash32 = [u8; 32];

fn sha256(bytes: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// Canonical record bytes: the JSON encoding that the file log stores.
pub fn record_bytes(row: &ParticipantRow) -> UrnResult<Vec<u8>> {
    serde_json::to_vec(row).map_err(|e| UrnError::Storage(format!("encode row {}: {e}", row.id)))
}

pub fn leaf_hash(record: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + record.len());
    buf.push(0u8);
    buf.extend_from_slice(record);
    sha256(&buf)
}

fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 65];
    buf[0] = 1;
    buf[1..33].copy_from_slice(left);
    buf[33..65].copy_from_slice(right);
    sha256(&buf)
}

fn split_point(n: usize) -> usize {
    1usize << (usize::BITS - 1 - (n - 1).leading_zeros())
}

pub fn history_root(leaves: &[Hash32]) -> Hash32 {
    match leaves.len() {
        0 => sha256(b""),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&history_root(&leaves[..k]), &history_root(&leaves[k..]))
        }
    }
}
