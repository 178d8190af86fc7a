// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic bit generator for study assignments.
//!
//! The generator is PCG64 (PCG XSL-RR 128/64). Its algorithm and the
//! snapshot blob layout are part of the persisted format: every participant
//! row stores the state produced by its own assignment, and the next
//! assignment is drawn by restoring that state. Changing either is a format
//! break.
//!
//! Blob layout (40 bytes):
//!
//! | bytes  | field                          |
//! |--------|--------------------------------|
//! | 0..6   | magic `URNRNG`                 |
//! | 6      | format version (`1`)           |
//! | 7      | algorithm id (`1` = PCG64)     |
//! | 8..24  | LCG state, `u128` little endian |
//! | 24..40 | LCG increment, `u128` little endian |

use std::fmt;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{UrnError, UrnResult};

pub const PCG_MULTIPLIER: u128 = 0x2360_ED05_1FC6_5DA4_4385_DF64_9FCC_F645;
pub const DEFAULT_STREAM: u128 = 0x0a02_bdbf_7bb3_c0a7_ac28_fa16_a64a_bf96;

const STATE_MAGIC: &[u8; 6] = b"URNRNG";
const STATE_FORMAT_VERSION: u8 = 1;
const ALGORITHM_PCG64: u8 = 1;
pub const STATE_BLOB_LEN: usize = 40;

/// Opaque persisted snapshot bytes, as stored on a participant row.
///
/// Parsing is deferred to [`RngState::from_blob`] so a row with a foreign
/// blob still loads and the incompatibility surfaces when the state is used.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RngBlob(Vec<u8>);

impl RngBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> UrnResult<Self> {
        hex::decode(encoded.trim())
            .map(Self)
            .map_err(|e| UrnError::IncompatibleRngState(format!("bg_state is not hex: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for RngBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RngBlob({})", self.to_hex())
    }
}

impl Serialize for RngBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RngBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Immutable generator state. Drawing never mutates a `RngState`; it
/// produces a new one via [`StudyRng::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RngState {
    state: u128,
    increment: u128,
}

impl RngState {
    /// State a study starts from before its first assignment.
    pub fn from_seed(seed: u64) -> Self {
        Self::from_seed_and_stream(u128::from(seed), DEFAULT_STREAM)
    }

    /// Reference PCG initialization: `increment = (stream << 1) | 1`,
    /// `state = seed + increment`, then one LCG step.
    pub fn from_seed_and_stream(seed: u128, stream: u128) -> Self {
        let increment = (stream << 1) | 1;
        let state = seed.wrapping_add(increment);
        Self {
            state: lcg_step(state, increment),
            increment,
        }
    }

    pub fn to_bytes(&self) -> [u8; STATE_BLOB_LEN] {
        let mut out = [0u8; STATE_BLOB_LEN];
        out[..6].copy_from_slice(STATE_MAGIC);
        out[6] = STATE_FORMAT_VERSION;
        out[7] = ALGORITHM_PCG64;
        out[8..24].copy_from_slice(&self.state.to_le_bytes());
        out[24..40].copy_from_slice(&self.increment.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> UrnResult<Self> {
        if bytes.len() != STATE_BLOB_LEN {
            return Err(UrnError::IncompatibleRngState(format!(
                "expected {STATE_BLOB_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if &bytes[..6] != STATE_MAGIC {
            return Err(UrnError::IncompatibleRngState("bad magic".to_string()));
        }
        if bytes[6] != STATE_FORMAT_VERSION {
            return Err(UrnError::IncompatibleRngState(format!(
                "unsupported format version {}",
                bytes[6]
            )));
        }
        if bytes[7] != ALGORITHM_PCG64 {
            return Err(UrnError::IncompatibleRngState(format!(
                "unsupported generator algorithm {}",
                bytes[7]
            )));
        }
        let mut word = [0u8; 16];
        word.copy_from_slice(&bytes[8..24]);
        let state = u128::from_le_bytes(word);
        word.copy_from_slice(&bytes[24..40]);
        let increment = u128::from_le_bytes(word);
        if increment & 1 == 0 {
            return Err(UrnError::IncompatibleRngState(
                "lcg increment must be odd".to_string(),
            ));
        }
        Ok(Self { state, increment })
    }

    pub fn to_blob(&self) -> RngBlob {
        RngBlob(self.to_bytes().to_vec())
    }

    pub fn from_blob(blob: &RngBlob) -> UrnResult<Self> {
        Self::from_bytes(blob.as_bytes())
    }
}

fn lcg_step(state: u128, increment: u128) -> u128 {
    state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(increment)
}

fn output_xsl_rr(state: u128) -> u64 {
    let rot = (state >> 122) as u32;
    let xsl = ((state >> 64) as u64) ^ (state as u64);
    xsl.rotate_right(rot)
}

/// Working generator for a single assignment. Built from a [`RngState`],
/// consumed locally, and snapshotted once the draw is complete.
#[derive(Debug, Clone)]
pub struct StudyRng {
    state: u128,
    increment: u128,
}

impl StudyRng {
    pub fn restore(state: &RngState) -> Self {
        Self {
            state: state.state,
            increment: state.increment,
        }
    }

    pub fn snapshot(&self) -> RngState {
        RngState {
            state: self.state,
            increment: self.increment,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = lcg_step(self.state, self.increment);
        output_xsl_rr(self.state)
    }

    /// Uniform integer in `[0, n)` by rejection: outputs below
    /// `2^64 mod n` are discarded so every residue is equally likely.
    pub fn uniform_below(&mut self, n: u64) -> UrnResult<u64> {
        if n == 0 {
            return Err(UrnError::EmptyChoice);
        }
        let threshold = n.wrapping_neg() % n;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return Ok(r % n);
            }
        }
    }

    pub fn uniform_index(&mut self, len: usize) -> UrnResult<usize> {
        let n = u64::try_from(len).map_err(|_| UrnError::EmptyChoice)?;
        let idx = self.uniform_below(n)?;
        usize::try_from(idx).map_err(|_| UrnError::EmptyChoice)
    }

    /// Index drawn with probability `weights[i] / sum(weights)`.
    pub fn weighted_index(&mut self, weights: &[u64]) -> UrnResult<usize> {
        let total = weights
            .iter()
            .try_fold(0u64, |acc, w| acc.checked_add(*w))
            .ok_or(UrnError::EmptyChoice)?;
        let r = self.uniform_below(total)?;
        let mut cumulative = 0u64;
        for (i, w) in weights.iter().enumerate() {
            cumulative += *w;
            if r < cumulative {
                return Ok(i);
            }
        }
        Err(UrnError::EmptyChoice)
    }
}

/// Generator for synthetic cohorts. It is not a [`StudyRng`], so dummy
/// sampling cannot advance a study's chain.
#[derive(Debug, Clone)]
pub struct DummyRng {
    inner: Pcg64,
}

impl DummyRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Pcg64::seed_from_u64(seed),
        }
    }

    pub fn pick<'a>(&mut self, levels: &'a [String]) -> UrnResult<&'a String> {
        levels.choose(&mut self.inner).ok_or(UrnError::EmptyChoice)
    }
}

/// Seed for a study created without one.
pub fn fresh_seed() -> u64 {
    OsRng.next_u64()
}
