// Copyright [2026] [urnrand Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

//! urnrand-core
//!
//! Reproducible urn randomization for sequential treatment assignment in
//! multi-factor stratified trials (Wei's urn model).
//!
//! - Deterministic PCG64 generator with a versioned, persisted snapshot per assignment
//! - Append-only participant stores (memory, length-prefixed file log) with a Merkle history digest
//! - Urn aggregation, exact imbalance scoring (range, variance) and named tie-break policies
//! - Study coordinator: create, randomize, import, upload, dummy cohorts, export, replay audit

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod audit;
pub mod clock;
pub mod config;
pub mod config_store;
pub mod coordinator;
pub mod csv_io;
pub mod error;
pub mod imbalance;
pub mod participant;
pub mod participant_log;
pub mod rng;
pub mod selection;
pub mod store;
pub mod urn;

pub use crate::error::{ErrorKind, UrnError, UrnResult};

pub use crate::config::{ImbalanceRule, StudyConfig};
pub use crate::coordinator::{Coordinator, StudyStatus, UploadOutcome, VerifyReport};
pub use crate::participant::{FactorLevels, HistoryRow, NewParticipant, ParticipantRow};
pub use crate::rng::{RngBlob, RngState};
