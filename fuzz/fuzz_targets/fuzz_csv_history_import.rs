// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use urnrand_core::csv_io::{read_history, read_new_participants};
use urnrand_core::StudyConfig;

const STUDY: &[u8] = br#"{
    "name": "fuzz",
    "w": 1,
    "alpha": 2,
    "beta": 1,
    "treatments": ["A", "B"],
    "factors": {"arm": ["x", "y"], "site": ["north", "south"]}
}"#;

fuzz_target!(|data: &[u8]| {
    let config = StudyConfig::from_json_slice(STUDY).expect("fixed study");
    if let Ok(rows) = read_history(&config, data) {
        for row in rows {
            assert!(!row.trt.is_empty());
            assert_eq!(row.levels.len(), config.factors.len());
        }
    }
    let _ = read_new_participants(&config, data);
});
