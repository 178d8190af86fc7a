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

#![no_main]

use libfuzzer_sys::fuzz_target;
use urnrand_core::participant_log::read_records;

fuzz_target!(|data: &[u8]| {
    let Ok(records) = read_records(data) else {
        return;
    };
    let framed: usize = records.iter().map(|r| 4 + r.len()).sum();
    // Up to three bytes of a length prefix may trail the last record.
    assert!(framed <= data.len() && data.len() - framed < 4);
});
