// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use urnrand_core::rng::{RngState, StudyRng};

fuzz_target!(|data: &[u8]| {
    let Ok(state) = RngState::from_bytes(data) else {
        return;
    };
    assert_eq!(&state.to_bytes()[..], data);

    let mut a = StudyRng::restore(&state);
    let mut b = StudyRng::restore(&RngState::from_blob(&state.to_blob()).expect("own blob"));
    for n in [1u64, 2, 3, 7, u64::MAX] {
        let x = a.uniform_below(n).expect("non-empty range");
        assert!(x < n);
        assert_eq!(Some(x), b.uniform_below(n).ok());
    }
    assert_eq!(a.snapshot(), b.snapshot());
});
