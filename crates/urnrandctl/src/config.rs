// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use urnrand_core::{UrnError, UrnResult};

pub const DATA_DIR_ENV: &str = "URNRAND_DATA_DIR";
pub const LOG_ENV: &str = "URNRAND_LOG";
pub const FSYNC_ENV: &str = "URNRAND_FSYNC";

/// Runtime settings for one invocation. Flags override the environment,
/// which overrides the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub fsync: bool,
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./urnrand-data"),
            log: "warn".to_string(),
            fsync: false,
        }
    }
}

impl CtlConfig {
    pub fn from_env() -> UrnResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> UrnResult<Self> {
        let mut cfg = Self::default();
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(log) = lookup(LOG_ENV).filter(|v| !v.is_empty()) {
            cfg.log = log;
        }
        if let Some(raw) = lookup(FSYNC_ENV) {
            cfg.fsync = parse_flag(&raw).ok_or_else(|| {
                UrnError::validation(format!("{FSYNC_ENV} must be a boolean, got {raw:?}"))
            })?;
        }
        Ok(cfg)
    }

    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        fsync: bool,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        if let Some(log) = log {
            self.log = log;
        }
        self.fsync |= fsync;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Some(false),
        "1" | "true" | "yes" | "on" => Some(true),
        _ => None,
    }
}
