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

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod config;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use urnrand_core::csv_io::{read_history, read_new_participants, write_history};
use urnrand_core::{
    Coordinator, ErrorKind, FactorLevels, NewParticipant, StudyConfig, UrnError, UrnResult,
};

use crate::config::CtlConfig;

#[derive(Parser, Debug)]
#[command(name = "urnrandctl", about = "Urn randomization for stratified trials")]
struct Cli {
    /// Directory holding study configurations and participant logs.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Tracing filter directive for stderr logs.
    #[arg(long, global = true)]
    log: Option<String>,
    /// Flush participant logs to disk after every append.
    #[arg(long, global = true)]
    fsync: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateStudy {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        name: String,
    },
    Randomize {
        #[arg(long)]
        study: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        user: String,
        #[arg(long = "factor", value_parser = parse_level, required = true)]
        factors: Vec<(String, String)>,
    },
    UploadParticipants {
        #[arg(long)]
        study: String,
        #[arg(long)]
        csv: PathBuf,
    },
    ImportHistory {
        #[arg(long)]
        study: String,
        #[arg(long)]
        csv: PathBuf,
    },
    ExportHistory {
        #[arg(long)]
        study: String,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    GenerateDummies {
        #[arg(long)]
        study: String,
        #[arg(long)]
        count: usize,
        #[arg(long)]
        seed: u64,
    },
    Status {
        #[arg(long)]
        study: String,
    },
    /// Shows the annotated urn table a participant would be drawn from.
    Preview {
        #[arg(long)]
        study: String,
        #[arg(long = "factor", value_parser = parse_level, required = true)]
        factors: Vec<(String, String)>,
    },
    /// Replays the stored history and reports the first divergence.
    Verify {
        #[arg(long)]
        study: String,
    },
}

/// What to print on stdout, and the exit code to leave with.
struct Reply {
    body: Option<Value>,
    code: i32,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Self {
            body: Some(body),
            code: 0,
        }
    }
}

fn parse_level(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((factor, level)) if !factor.trim().is_empty() => {
            Ok((factor.trim().to_string(), level.trim().to_string()))
        }
        _ => Err(format!("expected factor=level, got {raw:?}")),
    }
}

fn levels_of(pairs: Vec<(String, String)>) -> UrnResult<FactorLevels> {
    let mut levels = FactorLevels::new();
    for (factor, level) in pairs {
        if levels.insert(factor.clone(), level).is_some() {
            return Err(UrnError::validation(format!(
                "factor {factor:?} given more than once"
            )));
        }
    }
    Ok(levels)
}

fn open_input(path: &Path) -> UrnResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| UrnError::validation(format!("cannot read {}: {e}", path.display())))
}

fn to_json<T: serde::Serialize>(value: &T) -> UrnResult<Value> {
    serde_json::to_value(value).map_err(|e| UrnError::Storage(format!("encode output: {e}")))
}

fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Validation => 2,
        ErrorKind::Storage => 3,
        ErrorKind::Fatal => 1,
    }
}

fn error_body(err: &UrnError) -> Value {
    json!({"error": err.to_string(), "kind": err.kind().as_str()})
}

fn run(cmd: Command, coordinator: &Coordinator) -> UrnResult<Reply> {
    match cmd {
        Command::CreateStudy { config, name } => {
            let bytes = std::fs::read(&config).map_err(|e| {
                UrnError::validation(format!("cannot read {}: {e}", config.display()))
            })?;
            let mut study = StudyConfig::from_json_slice(&bytes)?;
            study.name = name;
            let created = coordinator.create(study)?;
            Ok(Reply::ok(to_json(&created)?))
        }
        Command::Randomize {
            study,
            id,
            user,
            factors,
        } => {
            let participant = NewParticipant::new(id, user, levels_of(factors)?);
            let row = coordinator.randomize(&study, participant)?;
            Ok(Reply::ok(to_json(&row)?))
        }
        Command::UploadParticipants { study, csv } => {
            let config = coordinator.config(&study)?;
            let participants = read_new_participants(&config, open_input(&csv)?)?;
            let outcome = coordinator.upload_new_participants(&study, participants)?;
            let assigned = to_json(&outcome.assigned)?;
            Ok(match outcome.failed {
                None => Reply::ok(json!({"assigned": assigned, "failed": null})),
                Some(failure) => Reply {
                    code: exit_code(failure.error.kind()),
                    body: Some(json!({
                        "assigned": assigned,
                        "failed": {
                            "index": failure.index,
                            "id": failure.id,
                            "error": failure.error.to_string(),
                            "kind": failure.error.kind().as_str(),
                        },
                    })),
                },
            })
        }
        Command::ImportHistory { study, csv } => {
            let config = coordinator.config(&study)?;
            let rows = read_history(&config, open_input(&csv)?)?;
            let summary = coordinator.import_history(&study, rows)?;
            Ok(Reply::ok(to_json(&summary)?))
        }
        Command::ExportHistory { study, out } => {
            let config = coordinator.config(&study)?;
            let rows = coordinator.export_history(&study)?;
            match out {
                Some(path) => {
                    let file = File::create(&path).map_err(|e| {
                        UrnError::Storage(format!("create {}: {e}", path.display()))
                    })?;
                    let written = write_history(&config, rows, BufWriter::new(file))?;
                    Ok(Reply::ok(json!({
                        "study": study,
                        "rows": written,
                        "out": path.display().to_string(),
                    })))
                }
                None => {
                    let stdout = std::io::stdout();
                    write_history(&config, rows, stdout.lock())?;
                    Ok(Reply {
                        body: None,
                        code: 0,
                    })
                }
            }
        }
        Command::GenerateDummies { study, count, seed } => {
            let rows = coordinator.generate_dummies(&study, count, seed)?;
            Ok(Reply::ok(to_json(&rows)?))
        }
        Command::Status { study } => Ok(Reply::ok(to_json(&coordinator.status(&study)?)?)),
        Command::Preview { study, factors } => {
            let table = coordinator.urn_table(&study, &levels_of(factors)?)?;
            Ok(Reply::ok(to_json(&table)?))
        }
        Command::Verify { study } => {
            let report = coordinator.verify_history(&study)?;
            Ok(Reply {
                code: if report.is_clean() { 0 } else { 1 },
                body: Some(to_json(&report)?),
            })
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let cfg = match CtlConfig::from_env() {
        Ok(cfg) => cfg.with_overrides(cli.data_dir, cli.log, cli.fsync),
        Err(err) => {
            println!("{}", error_body(&err));
            std::process::exit(exit_code(err.kind()));
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log))
        .with_writer(std::io::stderr)
        .init();

    let out = Coordinator::open_data_dir(&cfg.data_dir, cfg.fsync)
        .and_then(|coordinator| run(cli.cmd, &coordinator));
    match out {
        Ok(reply) => {
            if let Some(body) = reply.body {
                println!("{body}");
            }
            let _ = std::io::stdout().flush();
            std::process::exit(reply.code);
        }
        Err(err) => {
            tracing::debug!(
                target: "urnrand.ctl",
                event = "command_failed",
                error = %err,
                "command failed"
            );
            println!("{}", error_body(&err));
            std::process::exit(exit_code(err.kind()));
        }
    }
}
