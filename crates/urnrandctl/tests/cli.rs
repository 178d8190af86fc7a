// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

const REFERENCE_STUDY: &str = r#"{
    "w": 1,
    "alpha": 2,
    "beta": 1,
    "starting_seed": 42,
    "imbalance_rule": "range",
    "urn_selection_policy": "biased-toward-max",
    "treatments": ["A", "B"],
    "factors": {"site": ["north", "south"]}
}"#;

const AFTER_P1: &str =
    "55524e524e4701014d41f891641d4be558290df62995ad732d7f954c2df451584f8167f77e7b0514";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("study.json"), REFERENCE_STUDY).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn ctl(&self) -> Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("urnrandctl");
        cmd.env_remove("URNRAND_LOG")
            .env_remove("URNRAND_FSYNC")
            .env("URNRAND_DATA_DIR", self.path("data"));
        cmd
    }

    fn create(&self, name: &str) {
        self.ctl()
            .args(["create-study", "--name", name, "--config"])
            .arg(self.path("study.json"))
            .assert()
            .success();
    }

    fn randomize(&self, study: &str, id: &str, site: &str) -> Command {
        let mut cmd = self.ctl();
        cmd.args(["randomize", "--study", study, "--id", id, "--user", "nurse"])
            .arg("--factor")
            .arg(format!("site={site}"));
        cmd
    }
}

fn json_of(output: &[u8]) -> Value {
    serde_json::from_slice(output).unwrap()
}

fn run_json(cmd: &mut Command, code: i32) -> Value {
    let out = cmd.assert().code(code).get_output().stdout.clone();
    json_of(&out)
}

#[test]
fn first_participant_matches_reference_assignment() {
    let ws = Workspace::new();
    ws.create("trial");
    let row = run_json(&mut ws.randomize("trial", "p1", "north"), 0);
    assert_eq!(row["trt"], "A");
    assert_eq!(row["bg_state"], AFTER_P1);
    assert_eq!(row["levels"]["site"], "north");

    let status = run_json(ws.ctl().args(["status", "--study", "trial"]), 0);
    assert_eq!(status["rows"], 1);
    assert_eq!(status["treatment_totals"]["A"], 1);
}

#[test]
fn validation_errors_exit_two_and_write_nothing() {
    let ws = Workspace::new();
    ws.create("trial");

    let err = run_json(&mut ws.randomize("trial", "p1", "east"), 2);
    assert_eq!(err["kind"], "VALIDATION");

    let err = run_json(&mut ws.randomize("nope", "p1", "north"), 2);
    assert_eq!(err["kind"], "VALIDATION");

    ws.randomize("trial", "p1", "north").assert().success();
    let err = run_json(&mut ws.randomize("trial", "p1", "south"), 2);
    assert!(err["error"].as_str().unwrap().contains("duplicate participant id"));

    let status = run_json(ws.ctl().args(["status", "--study", "trial"]), 0);
    assert_eq!(status["rows"], 1);
}

#[test]
fn creating_a_study_twice_is_rejected() {
    let ws = Workspace::new();
    ws.create("trial");
    let err = run_json(
        ws.ctl()
            .args(["create-study", "--name", "trial", "--config"])
            .arg(ws.path("study.json")),
        2,
    );
    assert_eq!(err["kind"], "VALIDATION");
}

#[test]
fn unusable_data_dir_is_a_storage_failure() {
    let ws = Workspace::new();
    let blocker = ws.path("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let err = run_json(
        ws.ctl()
            .arg("--data-dir")
            .arg(blocker.join("data"))
            .args(["status", "--study", "trial"]),
        3,
    );
    assert_eq!(err["kind"], "STORAGE");
}

#[test]
fn malformed_fsync_setting_is_rejected() {
    let ws = Workspace::new();
    let err = run_json(
        ws.ctl()
            .env("URNRAND_FSYNC", "sometimes")
            .args(["status", "--study", "trial"]),
        2,
    );
    assert_eq!(err["kind"], "VALIDATION");
}

fn write_file(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
}

#[test]
fn upload_stops_at_first_bad_row_and_keeps_earlier_ones() {
    let ws = Workspace::new();
    ws.create("trial");
    let csv = ws.path("upload.csv");
    write_file(&csv, "id,user,f_site\nu1,desk,north\nu2,desk,east\nu3,desk,south\n");

    let out = run_json(
        ws.ctl()
            .args(["upload-participants", "--study", "trial", "--csv"])
            .arg(&csv),
        2,
    );
    assert_eq!(out["assigned"].as_array().unwrap().len(), 1);
    assert_eq!(out["assigned"][0]["id"], "u1");
    assert_eq!(out["failed"]["index"], 1);
    assert_eq!(out["failed"]["id"], "u2");

    let status = run_json(ws.ctl().args(["status", "--study", "trial"]), 0);
    assert_eq!(status["rows"], 1);
}

#[test]
fn exported_history_imports_and_verifies_elsewhere() {
    let ws = Workspace::new();
    ws.create("trial");
    for (id, site) in [("p1", "north"), ("p2", "north"), ("p3", "south")] {
        ws.randomize("trial", id, site).assert().success();
    }
    run_json(
        ws.ctl().args([
            "generate-dummies",
            "--study",
            "trial",
            "--count",
            "3",
            "--seed",
            "9",
        ]),
        0,
    );

    let stdout = ws
        .ctl()
        .args(["export-history", "--study", "trial"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(stdout).unwrap();
    assert!(text.starts_with("id,user,f_site,trt,datetime,bg_state\n"));
    assert_eq!(text.lines().count(), 7);

    let csv = ws.path("history.csv");
    let written = run_json(
        ws.ctl()
            .args(["export-history", "--study", "trial", "--out"])
            .arg(&csv),
        0,
    );
    assert_eq!(written["rows"], 6);
    assert_eq!(std::fs::read_to_string(&csv).unwrap(), text);

    ws.create("copy");
    let summary = run_json(
        ws.ctl()
            .args(["import-history", "--study", "copy", "--csv"])
            .arg(&csv),
        0,
    );
    assert_eq!(summary["imported"], 6);
    assert_eq!(summary["without_snapshot"], 0);

    let original = run_json(ws.ctl().args(["status", "--study", "trial"]), 0);
    let copy = run_json(ws.ctl().args(["status", "--study", "copy"]), 0);
    assert_eq!(original["history_root_hex"], copy["history_root_hex"]);

    let report = run_json(ws.ctl().args(["verify", "--study", "copy"]), 0);
    assert_eq!(report["verified"], 6);
    assert!(report["divergence"].is_null());

    let next_trial = run_json(&mut ws.randomize("trial", "p7", "south"), 0);
    let next_copy = run_json(&mut ws.randomize("copy", "p7", "south"), 0);
    assert_eq!(next_trial["trt"], next_copy["trt"]);
    assert_eq!(next_trial["bg_state"], next_copy["bg_state"]);
}

#[test]
fn preview_shows_the_fresh_urn() {
    let ws = Workspace::new();
    ws.create("trial");
    let table = run_json(
        ws.ctl()
            .args(["preview", "--study", "trial", "--factor", "site=south"]),
        0,
    );
    let urn = &table["urns"][0];
    assert_eq!(urn["factor"], "site");
    assert_eq!(urn["level"], "south");
    assert_eq!(urn["total_balls"], 2);
}

#[test]
fn oversized_dummy_count_is_a_validation_error() {
    let ws = Workspace::new();
    ws.create("trial");
    let err = run_json(
        ws.ctl().args([
            "generate-dummies",
            "--study",
            "trial",
            "--count",
            "9223372036854775807",
        ]),
        2,
    );
    assert_eq!(err["kind"], "VALIDATION");
    let status = run_json(ws.ctl().args(["status", "--study", "trial"]), 0);
    assert_eq!(status["rows"], 0);
}
