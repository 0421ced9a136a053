//! Smoke tests -- verify the binary runs and the main subcommands work end to end.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::str::contains;

fn bin() -> Command {
    let mut cmd = Command::cargo_bin("beiwe-pipeline").unwrap();
    cmd.env_remove("BEIWE_PIPELINE_CONFIG").env("RUST_LOG", "warn");
    cmd
}

/// Settings for the in-memory backend plus a complete object names file.
fn write_settings(dir: &Path) -> PathBuf {
    let names = dir.join("aws-object-names.json");
    std::fs::write(
        &names,
        r#"{
            "job_name": "beiwe-{freq}",
            "job_defn_name": "defn",
            "queue_name": "queue",
            "access_key_ssm_name": "access",
            "secret_key_ssm_name": "secret",
            "ami_name": "ami",
            "ecr_repo_name": "repo",
            "instance_profile": "profile",
            "comp_env_name": "env",
            "comp_env_role": "role",
            "security_group": "sg"
        }"#,
    )
    .unwrap();

    let settings = dir.join("pipeline.toml");
    std::fs::write(
        &settings,
        format!(
            "[storage]\ndb_path = {:?}\n\n[pipeline]\nobject_names_path = {:?}\n\n[backend]\nmode = \"local\"\n\n[schedule]\nfrequencies = [\"daily\"]\n",
            dir.join("pipeline.db"),
            names
        ),
    )
    .unwrap();
    settings
}

#[test]
fn test_cli_help() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Data pipeline job submission"));
}

#[test]
fn test_cli_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("beiwe-pipeline"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["rotate", "--help"],
        vec!["submit", "--help"],
        vec!["trigger", "--help"],
        vec!["terminate", "--help"],
        vec!["study", "add", "--help"],
        vec!["schedule", "dry-run", "--help"],
        vec!["setup", "--help"],
    ] {
        bin().args(&args).assert().success();
    }
}

#[test]
fn test_unknown_frequency_is_rejected() {
    bin()
        .args(["rotate", "--freq", "yearly"])
        .assert()
        .failure()
        .stderr(contains("unknown frequency"));
}

#[test]
fn test_study_add_then_list() {
    let dir = tempfile::TempDir::new().unwrap();
    let settings = write_settings(dir.path());

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["study", "add", "--object-id", "abc123", "--name", "Sleep Study"])
        .assert()
        .success()
        .stdout(contains("added with id 1"));

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["study", "list"])
        .assert()
        .success()
        .stdout(contains("Sleep Study"));
}

#[test]
fn test_submit_then_list_and_status() {
    let dir = tempfile::TempDir::new().unwrap();
    let settings = write_settings(dir.path());

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["study", "add", "--object-id", "abc123", "--name", "Sleep Study"])
        .assert()
        .success();

    bin()
        .arg("--config")
        .arg(&settings)
        .args([
            "submit",
            "--study",
            "1",
            "--owner",
            "alice",
            "--participants",
            "p1,p2",
            "--start",
            "2024-01-01T00:00:00",
        ])
        .assert()
        .success()
        .stdout(contains("Submitted pipeline 1"));

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["list", "--study", "1"])
        .assert()
        .success()
        .stdout(contains("SUBMITTED"))
        .stdout(contains("run_pipeline"));

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["status", "--id", "1"])
        .assert()
        .success()
        .stdout(contains("\"owner\": \"alice\""));
}

#[test]
fn test_status_of_missing_execution_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let settings = write_settings(dir.path());

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["status", "--id", "42"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn test_schedule_dry_run_lists_daily_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    let settings = write_settings(dir.path());

    bin()
        .arg("--config")
        .arg(&settings)
        .args(["schedule", "dry-run", "--hours", "48"])
        .assert()
        .success()
        .stdout(contains(": daily"));
}
