use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::Path;
use std::process::Command;

fn write_random(path: &Path, bytes: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    std::fs::write(path, data).unwrap();
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn gitbin(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("gitbin").unwrap();
    cmd.current_dir(dir);
    for key in [
        "GITBIN_BACKUP_LOCATION",
        "GITBIN_SOURCE_LOCATION",
        "GITBIN_RESTORE_LOCATION",
        "GITBIN_RESTORE_TARGET",
        "GITBIN_REMOTE_LOCATION",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(td: &assert_fs::TempDir) {
    let cfg = serde_json::json!({
        "backupLocation": td.path().join("backup"),
        "sourceLocation": td.path().join("data"),
        "restoreLocation": td.path().join("restore"),
        "restoreTarget": td.path().join("out"),
        "remoteLocation": td.path().join("remotes"),
        "segmentSizeKb": 64,
        "binSizeKb": 256,
    });
    td.child("gitbin.json").write_str(&cfg.to_string()).unwrap();
}

#[test]
fn no_action_is_not_an_error() {
    let td = assert_fs::TempDir::new().unwrap();
    gitbin(td.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("no action"));
    td.child("backup").assert(predicate::path::missing());
}

#[test]
fn backup_and_restore_are_mutually_exclusive() {
    let td = assert_fs::TempDir::new().unwrap();
    gitbin(td.path())
        .args(["-b", "-r"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn missing_remote_location_is_rejected() {
    let td = assert_fs::TempDir::new().unwrap();
    td.child("gitbin.json").write_str(r#"{ "binSizeKb": 1024 }"#).unwrap();
    gitbin(td.path())
        .arg("--backup")
        .assert()
        .failure()
        .stderr(predicate::str::contains("remoteLocation"));
}

#[test]
fn malformed_config_is_rejected() {
    let td = assert_fs::TempDir::new().unwrap();
    td.child("custom.json").write_str("{ not json").unwrap();
    gitbin(td.path())
        .args(["--config", "custom.json", "-r"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("custom.json"));
}

#[test]
fn restore_without_remotes_fails() {
    let td = assert_fs::TempDir::new().unwrap();
    write_config(&td);
    gitbin(td.path()).arg("-r").assert().failure();
}

#[test]
fn backup_then_restore_roundtrip() {
    if !git_available() {
        eprintln!("git not found; skipping");
        return;
    }
    let td = assert_fs::TempDir::new().unwrap();
    write_config(&td);
    let data = td.child("data");
    data.create_dir_all().unwrap();
    write_random(data.child("a.bin").path(), 300 * 1024, 1);
    write_random(data.child("b.bin").path(), 16 * 1024, 2);
    data.child("readme.txt").write_str("hello backup\n").unwrap();

    gitbin(td.path())
        .args(["-b", "--log-format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backup: 3 new, 0 updated, 0 unchanged"))
        .stderr(predicate::str::contains("\"level\":\"INFO\""));

    td.child("backup/gitBackup-0/manifest.json").assert(predicate::path::exists());
    td.child("backup/gitBackup-1").assert(predicate::path::is_dir());

    gitbin(td.path())
        .arg("-b")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 new, 0 updated, 3 unchanged"));

    gitbin(td.path())
        .arg("--restore")
        .assert()
        .success()
        .stdout(predicate::str::contains("restore: 3 file(s)"));

    for name in ["a.bin", "b.bin", "readme.txt"] {
        let want = std::fs::read(data.child(name).path()).unwrap();
        let got = std::fs::read(td.child("out").child(name).path()).unwrap();
        assert_eq!(got, want, "{name}");
    }
    td.child("restore/temp").assert(predicate::path::missing());
}
