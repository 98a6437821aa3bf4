//! Exercises the `beholdfs` binary's argument/option parsing and exit
//! code contract (spec §6) without actually mounting FUSE.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn rejects_unrecognized_mount_option() {
    let fsroot = tempdir().unwrap();
    let mountpoint = tempdir().unwrap();

    Command::cargo_bin("beholdfs")
        .unwrap()
        .args(["-o", "bogus"])
        .arg(fsroot.path())
        .arg(mountpoint.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("bogus"));
}

#[test]
fn rejects_missing_fsroot() {
    let mountpoint = tempdir().unwrap();

    Command::cargo_bin("beholdfs")
        .unwrap()
        .arg("/nonexistent/path/that/should/not/exist")
        .arg(mountpoint.path())
        .assert()
        .failure()
        .code(2);
}

#[test]
fn prints_usage_on_missing_arguments() {
    Command::cargo_bin("beholdfs")
        .unwrap()
        .assert()
        .failure()
        .code(1);
}
