use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn homewatch() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("homewatch"))
}

#[test]
fn help_lists_overrides() {
    homewatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--storage"))
        .stdout(predicate::str::contains("--simulate-sensor"));
}

#[test]
fn missing_config_file_is_fatal() {
    homewatch()
        .arg("--config")
        .arg("/definitely/not/homewatch.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unable to load configuration"));
}

#[test]
fn invalid_config_is_fatal() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("homewatch.toml");
    fs::write(&path, "camera_width = 0\n").expect("write config");
    homewatch()
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("camera resolution 0x480 is invalid"));
}

#[test]
fn unknown_codec_is_rejected_before_startup() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("homewatch.toml");
    fs::write(&path, "video_codec = \"DIVX\"\n").expect("write config");
    homewatch()
        .env("HOMEWATCH_CONFIG", &path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse configuration"));
}
