//! CLI 退出码与输出冒烟测试（无硬件环境下可跑）

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn config_show_prints_effective_configuration() {
    Command::cargo_bin("magpie-cli")
        .unwrap()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("enable_cameras")
                .and(predicate::str::contains("default_freq")),
        );
}

#[test]
fn calibrate_on_empty_slot_exits_with_device_not_found() {
    Command::cargo_bin("magpie-cli")
        .unwrap()
        .args(["robot", "calibrate", "99"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("No device found"));
}

/// 配置文件损坏时的告警必须在默认日志级别下可见（不依赖 RUST_LOG）
#[test]
fn malformed_config_warns_on_stderr_by_default() {
    let home = tempfile::tempdir().unwrap();
    let magpie_dir = home.path().join(".magpie");
    std::fs::create_dir_all(&magpie_dir).unwrap();
    std::fs::write(magpie_dir.join("config.yaml"), ": not [ valid yaml {{{").unwrap();

    Command::cargo_bin("magpie-cli")
        .unwrap()
        .env("HOME", home.path())
        .env_remove("RUST_LOG")
        .args(["config", "show"])
        .assert()
        .success()
        .stderr(predicate::str::contains("malformed config file"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    Command::cargo_bin("magpie-cli")
        .unwrap()
        .arg("teleport")
        .assert()
        .failure();
}
