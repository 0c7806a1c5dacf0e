//! Black-box CLI tests driven through the compiled binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn no_subcommand_prints_usage_and_exits_nonzero() {
    Command::cargo_bin("citrine")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn recipes_lists_every_known_recipe_name() {
    Command::cargo_bin("citrine")
        .unwrap()
        .arg("recipes")
        .assert()
        .success()
        .stdout(predicate::str::contains("llamacpp"))
        .stdout(predicate::str::contains("sd-cpp"));
}

#[test]
fn list_prints_the_shipped_catalogue() {
    Command::cargo_bin("citrine")
        .unwrap()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Llama-3.1-8B-Instruct-GGUF"));
}

#[test]
fn status_reports_no_gateway_when_none_is_running() {
    Command::cargo_bin("citrine")
        .unwrap()
        .env("LEMONADE_PORT", "18423")
        .arg("status")
        .assert()
        .failure();
}

#[test]
fn pull_rejects_local_checkpoint_without_recipe() {
    Command::cargo_bin("citrine")
        .unwrap()
        .args(["pull", "my-model", "--checkpoint", "/abs/path/model.gguf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--recipe"));
}
