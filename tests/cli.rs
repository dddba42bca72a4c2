// ABOUTME: Integration tests for the dockyard CLI commands.
// ABOUTME: Validates --help output, argument errors and the render command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn dockyard_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("dockyard"))
}

#[test]
fn help_shows_commands() {
    dockyard_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("render"));
}

#[test]
fn quiet_and_json_conflict() {
    dockyard_cmd()
        .args(["--quiet", "--json", "render", "app.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn missing_manifest_fails() {
    let temp_dir = tempfile::tempdir().unwrap();

    dockyard_cmd()
        .current_dir(temp_dir.path())
        .args(["render", "nope.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn render_writes_stack_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let stacks = temp_dir.path().join("stacks");
    fs::write(
        temp_dir.path().join("dockyard.yml"),
        format!("network: edge\nstack_dir: {}\n", stacks.display()),
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("docker-compose.yml"),
        "services:\n  web:\n    image: nginx:1.27\n    ports:\n      - \"8080:80\"\n",
    )
    .unwrap();
    fs::write(temp_dir.path().join("shop.yml"), "app:\n  name: Shop\n").unwrap();

    dockyard_cmd()
        .current_dir(temp_dir.path())
        .args(["render", "shop.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shop.stack.yml"));

    let rendered = fs::read_to_string(stacks.join("shop.stack.yml")).unwrap();
    assert!(rendered.contains("nginx:1.27"));
    assert!(rendered.contains("edge"));
}

#[test]
fn render_with_explicit_config() {
    let temp_dir = tempfile::tempdir().unwrap();
    let stacks = temp_dir.path().join("out");
    let config = temp_dir.path().join("custom.yml");
    fs::write(&config, format!("stack_dir: {}\n", stacks.display())).unwrap();
    fs::write(
        temp_dir.path().join("docker-compose.yml"),
        "services:\n  web:\n    image: nginx\n",
    )
    .unwrap();
    fs::write(temp_dir.path().join("shop.yml"), "app:\n  name: shop\n").unwrap();

    dockyard_cmd()
        .current_dir(temp_dir.path())
        .arg("--config")
        .arg(&config)
        .args(["render", "shop.yml"])
        .assert()
        .success();

    assert!(stacks.join("shop.stack.yml").exists());
}
