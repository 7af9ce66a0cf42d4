//! CLI integration tests for swarm
//!
//! Every test runs against its own config directory and without API keys,
//! so only the offline commands can succeed.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated in `dir` with every OpenRouter key removed
#[allow(deprecated)]
fn swarm_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("swarm").unwrap();
    cmd.current_dir(dir.path());
    cmd.env("SWARM_CONFIG_DIR", dir.path());
    for (key, _) in std::env::vars() {
        if key.starts_with("OPENROUTER_API_KEY") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_agents_lists_defaults() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("arcee"))
        .stdout(predicate::str::contains("no key"))
        .stdout(predicate::str::contains("default"));
}

#[test]
fn test_agents_json() {
    let dir = TempDir::new().unwrap();
    let output = swarm_cmd(&dir)
        .args(["agents", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 5);
    assert_eq!(rows[0]["available"], false);
}

#[test]
fn test_config_set_get_and_reset() {
    let dir = TempDir::new().unwrap();

    swarm_cmd(&dir)
        .args(["config", "set", "routing.ensemble_size", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set routing.ensemble_size = 4"));
    assert!(dir.path().join("config.toml").exists());

    swarm_cmd(&dir)
        .args(["config", "get", "routing.ensemble_size"])
        .assert()
        .success()
        .stdout("4\n");

    swarm_cmd(&dir).args(["config", "reset"]).assert().success();
    swarm_cmd(&dir)
        .args(["config", "get", "routing.ensemble_size"])
        .assert()
        .success()
        .stdout("3\n");
}

#[test]
fn test_config_rejects_api_keys_and_bad_values() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["config", "set", "llm.api_key", "sk-test"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("environment variable"));
    swarm_cmd(&dir)
        .args(["config", "set", "routing.ensemble_size", "1"])
        .assert()
        .failure();
    swarm_cmd(&dir)
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_config_path_uses_config_dir() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_bandit_show_and_set() {
    let dir = TempDir::new().unwrap();

    swarm_cmd(&dir)
        .args(["bandit", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("c = 1.4"))
        .stdout(predicate::str::contains("diversity_bonus = 0.2"));
    assert!(dir.path().join("bandit.toml").exists());

    swarm_cmd(&dir)
        .args(["bandit", "set", "--beta", "0.7"])
        .assert()
        .success();

    let output = swarm_cmd(&dir)
        .args(["bandit", "show", "--format", "json"])
        .output()
        .unwrap();
    let params: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(params["beta"], 0.7);
    assert_eq!(params["c"], 1.4);
}

#[test]
fn test_stats_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Interactions: 0"))
        .stdout(predicate::str::contains("Feedback: 0 up, 0 down"));
    assert!(dir.path().join("swarm.db").exists());
}

#[test]
fn test_feedback_updates_agent_stats() {
    let dir = TempDir::new().unwrap();

    swarm_cmd(&dir)
        .args(["feedback", "resp-1", "up", "--agents", "solar"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded up for resp-1"));

    let output = swarm_cmd(&dir)
        .args(["stats", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["agents"][0]["agent_id"], "solar");
    assert_eq!(stats["agents"][0]["pulls"], 1);
    assert_eq!(stats["feedback"]["total"]["up"], 1);
}

#[test]
fn test_feedback_rejects_unknown_verdict() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["feedback", "resp-1", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown verdict"));
}

#[test]
fn test_route_without_keys_fails() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["route", "hello", "there"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No agent available"));
}

#[test]
fn test_ask_without_keys_fails() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["ask", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E003"));
}

#[test]
fn test_runs_reflect_and_prune_on_empty_history() {
    let dir = TempDir::new().unwrap();
    swarm_cmd(&dir)
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No collaboration runs recorded."));
    swarm_cmd(&dir)
        .args(["runs", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No collaboration run 'missing'"));
    swarm_cmd(&dir)
        .arg("reflect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Not enough judged interactions yet."));
    swarm_cmd(&dir)
        .arg("prune")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned 0 interactions"));
}
