use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

const REPLAY: &str = r#"{
  "game": "cs2",
  "subject": "hero",
  "players": [{"name": "hero", "starting_side": "T"}],
  "rounds": [
    {"number": 1, "start_tick": 1000, "end_tick": 4840, "winner": "T"},
    {"number": 2, "start_tick": 4840, "end_tick": 8680, "winner": "CT"},
    {"number": 3, "start_tick": 8680, "end_tick": 12520, "winner": "T"}
  ],
  "events": [
    {"kind": "kill", "round": 2, "tick": 7720, "actor": "villain", "target": "hero", "detail": "deagle"}
  ],
  "clock": {"mode": "ticks", "tick_rate": 64}
}"#;

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn coach() -> Command {
    Command::new(env!("CARGO_BIN_EXE_coach"))
}

#[test]
fn timeline_subcommand_writes_windows() {
    let dir = tempdir().unwrap();
    let replay = write(dir.path(), "replay.json", REPLAY);
    let out = dir.path().join("timeline.json");

    let status = coach()
        .args(["timeline", "--replay"])
        .arg(&replay)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let timeline: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let windows = timeline["windows"].as_array().unwrap();
    assert_eq!(windows.len(), 3);
    assert_eq!(windows[0]["start_seconds"], 0.0);
    assert_eq!(windows[1]["label"], "Round 2");
    assert_eq!(windows[1]["subject_exit_seconds"], 105.0);
    assert_eq!(windows[1]["outcome"], "loss");
}

#[test]
fn timeline_subcommand_honors_round_range() {
    let dir = tempdir().unwrap();
    let replay = write(dir.path(), "replay.json", REPLAY);

    let output = coach()
        .args(["timeline", "--first-round", "2", "--last-round", "3", "--replay"])
        .arg(&replay)
        .output()
        .unwrap();
    assert!(output.status.success());

    let timeline: Value = serde_json::from_slice(&output.stdout).unwrap();
    let windows = timeline["windows"].as_array().unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0]["round"], 2);
    assert_eq!(windows[0]["start_seconds"], 0.0);
    assert_eq!(windows[0]["subject_exit_seconds"], 45.0);
}

#[test]
fn prefilter_subcommand_rejects_tips_after_death() {
    let dir = tempdir().unwrap();
    let replay = write(dir.path(), "replay.json", REPLAY);
    let candidates = write(
        dir.path(),
        "tips.json",
        r#"{"tips": [
            {"id": "early", "timestamp": "0:40", "category": "aim", "observation": "Wide swing."},
            {"id": "dead", "timestamp": "1:50", "category": "aim", "observation": "Spectating."},
            {"id": "general", "category": "economy", "observation": "Forced too often."}
        ]}"#,
    );
    let out = dir.path().join("result.json");

    let status = coach()
        .args(["prefilter", "--replay"])
        .arg(&replay)
        .arg("--candidates")
        .arg(&candidates)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let outcome: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let accepted: Vec<&str> = outcome["accepted"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(accepted, vec!["general", "early"]);
    let rejected = &outcome["rejected"][0];
    assert_eq!(rejected["id"], "dead");
    assert_eq!(rejected["stage"], "prefilter");
    assert!(rejected["reason"].as_str().unwrap().contains("1:45"));
}

#[test]
fn analyze_without_credentials_fails_cleanly() {
    let dir = tempdir().unwrap();
    let replay = write(dir.path(), "replay.json", REPLAY);
    let out = dir.path().join("result.json");

    let output = coach()
        .env_remove("GEMINI_API_KEYS")
        .env_remove("GEMINI_API_KEY")
        .args(["analyze", "--video-uri", "files/x", "--video-id", "x", "--replay"])
        .arg(&replay)
        .arg("--out")
        .arg(&out)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!out.exists());
}

#[test]
fn inverted_round_range_is_rejected() {
    let dir = tempdir().unwrap();
    let replay = write(dir.path(), "replay.json", REPLAY);

    let status = coach()
        .args(["timeline", "--first-round", "3", "--last-round", "1", "--replay"])
        .arg(&replay)
        .status()
        .unwrap();
    assert!(!status.success());
}
