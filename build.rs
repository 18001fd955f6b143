//! Build script for peerlink
//!
//! Embeds the git revision, build timestamp, target and compiler
//! version so `peerlink version` can report exactly what is running.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(output) if output.status.success() => (!output.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let rustc_version = run("rustc", &["--version"]);

    emit("PEERLINK_GIT_HASH", &git_hash);
    emit("PEERLINK_GIT_DIRTY", &git_dirty);
    emit("PEERLINK_BUILD_TIMESTAMP", &build_timestamp);
    emit("PEERLINK_TARGET", &env_or_unknown("TARGET"));
    emit("PEERLINK_PROFILE", &env_or_unknown("PROFILE"));
    emit("PEERLINK_RUSTC_VERSION", &rustc_version);
}

/// Export a value to the crate being compiled
fn emit(key: &str, value: &str) {
    println!("cargo:rustc-env={}={}", key, value);
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

/// Run a command and return its trimmed stdout, or "unknown"
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
