//! Build script for piped
//! Stamps the release tag, commit and build time into the binary

use std::process::Command;

use chrono::Utc;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let out = String::from_utf8(output.stdout).ok()?;
    let out = out.trim();
    (!out.is_empty()).then(|| out.to_string())
}

fn main() {
    // Release tags look like v0.48.0, untagged builds fall back to the package version
    if let Some(version) = git(&["describe", "--tags", "--always", "--dirty", "--abbrev=7"]) {
        println!("cargo:rustc-env=GIT_VERSION={}", version);
    }
    let git_hash = git(&["rev-parse", "--short=7", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!(
        "cargo:rustc-env=BUILD_TIME={}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");
}
