use similar::TextDiff;
use tokio::process::Command;
use tracing::debug;

use crate::errors::PipedError;

pub const DIFF_COMMAND: &str = "diff";

/// Run `diff -u -N old new` and return its output without the two header lines.
///
/// `diff` exits with 1 when the inputs differ, which is not an error.
pub async fn diff_by_command(command: &str, old: &str, new: &str) -> Result<String, PipedError> {
    let dir = tempfile::Builder::new().prefix("diff-").tempdir()?;
    let old_path = dir.path().join("old");
    let new_path = dir.path().join("new");
    tokio::fs::write(&old_path, old).await?;
    tokio::fs::write(&new_path, new).await?;

    let output = Command::new(command)
        .arg("-u")
        .arg("-N")
        .arg(&old_path)
        .arg(&new_path)
        .output()
        .await?;

    match output.status.code() {
        Some(0) => Ok(String::new()),
        Some(1) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(trim_header(&stdout, 2))
        }
        _ => Err(PipedError::Internal(format!(
            "failed to run {}: {}",
            command,
            String::from_utf8_lossy(&output.stderr)
        ))),
    }
}

/// Unified diff of two texts. Uses the `diff` binary when installed,
/// otherwise computes it in-process.
pub async fn render_unified(old: &str, new: &str) -> Result<String, PipedError> {
    if which::which(DIFF_COMMAND).is_ok() {
        return diff_by_command(DIFF_COMMAND, old, new).await;
    }
    debug!("{} command was not found, rendering the diff in-process", DIFF_COMMAND);
    Ok(TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .to_string())
}

fn trim_header(output: &str, lines: usize) -> String {
    output
        .splitn(lines + 1, '\n')
        .nth(lines)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_header() {
        let out = "--- /tmp/old\t2024\n+++ /tmp/new\t2024\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(trim_header(out, 2), "@@ -1 +1 @@\n-a\n+b\n");
        assert_eq!(trim_header("only one line", 2), "");
    }

    #[tokio::test]
    async fn test_render_unified() {
        let out = render_unified("a\nb\nc\n", "a\nx\nc\n").await.unwrap();
        assert!(out.contains("-b"));
        assert!(out.contains("+x"));
        assert!(!out.starts_with("---"));

        let same = render_unified("a\n", "a\n").await.unwrap();
        assert!(same.is_empty());
    }
}
