//! Artifact store inside a container, driven through `docker exec`.
//!
//! Every operation is one short `sh -c` script with a bounded timeout. The
//! child is killed when the timeout fires.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use ralph_core::ArtifactLayout;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{temp_path, ArtifactEntry, ArtifactStore, Result, StoreError};

/// Exit code our scripts use for "no such artifact".
const MISSING_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone)]
pub struct RemoteStore {
    layout: ArtifactLayout,
    docker_bin: String,
    container: String,
    timeout: Duration,
}

impl RemoteStore {
    pub fn new(
        docker_bin: impl Into<String>,
        container: impl Into<String>,
        root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            layout: ArtifactLayout::new(root),
            docker_bin: docker_bin.into(),
            container: container.into(),
            timeout,
        }
    }

    /// Run `script` in the container, optionally feeding `input` on stdin.
    async fn exec(&self, script: &str, input: Option<&[u8]>) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("exec")
            .arg("-i")
            .arg(&self.container)
            .arg("sh")
            .arg("-c")
            .arg(script)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(container = %self.container, script, "remote exec");

        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!(
                    container = %self.container,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "remote command timed out; killed"
                );
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    fn check(output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            Ok(())
        } else {
            Err(StoreError::Remote {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Quote a string for `sh`, using the `'\''` idiom for embedded quotes.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quote a glob pattern, leaving `*` wildcards live.
pub fn shell_glob(pattern: &str) -> String {
    pattern
        .split('*')
        .map(|part| {
            if part.is_empty() {
                String::new()
            } else {
                shell_quote(part)
            }
        })
        .collect::<Vec<_>>()
        .join("*")
}

fn path_arg(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Parse `stat -c '%Y %n'` output lines.
fn parse_stat_lines(stdout: &str) -> Result<Vec<ArtifactEntry>> {
    let mut entries = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let (secs, path) = line
            .split_once(' ')
            .ok_or_else(|| StoreError::Malformed(line.to_string()))?;
        let secs: i64 = secs
            .trim()
            .parse()
            .map_err(|_| StoreError::Malformed(line.to_string()))?;
        let modified = DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| StoreError::Malformed(line.to_string()))?;
        entries.push(ArtifactEntry {
            path: PathBuf::from(path),
            modified,
        });
    }
    Ok(entries)
}

#[async_trait]
impl ArtifactStore for RemoteStore {
    fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    async fn list(&self, pattern: &str) -> Result<Vec<ArtifactEntry>> {
        let script = format!(
            "for f in {}; do [ -f \"$f\" ] && stat -c '%Y %n' -- \"$f\"; done; true",
            shell_glob(pattern)
        );
        let output = self.exec(&script, None).await?;
        Self::check(&output)?;
        parse_stat_lines(&String::from_utf8_lossy(&output.stdout))
    }

    async fn stat(&self, path: &Path) -> Result<Option<ArtifactEntry>> {
        let p = path_arg(path);
        let script = format!("[ -e {p} ] || exit {MISSING_EXIT_CODE}; stat -c '%Y %n' -- {p}");
        let output = self.exec(&script, None).await?;
        if output.status.code() == Some(MISSING_EXIT_CODE) {
            return Ok(None);
        }
        Self::check(&output)?;
        Ok(parse_stat_lines(&String::from_utf8_lossy(&output.stdout))?
            .into_iter()
            .next())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        let p = path_arg(path);
        let script = format!("[ -f {p} ] || exit {MISSING_EXIT_CODE}; cat -- {p}");
        let output = self.exec(&script, None).await?;
        if output.status.code() == Some(MISSING_EXIT_CODE) {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Self::check(&output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write(&self, path: &Path, content: &str) -> Result<()> {
        let p = path_arg(path);
        let tmp = path_arg(&temp_path(path));
        let dir = path
            .parent()
            .map_or_else(|| ".".to_string(), path_arg);
        let script = format!("mkdir -p {dir} && cat > {tmp} && mv -f {tmp} {p}");
        let output = self.exec(&script, Some(content.as_bytes())).await?;
        Self::check(&output)
    }
}
