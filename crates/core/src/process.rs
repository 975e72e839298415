//! Child processes with captured output and a wall-clock limit.
//!
//! Generators, ffmpeg and ffprobe all go through [`run`]. A non-zero exit
//! is an ordinary [`Finished`] value; each caller decides what it means.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Characters of stderr kept for diagnostics.
pub const STDERR_EXCERPT_CHARS: usize = 500;

/// Per-stream capture cap (10 MiB); the rest is discarded.
const CAPTURE_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Inherited from the parent when `None`.
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl RunOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn in_dir(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Finished {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub elapsed: Duration,
}

impl Finished {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_excerpt(&self) -> String {
        excerpt(&self.stderr, STDERR_EXCERPT_CHARS)
    }
}

/// Trimmed `text`, cut to `max_chars` characters.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("killed after {}s without finishing", .after.as_secs())]
    Timeout { after: Duration },

    #[error("waiting for the process failed: {0}")]
    Wait(#[from] std::io::Error),
}

/// Spawn `cmd` with `options`, wait for it and collect both streams. The
/// child is killed if the timeout expires first.
pub async fn run(cmd: &mut Command, options: &RunOptions) -> Result<Finished, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .envs(options.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|source| ProcessError::Spawn { program, source })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let completion = async {
        let (out, err, status) = tokio::join!(capture(stdout), capture(stderr), child.wait());
        status.map(|status| (out, err, status))
    };

    match tokio::time::timeout(options.timeout, completion).await {
        Ok(Ok((out, err, status))) => Ok(Finished {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            elapsed: started.elapsed(),
        }),
        Ok(Err(e)) => Err(ProcessError::Wait(e)),
        Err(_) => Err(ProcessError::Timeout {
            after: options.timeout,
        }),
    }
}

async fn capture<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        // A read error keeps whatever arrived before it.
        let _ = stream.take(CAPTURE_LIMIT).read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn options() -> RunOptions {
        RunOptions::new(Duration::from_secs(5))
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let done = run(&mut sh("echo out; echo err 1>&2; exit 3"), &options())
            .await
            .unwrap();
        assert_eq!(done.exit_code, 3);
        assert!(!done.success());
        assert_eq!(done.stdout.trim(), "out");
        assert_eq!(done.stderr_excerpt(), "err");
    }

    #[tokio::test]
    async fn runs_in_the_requested_directory_with_extra_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options().in_dir(Some(dir.path().to_path_buf()));
        opts.envs.push(("STORYLOOM_TEST".into(), "42".into()));

        let done = run(&mut sh("echo $STORYLOOM_TEST; pwd"), &opts).await.unwrap();
        let lines: Vec<_> = done.stdout.lines().collect();
        assert_eq!(lines[0], "42");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn slow_process_is_killed() {
        let opts = RunOptions::new(Duration::from_millis(100));
        assert_matches!(
            run(&mut sh("sleep 5"), &opts).await,
            Err(ProcessError::Timeout { after }) if after == Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn missing_program_cannot_start() {
        let mut cmd = Command::new("/nonexistent/storyloom-tool");
        assert_matches!(
            run(&mut cmd, &options()).await,
            Err(ProcessError::Spawn { program, .. }) if program == "/nonexistent/storyloom-tool"
        );
    }

    #[test]
    fn excerpt_counts_characters() {
        let long = "é".repeat(600);
        assert_eq!(excerpt(&long, STDERR_EXCERPT_CHARS).chars().count(), 500);
        assert_eq!(excerpt("  boom \n", 500), "boom");
    }
}
