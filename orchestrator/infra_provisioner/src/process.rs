//! External tool invocation.
//!
//! Every child is spawned with `kill_on_drop`, so when a workflow future is
//! cancelled (soft time limit) the tool it was waiting on dies with it.
//! Long-running tools are streamed line by line into the cluster's log file
//! while the caller inspects each line; short helpers are captured whole
//! under a timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder for one external command.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bound for `output()`; streamed runs are bounded by the task time limit instead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments as one line, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    fn spawn(&self) -> Result<Child, ToolError> {
        self.command().spawn().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })
    }

    /// Run to completion and capture both streams.
    pub async fn output(&self) -> Result<ToolOutput, ToolError> {
        let shown = self.display();
        debug!(command = %shown, "Executing");
        let child = self.spawn()?;
        let wait = child.wait_with_output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ToolError::Timeout {
                    command: shown.clone(),
                    timeout: limit,
                })??,
            None => wait.await?,
        };

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Start the command, appending its output to `log_path` as it arrives.
    pub async fn stream_to(&self, log_path: &Path) -> Result<StreamingTool, ToolError> {
        let shown = self.display();
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        log.write_all(format!("==> {} {}\n", Utc::now().to_rfc3339(), shown).as_bytes())
            .await?;

        debug!(command = %shown, log = %log_path.display(), "Streaming");
        let mut child = self.spawn()?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, tx));
        }

        Ok(StreamingTool {
            child,
            rx,
            log,
            stdout: String::new(),
            stderr: String::new(),
            display: shown,
        })
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    // Tools print localized or binary fragments now and then; decode lossily
    // so one bad byte does not end the stream.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read tool output");
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Result of a finished tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr if the tool wrote any, stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// A running tool whose output is being mirrored into a log file.
pub struct StreamingTool {
    child: Child,
    rx: mpsc::Receiver<OutputLine>,
    log: File,
    stdout: String,
    stderr: String,
    display: String,
}

impl StreamingTool {
    /// Next output line from either stream, `None` once both are closed.
    pub async fn next_line(&mut self) -> Result<Option<OutputLine>, ToolError> {
        let Some(line) = self.rx.recv().await else {
            return Ok(None);
        };
        self.log.write_all(line.text.as_bytes()).await?;
        self.log.write_all(b"\n").await?;
        let buf = match line.stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        buf.push_str(&line.text);
        buf.push('\n');
        Ok(Some(line))
    }

    /// Drain remaining output and wait for the exit status.
    pub async fn finish(mut self) -> Result<ToolOutput, ToolError> {
        while self.next_line().await?.is_some() {}
        let status = self.child.wait().await?;
        self.log
            .write_all(format!("<== exit {:?}: {}\n", status.code(), self.display).as_bytes())
            .await?;
        self.log.flush().await?;
        Ok(ToolOutput {
            code: status.code(),
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}
