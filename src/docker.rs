//! Thin seam over the `docker` CLI.
//!
//! Short-lived commands are captured whole; build and push output is
//! consumed as a lazy, finite, non-restartable line stream. Stdout and
//! stderr are interleaved in arrival order through a channel so callers can
//! bound how long they wait for the next line.

use std::{
    io::{self, BufRead, BufReader, Read},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::JoinHandle,
    time::Duration,
};

use log::debug;

/// Transport-level failures talking to the container engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not run `docker`; is it installed and on $PATH?")]
    Spawn(#[source] io::Error),

    #[error("`{command}` exited unsuccessfully{}", render_failure(.code, .stderr))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("error reading `docker` output")]
    Stream(#[source] io::Error),
}

fn render_failure(code: &Option<i32>, stderr: &str) -> String {
    let status = code.map_or_else(
        || " (terminated by a signal)".to_owned(),
        |code| format!(" with status code {code}"),
    );
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

/// Render a docker invocation for logs and error messages.
#[must_use]
pub fn command_line<I>(args: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let args: Vec<String> = args
        .into_iter()
        .map(|arg| arg.as_ref().to_owned())
        .collect();
    let rendered = shlex::try_join(args.iter().map(String::as_str)).unwrap_or_default();
    format!("docker {rendered}")
}

/// Run a docker command to completion and capture stdout.
///
/// # Errors
///
/// Returns [`EngineError::Spawn`] when docker cannot be executed and
/// [`EngineError::Failed`] (carrying stderr) on a nonzero exit.
pub fn capture<I>(args: I) -> Result<String, EngineError>
where
    I: IntoIterator + Clone,
    I::Item: AsRef<str>,
{
    let command = command_line(args.clone());
    debug!("running {command}");

    let output = Command::new("docker")
        .args(args.into_iter().map(|arg| arg.as_ref().to_owned()))
        .output()
        .map_err(EngineError::Spawn)?;

    if !output.status.success() {
        return Err(EngineError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Feed stdin to a docker command (used for `docker login --password-stdin`).
///
/// # Errors
///
/// Same failure modes as [`capture`].
pub fn capture_with_stdin<I>(args: I, stdin: &str) -> Result<String, EngineError>
where
    I: IntoIterator + Clone,
    I::Item: AsRef<str>,
{
    use std::io::Write as _;

    let command = command_line(args.clone());
    debug!("running {command}");

    let mut child = Command::new("docker")
        .args(args.into_iter().map(|arg| arg.as_ref().to_owned()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(EngineError::Spawn)?;

    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes())
            .map_err(EngineError::Stream)?;
    }

    let output = child.wait_with_output().map_err(EngineError::Stream)?;
    if !output.status.success() {
        return Err(EngineError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a docker command with inherited stdio, for interactive use.
///
/// # Errors
///
/// Returns [`EngineError::Spawn`] when docker cannot be executed.
pub fn interactive<I>(args: I) -> Result<ExitStatus, EngineError>
where
    I: IntoIterator + Clone,
    I::Item: AsRef<str>,
{
    let command = command_line(args.clone());
    debug!("running {command}");

    Command::new("docker")
        .args(args.into_iter().map(|arg| arg.as_ref().to_owned()))
        .status()
        .map_err(EngineError::Spawn)
}

/// Result of asking a [`Streamed`] command for its next output line.
#[derive(Debug, PartialEq, Eq)]
pub enum NextLine {
    Line(String),
    /// Both output pipes closed; the command is done (or dying).
    Finished,
    /// Nothing arrived within the allowed wait.
    TimedOut,
}

/// A docker command whose interleaved output is being streamed.
///
/// The stream is finite and non-restartable: consume it to
/// [`NextLine::Finished`] and call [`Streamed::finish`], or abort with
/// [`Streamed::kill`]. Dropping without either leaks no process because
/// `kill` runs on drop for an unfinished child.
#[derive(Debug)]
pub struct Streamed {
    command: String,
    child: Option<Child>,
    receiver: Receiver<io::Result<String>>,
    readers: Vec<JoinHandle<()>>,
}

/// Spawn a docker command for streaming consumption.
///
/// # Errors
///
/// Returns [`EngineError::Spawn`] when docker cannot be executed.
pub fn stream<I>(args: I, workdir: Option<&std::path::Path>) -> Result<Streamed, EngineError>
where
    I: IntoIterator + Clone,
    I::Item: AsRef<str>,
{
    let command = command_line(args.clone());
    debug!("streaming {command}");

    let mut builder = Command::new("docker");
    builder
        .args(args.into_iter().map(|arg| arg.as_ref().to_owned()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(workdir) = workdir {
        builder.current_dir(workdir);
    }

    let mut child = builder.spawn().map_err(EngineError::Spawn)?;

    let (sender, receiver) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, sender.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, sender));
    }

    Ok(Streamed {
        command,
        child: Some(child),
        receiver,
        readers,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    sender: Sender<io::Result<String>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            if sender.send(line).is_err() {
                break;
            }
        }
    })
}

impl Streamed {
    /// Wait up to `wait` for the next output line.
    pub fn next_line(&mut self, wait: Duration) -> Result<NextLine, EngineError> {
        match self.receiver.recv_timeout(wait) {
            Ok(Ok(line)) => Ok(NextLine::Line(line)),
            Ok(Err(error)) => Err(EngineError::Stream(error)),
            Err(RecvTimeoutError::Timeout) => Ok(NextLine::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Ok(NextLine::Finished),
        }
    }

    /// Abort: kill the child and drop whatever output remains.
    pub fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }

    /// Wait for the command to exit after the stream finished.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Failed`] on a nonzero exit status.
    pub fn finish(mut self) -> Result<ExitStatus, EngineError> {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        let Some(mut child) = self.child.take() else {
            return Err(EngineError::Failed {
                command: self.command.clone(),
                code: None,
                stderr: "process already killed".to_owned(),
            });
        };
        let status = child.wait().map_err(EngineError::Stream)?;
        if status.success() {
            Ok(status)
        } else {
            Err(EngineError::Failed {
                command: self.command.clone(),
                code: status.code(),
                stderr: String::new(),
            })
        }
    }
}

impl Drop for Streamed {
    fn drop(&mut self) {
        // No orphaned children: a stream that was neither finished nor
        // killed is killed here.
        self.kill();
    }
}
