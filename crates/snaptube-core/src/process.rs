//! Subprocess plumbing shared by the tool backends.
//!
//! [`run_streaming`] feeds each stdout line of a child to a callback while
//! honoring a [`TransferControl`]: reading stops while paused and the child is
//! killed as soon as cancellation is requested.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::backend::{PAUSE_POLL_INTERVAL, TransferControl};
use crate::error::{ResolutionError, TransferError};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Why a tool invocation failed, before it is mapped to a domain error.
#[derive(Debug)]
pub(crate) enum ProcessFailure {
    /// The binary could not be found.
    Missing,
    /// Spawning or talking to the child failed.
    Io(String),
    /// The child exited unsuccessfully.
    Failed { code: Option<i32>, stderr: String },
    /// Cancellation was requested while the child ran.
    Cancelled,
}

impl ProcessFailure {
    fn from_spawn(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::Missing,
            _ => Self::Io(err.to_string()),
        }
    }

    pub(crate) fn into_resolution(self, tool: &str) -> ResolutionError {
        match self {
            Self::Missing => ResolutionError::ToolMissing {
                tool: tool.to_string(),
            },
            Self::Io(reason) => ResolutionError::Io(reason),
            Self::Failed { code, stderr } => ResolutionError::ToolFailed {
                tool: tool.to_string(),
                code,
                stderr,
            },
            Self::Cancelled => ResolutionError::Io(format!("{tool} was interrupted")),
        }
    }

    pub(crate) fn into_transfer(self, tool: &str) -> TransferError {
        match self {
            Self::Missing => TransferError::ToolMissing {
                tool: tool.to_string(),
            },
            Self::Io(reason) => TransferError::Io {
                path: tool.into(),
                reason,
            },
            Self::Failed { code, stderr } => TransferError::ToolFailed {
                tool: tool.to_string(),
                code,
                stderr,
            },
            Self::Cancelled => TransferError::Cancelled,
        }
    }
}

/// Run a command to completion and return its stdout.
pub(crate) fn capture(command: &mut Command) -> Result<Vec<u8>, ProcessFailure> {
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ProcessFailure::from_spawn(&e))?;

    if !output.status.success() {
        return Err(ProcessFailure::Failed {
            code: output.status.code(),
            stderr: tail(String::from_utf8_lossy(&output.stderr).lines()),
        });
    }

    Ok(output.stdout)
}

/// Run a command, handing every stdout line to `on_line`.
pub(crate) fn run_streaming<F>(
    command: &mut Command,
    control: &TransferControl,
    mut on_line: F,
) -> Result<(), ProcessFailure>
where
    F: FnMut(&str),
{
    if control.is_cancelled() {
        return Err(ProcessFailure::Cancelled);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessFailure::from_spawn(&e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessFailure::Io("child stdout was not captured".to_string()))?;
    let stderr = child.stderr.take();

    let child = Mutex::new(child);
    let finished = AtomicBool::new(false);

    let (read_result, stderr_tail) = std::thread::scope(|scope| {
        scope.spawn(|| watch_for_cancel(&child, control, &finished));
        let stderr_reader = scope.spawn(move || stderr.map(collect_tail).unwrap_or_default());

        let read_result = read_lines(stdout, control, &mut on_line);
        if read_result.is_err() {
            kill(&child);
        }
        finished.store(true, Ordering::SeqCst);

        let stderr_tail = stderr_reader.join().unwrap_or_default();
        (read_result, stderr_tail)
    });

    let status = child
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .wait()
        .map_err(|e| ProcessFailure::Io(e.to_string()))?;

    if control.is_cancelled() {
        return Err(ProcessFailure::Cancelled);
    }
    read_result?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessFailure::Failed {
            code: status.code(),
            stderr: stderr_tail,
        })
    }
}

fn read_lines<R, F>(
    stdout: R,
    control: &TransferControl,
    on_line: &mut F,
) -> Result<(), ProcessFailure>
where
    R: Read,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();

    loop {
        control.checkpoint().map_err(|_| ProcessFailure::Cancelled)?;

        buffer.clear();
        let read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|e| ProcessFailure::Io(e.to_string()))?;
        if read == 0 {
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            on_line(line);
        }
    }
}

fn watch_for_cancel(child: &Mutex<Child>, control: &TransferControl, finished: &AtomicBool) {
    while !finished.load(Ordering::SeqCst) {
        if control.is_cancelled() {
            kill(child);
            return;
        }
        std::thread::sleep(PAUSE_POLL_INTERVAL);
    }
}

fn kill(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    match child.kill() {
        Ok(()) => debug!("Killed child process {}", child.id()),
        // Already exited
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => warn!("Failed to kill child process {}: {}", child.id(), e),
    }
}

fn collect_tail<R: Read>(stderr: R) -> String {
    let reader = BufReader::new(stderr);
    tail(reader.lines().map_while(std::result::Result::ok))
}

fn tail<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut kept = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        if kept.len() == STDERR_TAIL_LINES {
            kept.pop_front();
        }
        kept.push_back(line.to_string());
    }
    Vec::from(kept).join("\n")
}
