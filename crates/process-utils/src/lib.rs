//! Helpers for running short-lived external tools such as `ffprobe`.

#[cfg(feature = "tokio")]
use std::{ffi::OsStr, time::Duration};

#[cfg(all(windows, feature = "tokio"))]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Errors from running an external tool.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be found on `PATH`.
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u128 },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Captured output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Suppress the console window Windows opens for child processes.
///
/// No-op elsewhere.
#[cfg(feature = "tokio")]
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// A `tokio::process::Command` with [`NoWindowExt::no_window`] applied.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Run `program` with `args`, capturing its output, and kill it if it does
/// not finish within `timeout`.
///
/// A non-zero exit status is reported as [`ProcessError::Failed`].
#[cfg(feature = "tokio")]
pub async fn run_captured<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    timeout: Duration,
) -> Result<CapturedOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.as_ref().to_string_lossy().into_owned();
    let mut cmd = tokio_command(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(ProcessError::Timeout {
                program: name,
                timeout_ms: timeout.as_millis(),
            });
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProcessError::NotFound { program: name });
        }
        Ok(Err(source)) => return Err(ProcessError::Spawn { program: name, source }),
        Ok(Ok(output)) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ProcessError::Failed {
            program: name,
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CapturedOutput { stdout, stderr })
}
