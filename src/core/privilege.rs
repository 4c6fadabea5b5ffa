//! Privileged command execution.
//!
//! A run obtains one [`PrivilegedExecutor`] from a [`CredentialProvider`],
//! proves it works with a trivial no-op, and threads the resulting
//! [`PrivilegeContext`] through every stage that needs root. The context is
//! dropped when the run ends.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// A program invocation, with optional bytes for its stdin.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands with elevated permissions.
///
/// Implementations must run commands synchronously and one at a time; callers
/// never issue two privileged commands concurrently.
pub trait PrivilegedExecutor: Send + Sync {
    fn execute(&self, command: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Source of a privileged executor for one run.
pub trait CredentialProvider: Send + Sync {
    fn privileged_executor(&self) -> anyhow::Result<Arc<dyn PrivilegedExecutor>>;
}

/// A verified executor, owned by exactly one run.
pub struct PrivilegeContext {
    executor: Arc<dyn PrivilegedExecutor>,
}

impl PrivilegeContext {
    /// Trust `executor` only after a privileged no-op succeeds through it.
    /// On failure the executor is dropped here and never handed out.
    pub fn verify(executor: Arc<dyn PrivilegedExecutor>) -> PipelineResult<Self> {
        let check = CommandSpec::new("true");
        match executor.execute(&check) {
            Ok(output) if output.success() => {
                debug!("Privileged context verified");
                Ok(Self { executor })
            }
            Ok(output) => {
                warn!(code = ?output.code, "Privilege liveness check failed");
                Err(PipelineError::Validation(
                    "Unable to obtain root privileges: authentication failed".to_string(),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Privilege liveness check could not run");
                Err(PipelineError::Validation(format!(
                    "Unable to obtain root privileges: {}",
                    e
                )))
            }
        }
    }

    /// Run a command and turn any unsuccessful exit into [`PipelineError::Command`].
    pub fn run(&self, command: &CommandSpec) -> PipelineResult<CommandOutput> {
        debug!(command = ?command, "Running privileged command");

        let output = self
            .executor
            .execute(command)
            .map_err(|e| PipelineError::io("spawn", &command.program, e))?;

        if !output.success() {
            return Err(PipelineError::Command {
                program: command.program.clone(),
                args: command.args.clone(),
                code: output.code,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

impl fmt::Debug for PrivilegeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivilegeContext(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        code: Option<i32>,
        seen: Mutex<Vec<String>>,
    }

    impl PrivilegedExecutor for Scripted {
        fn execute(&self, command: &CommandSpec) -> io::Result<CommandOutput> {
            self.seen.lock().unwrap().push(format!("{:?}", command));
            Ok(CommandOutput {
                code: self.code,
                stdout: String::new(),
                stderr: "nope".to_string(),
            })
        }
    }

    #[test]
    fn verify_runs_true_once() {
        let exec = Arc::new(Scripted {
            code: Some(0),
            seen: Mutex::new(Vec::new()),
        });
        PrivilegeContext::verify(exec.clone()).unwrap();
        assert_eq!(*exec.seen.lock().unwrap(), vec!["true".to_string()]);
    }

    #[test]
    fn verify_failure_is_validation_error() {
        let exec = Arc::new(Scripted {
            code: Some(1),
            seen: Mutex::new(Vec::new()),
        });
        let err = PrivilegeContext::verify(exec.clone()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        // The context never escaped, so only the verifier holds a reference.
        assert_eq!(Arc::strong_count(&exec), 1);
    }

    #[test]
    fn run_reports_program_and_exit_code() {
        let ctx = PrivilegeContext {
            executor: Arc::new(Scripted {
                code: Some(32),
                seen: Mutex::new(Vec::new()),
            }),
        };
        let err = ctx
            .run(&CommandSpec::new("mount").arg("/dev/sdx1"))
            .unwrap_err();
        match err {
            PipelineError::Command { program, code, .. } => {
                assert_eq!(program, "mount");
                assert_eq!(code, Some(32));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn command_spec_debug_is_shell_like() {
        let cmd = CommandSpec::new("mkfs.vfat")
            .arg("-F")
            .arg("32")
            .path(Path::new("/dev/sdx1"));
        assert_eq!(format!("{:?}", cmd), "mkfs.vfat -F 32 /dev/sdx1");
    }
}
