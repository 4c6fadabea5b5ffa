//! Collaborators backed by the running Linux host.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use nix::unistd::geteuid;
use serde::Deserialize;
use tracing::{debug, info};

use crate::core::hardware::{BlockDevice, ConfirmationPrompt, DeviceEnumerator};
use crate::core::privilege::{CommandOutput, CommandSpec, CredentialProvider, PrivilegedExecutor};
use crate::core::resolver::{LoopInfo, SystemTables};

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
const SYS_BLOCK: &str = "/sys/block";

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// Lists whole-disk SCSI-class devices with `lsblk`.
pub struct LsblkEnumerator;

impl LsblkEnumerator {
    pub fn parse(json: &str) -> Result<Vec<BlockDevice>> {
        // lsblk prints nothing at all when no device matches.
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        let output: LsblkOutput =
            serde_json::from_str(json).context("Failed to parse lsblk output")?;
        Ok(output.blockdevices)
    }
}

impl DeviceEnumerator for LsblkEnumerator {
    fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = Command::new("lsblk")
            .args(["-pJS", "-o", "name,tran,model,size"])
            .output()
            .context("Failed to run lsblk")?;

        if !output.status.success() {
            bail!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

fn run_process(mut command: Command, stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)?;
        // Dropping the pipe closes it so the child sees EOF.
    }

    let output = child.wait_with_output()?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs commands directly; the process is already root.
pub struct DirectExecutor;

impl PrivilegedExecutor for DirectExecutor {
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        run_process(command, spec.stdin.as_deref())
    }
}

/// Runs commands through `sudo -S`, feeding the password on stdin.
pub struct SudoExecutor {
    program: PathBuf,
    password: String,
}

impl SudoExecutor {
    pub fn new(password: impl Into<String>) -> Self {
        Self::with_program("sudo", password)
    }

    /// Use a specific `sudo` binary.
    pub fn with_program(program: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            password: password.into(),
        }
    }
}

impl PrivilegedExecutor for SudoExecutor {
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut command = Command::new(&self.program);
        // -k: ignore any cached ticket so sudo always reads the password line,
        // even right after the liveness check or under NOPASSWD.
        command
            .args(["-k", "-S", "-p", "", "--"])
            .arg(&spec.program)
            .args(&spec.args);

        // sudo consumes the first line; the rest reaches the command.
        let mut input = Vec::with_capacity(self.password.len() + 1);
        input.extend_from_slice(self.password.as_bytes());
        input.push(b'\n');
        if let Some(extra) = &spec.stdin {
            input.extend_from_slice(extra);
        }

        run_process(command, Some(&input))
    }
}

/// Root runs directly; anyone else is asked for their sudo password once.
pub struct LinuxCredentialProvider;

impl CredentialProvider for LinuxCredentialProvider {
    fn privileged_executor(&self) -> Result<Arc<dyn PrivilegedExecutor>> {
        if geteuid().is_root() {
            debug!("Running as root, no credentials needed");
            return Ok(Arc::new(DirectExecutor));
        }

        eprint!("Enter password for root: ");
        io::stderr().flush()?;
        let mut password = String::new();
        io::stdin()
            .lock()
            .read_line(&mut password)
            .context("Failed to read password")?;
        let password = password.trim_end_matches(['\r', '\n']);
        if password.is_empty() {
            bail!("no password given");
        }

        Ok(Arc::new(SudoExecutor::new(password)))
    }
}

/// Asks on the terminal, or answers yes without asking.
pub struct TerminalPrompt {
    pub assume_yes: bool,
}

impl ConfirmationPrompt for TerminalPrompt {
    fn ask_yes_no(&self, title: &str, text: &str) -> bool {
        println!("{}\n", title);
        println!("{}", text);

        if self.assume_yes {
            info!("Confirmation assumed (--yes)");
            return true;
        }

        print!("[y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return false;
        }

        input.trim().eq_ignore_ascii_case("y")
    }
}

/// Mount table from procfs, loop table from sysfs.
pub struct ProcTables;

impl SystemTables for ProcTables {
    fn mountinfo(&self) -> io::Result<String> {
        fs::read_to_string(MOUNTINFO_PATH)
    }

    fn loop_devices(&self) -> io::Result<Vec<LoopInfo>> {
        read_loop_devices(Path::new(SYS_BLOCK))
    }
}

/// Loop devices under a sysfs `block` directory that have a backing file.
pub fn read_loop_devices(sys_block: &Path) -> io::Result<Vec<LoopInfo>> {
    let mut loops = Vec::new();

    for entry in fs::read_dir(sys_block)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("loop") {
            continue;
        }

        let backing = match fs::read_to_string(entry.path().join("loop/backing_file")) {
            Ok(content) => content,
            // Detached loop devices have no `loop/` directory.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let backing = backing.trim_end();
        let backing = backing.strip_suffix(" (deleted)").unwrap_or(backing);

        loops.push(LoopInfo {
            device: PathBuf::from("/dev").join(&name),
            backing_file: PathBuf::from(backing),
        });
    }

    loops.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(loops)
}
