//! In-process stand-ins for the host, used by `--simulation` and the tests.
//!
//! The simulated executor interprets the handful of commands the pipeline
//! issues against ordinary files and directories: a regular file plays the
//! block device, a directory tree plays the image contents.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use tracing::debug;

use crate::core::copier::{self, CopyOptions};
use crate::core::hardware::{BlockDevice, ConfirmationPrompt, DeviceEnumerator};
use crate::core::privilege::{CommandOutput, CommandSpec, CredentialProvider, PrivilegedExecutor};
use crate::core::resolver::{LoopInfo, SystemTables};

/// MBR boot signature written by the simulated `sfdisk`.
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

#[derive(Default)]
pub struct SimulatedExecutor {
    log: Mutex<Vec<CommandSpec>>,
    image_tree: Option<PathBuf>,
    device_store: Option<PathBuf>,
    fail_program: Option<String>,
    fail_arg: Option<String>,
    reject_auth: bool,
    device_mounts: Mutex<Vec<PathBuf>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents that appear when anything is loop-mounted.
    pub fn with_image_tree(mut self, tree: impl Into<PathBuf>) -> Self {
        self.image_tree = Some(tree.into());
        self
    }

    /// Where files written to the device mount are kept after it is unmounted.
    pub fn with_device_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.device_store = Some(store.into());
        self
    }

    /// Make every invocation of `program` exit with status 1.
    pub fn failing(mut self, program: impl Into<String>) -> Self {
        self.fail_program = Some(program.into());
        self
    }

    /// Like [`SimulatedExecutor::failing`], but only when one of the arguments contains `needle`.
    pub fn failing_with_arg(
        mut self,
        program: impl Into<String>,
        needle: impl Into<String>,
    ) -> Self {
        self.fail_program = Some(program.into());
        self.fail_arg = Some(needle.into());
        self
    }

    /// Fail the privilege liveness check.
    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.program).collect()
    }

    fn should_fail(&self, spec: &CommandSpec) -> bool {
        if self.fail_program.as_deref() != Some(spec.program.as_str()) {
            return false;
        }
        match &self.fail_arg {
            Some(needle) => spec.args.iter().any(|a| a.contains(needle.as_str())),
            None => true,
        }
    }

    fn interpret(&self, spec: &CommandSpec) -> io::Result<()> {
        let args = &spec.args;
        match spec.program.as_str() {
            "chmod" => {
                if let [mode, path] = args.as_slice() {
                    let mode = u32::from_str_radix(mode, 8)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
                }
            }
            "sfdisk" => {
                if let Some(device) = args.first() {
                    let file = OpenOptions::new().write(true).open(device)?;
                    file.write_all_at(&BOOT_SIGNATURE, 510)?;
                }
            }
            "mount" => {
                let options = args
                    .iter()
                    .position(|a| a == "-o")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                let target = PathBuf::from(args.last().cloned().unwrap_or_default());
                if options.split(',').any(|o| o == "loop") {
                    if let Some(tree) = &self.image_tree {
                        copier::copy_tree(tree, &target, CopyOptions::default(), &mut |_| {})
                            .map_err(io::Error::other)?;
                    }
                } else if let Ok(mut mounts) = self.device_mounts.lock() {
                    mounts.push(target);
                }
            }
            "umount" => {
                let target = PathBuf::from(args.last().cloned().unwrap_or_default());
                let was_device = self
                    .device_mounts
                    .lock()
                    .map(|mut mounts| {
                        let before = mounts.len();
                        mounts.retain(|m| m != &target);
                        before != mounts.len()
                    })
                    .unwrap_or(false);
                if was_device {
                    if let Some(store) = &self.device_store {
                        copier::copy_tree(&target, store, CopyOptions::default(), &mut |_| {})
                            .map_err(io::Error::other)?;
                    }
                }
                clear_directory(&target)?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn clear_directory(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl PrivilegedExecutor for SimulatedExecutor {
    fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!(command = ?spec, "(Simulated) executing");
        if let Ok(mut log) = self.log.lock() {
            log.push(spec.clone());
        }

        let refused = (spec.program == "true" && self.reject_auth) || self.should_fail(spec);
        if refused {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("simulated failure of {}", spec.program),
            });
        }

        if let Err(e) = self.interpret(spec) {
            return Ok(CommandOutput {
                code: Some(32),
                stdout: String::new(),
                stderr: e.to_string(),
            });
        }

        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

/// Hands out the same simulated executor on every request.
pub struct SimulatedCredentials {
    executor: Arc<SimulatedExecutor>,
    requests: AtomicUsize,
}

impl SimulatedCredentials {
    pub fn new(executor: Arc<SimulatedExecutor>) -> Self {
        Self {
            executor,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for SimulatedCredentials {
    fn privileged_executor(&self) -> Result<Arc<dyn PrivilegedExecutor>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.executor.clone())
    }
}

/// Always gives the same answer and counts how often it was asked.
pub struct FixedPrompt {
    answer: bool,
    asked: AtomicUsize,
}

impl FixedPrompt {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl ConfirmationPrompt for FixedPrompt {
    fn ask_yes_no(&self, title: &str, _text: &str) -> bool {
        debug!(title, answer = self.answer, "(Simulated) confirmation");
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

#[derive(Default)]
pub struct StaticTables {
    pub mountinfo: String,
    pub loops: Vec<LoopInfo>,
}

impl SystemTables for StaticTables {
    fn mountinfo(&self) -> io::Result<String> {
        Ok(self.mountinfo.clone())
    }

    fn loop_devices(&self) -> io::Result<Vec<LoopInfo>> {
        Ok(self.loops.clone())
    }
}

/// A fixed list of devices.
#[derive(Default)]
pub struct SimulatedEnumerator {
    pub devices: Vec<BlockDevice>,
}

impl SimulatedEnumerator {
    pub fn with_usb_device(path: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            devices: vec![BlockDevice {
                name: path.into(),
                model: Some("Simulated Flash".to_string()),
                size: Some(size.into()),
                transport: Some("usb".to_string()),
            }],
        }
    }
}

impl DeviceEnumerator for SimulatedEnumerator {
    fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        if self.devices.iter().any(|d| d.name.is_empty()) {
            bail!("simulated device without a name");
        }
        Ok(self.devices.clone())
    }
}
