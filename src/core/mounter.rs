//! Mounting of the prepared partition and the image, and bootloader staging.
//!
//! Each successful mount is pushed on the [`MountedEnvironment`] stack. If a
//! later step fails the stack is unwound in reverse before the error is
//! returned, so a failed run does not leave mounts behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, info_span, warn};

use super::copier::{self, CopyOptions};
use super::events::EventSink;
use super::models::WorkDirectories;
use super::ownership::get_mount_owner;
use super::privilege::{CommandSpec, PrivilegeContext};
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};

/// Boot menu with a single entry chain-loading the Windows boot manager.
pub const BOOT_CONFIG: &str =
    "default boot\nLABEL boot\nMENU LABEL boot\nCOM32 chain.c32\nAPPEND fs ntldr=/bootmgr";

/// Mount points created for a run, and the ones currently mounted.
#[derive(Debug)]
pub struct MountedEnvironment {
    dirs: WorkDirectories,
    mounted: Vec<PathBuf>,
}

impl MountedEnvironment {
    fn new(dirs: WorkDirectories) -> Self {
        Self {
            dirs,
            mounted: Vec::new(),
        }
    }

    pub fn dirs(&self) -> &WorkDirectories {
        &self.dirs
    }

    pub fn usb_mount(&self) -> &Path {
        &self.dirs.usb_mount
    }

    pub fn iso_mount(&self) -> &Path {
        &self.dirs.iso_mount
    }

    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    fn mount(
        &mut self,
        privilege: &PrivilegeContext,
        command: CommandSpec,
        target: &Path,
    ) -> PipelineResult<()> {
        privilege.run(&command.path(target))?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    /// Unmount one tracked target.
    pub fn unmount(&mut self, privilege: &PrivilegeContext, target: &Path) -> PipelineResult<()> {
        privilege.run(&CommandSpec::new("umount").path(target))?;
        self.mounted.retain(|m| m != target);
        Ok(())
    }

    /// Release every mount in reverse order, then remove the mount points if empty.
    ///
    /// Keeps going after a failed unmount and returns the first error.
    pub fn unwind(&mut self, privilege: &PrivilegeContext) -> PipelineResult<()> {
        let mut first_error = None;

        while let Some(target) = self.mounted.pop() {
            info!(target = %target.display(), "Unwinding mount");
            if let Err(e) = privilege.run(&CommandSpec::new("umount").path(&target)) {
                warn!(target = %target.display(), error = %e, "Failed to unwind mount");
                first_error.get_or_insert(e);
            }
        }

        remove_empty_work_dirs(&self.dirs);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Non-recursive: a directory that is still mounted or has content stays put.
fn remove_empty_work_dirs(dirs: &WorkDirectories) {
    for dir in [&dirs.iso_mount, &dirs.usb_mount, &dirs.tmp_root] {
        if let Err(e) = fs::remove_dir(dir) {
            debug!(dir = %dir.display(), error = %e, "Leaving work directory in place");
        }
    }
}

/// The work root must be absent, or hold nothing but empty `usb`/`iso` mount
/// points. Teardown deletes it recursively.
pub fn ensure_work_dirs_clean(dirs: &WorkDirectories) -> PipelineResult<()> {
    let entries = match fs::read_dir(&dirs.tmp_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotADirectory => {
            return Err(PipelineError::Validation(format!(
                "Work directory {} is not a directory",
                dirs.tmp_root.display()
            )));
        }
        Err(e) => return Err(PipelineError::io("read directory", &dirs.tmp_root, e)),
    };

    for entry in entries {
        let path = entry
            .map_err(|e| PipelineError::io("read directory", &dirs.tmp_root, e))?
            .path();
        let is_mount_point = path == dirs.usb_mount || path == dirs.iso_mount;
        if !is_mount_point || !path.is_dir() {
            return Err(PipelineError::Validation(format!(
                "Work directory {} already contains {}",
                dirs.tmp_root.display(),
                path.display()
            )));
        }

        let mut contents =
            fs::read_dir(&path).map_err(|e| PipelineError::io("read directory", &path, e))?;
        if contents.next().is_some() {
            return Err(PipelineError::Validation(format!(
                "Work directory {} is not empty",
                path.display()
            )));
        }
    }
    Ok(())
}

pub struct EnvironmentMounter<'a> {
    privilege: &'a PrivilegeContext,
    events: &'a EventSink,
    config: &'a AppConfig,
}

impl<'a> EnvironmentMounter<'a> {
    pub fn new(
        privilege: &'a PrivilegeContext,
        events: &'a EventSink,
        config: &'a AppConfig,
    ) -> Self {
        Self {
            privilege,
            events,
            config,
        }
    }

    pub fn mount_all(
        &self,
        dirs: &WorkDirectories,
        partition: &Path,
        image: &Path,
    ) -> PipelineResult<MountedEnvironment> {
        let _span = info_span!("mount_environment", partition = %partition.display()).entered();

        if let Err(e) = Self::create_work_dirs(dirs) {
            remove_empty_work_dirs(dirs);
            return Err(e);
        }

        let mut env = MountedEnvironment::new(dirs.clone());
        match self.stage(&mut env, partition, image) {
            Ok(()) => Ok(env),
            Err(e) => {
                warn!(
                    error = %e,
                    mounted = env.mounted().len(),
                    "Mounting failed, unwinding partial mounts"
                );
                if let Err(unwind_err) = env.unwind(self.privilege) {
                    warn!(error = %unwind_err, "Unwind incomplete, mounts may remain");
                }
                Err(e)
            }
        }
    }

    fn create_work_dirs(dirs: &WorkDirectories) -> PipelineResult<()> {
        for dir in [&dirs.usb_mount, &dirs.iso_mount] {
            fs::create_dir_all(dir)
                .map_err(|e| PipelineError::io("create directory", dir, e))?;
        }
        ensure_work_dirs_clean(dirs)
    }

    fn stage(
        &self,
        env: &mut MountedEnvironment,
        partition: &Path,
        image: &Path,
    ) -> PipelineResult<()> {
        self.events.status("Mounting device and image...");

        let owner = get_mount_owner();
        let usb_mount = env.usb_mount().to_path_buf();
        let iso_mount = env.iso_mount().to_path_buf();

        env.mount(
            self.privilege,
            CommandSpec::new("mount")
                .arg("-t")
                .arg("vfat")
                .arg("-o")
                .arg(owner.as_mount_options())
                .path(partition),
            &usb_mount,
        )?;

        env.mount(
            self.privilege,
            CommandSpec::new("mount").arg("-o").arg("loop,ro").path(image),
            &iso_mount,
        )?;

        self.events.status("Copying syslinux modules...");
        self.stage_loader_modules(&usb_mount)?;

        self.events.status("Writing syslinux.cfg...");
        let config_path = usb_mount
            .join(&self.config.loader_dir)
            .join(&self.config.loader_config);
        fs::write(&config_path, BOOT_CONFIG)
            .map_err(|e| PipelineError::io("write", &config_path, e))?;

        self.events.status("Config written!");
        Ok(())
    }

    /// Copy the modules directory onto the drive and rename it to the loader directory.
    fn stage_loader_modules(&self, usb_mount: &Path) -> PipelineResult<()> {
        let modules = &self.config.syslinux_modules;
        let name = modules.file_name().ok_or_else(|| {
            PipelineError::Validation(format!(
                "Invalid syslinux modules directory: {}",
                modules.display()
            ))
        })?;

        let staged = usb_mount.join(name);
        copier::copy_tree(modules, &staged, CopyOptions::default(), &mut |_| {})?;

        let loader_dir = usb_mount.join(&self.config.loader_dir);
        if staged != loader_dir {
            fs::rename(&staged, &loader_dir)
                .map_err(|e| PipelineError::io("rename", &staged, e))?;
        }
        Ok(())
    }
}
