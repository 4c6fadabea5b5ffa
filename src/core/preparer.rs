//! Destructive preparation of the target device.
//!
//! The sequence is strictly ordered. A failure at any step aborts the run and
//! leaves the device in whatever intermediate state it reached; nothing is
//! retried or rolled back.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;

use tracing::{info, info_span, warn};

use super::events::EventSink;
use super::models::{PrepareStep, partition_path};
use super::privilege::{CommandSpec, PrivilegeContext};
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};

/// Size of the boot sector cleared before partitioning.
pub const BOOT_SECTOR_LEN: usize = 512;

/// Bootstrap code area of the MBR; the 72 bytes after it hold the disk
/// signature and partition table.
pub const BOOTSTRAP_LEN: usize = 440;

pub struct DrivePreparer<'a> {
    privilege: &'a PrivilegeContext,
    events: &'a EventSink,
    config: &'a AppConfig,
}

impl<'a> DrivePreparer<'a> {
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

    pub fn prepare(&self, device: &Path) -> PipelineResult<()> {
        let _span = info_span!("prepare_drive", device = %device.display()).entered();

        // Read inputs up front so a missing bootloader image fails before the device is touched.
        let bootstrap = read_bootstrap(&self.config.mbr_image)?;
        let original_mode = fs::metadata(device)
            .map_err(|e| PipelineError::io("stat", device, e))?
            .permissions()
            .mode()
            & 0o7777;

        self.events.step(PrepareStep::WidenPermissions);
        self.privilege
            .run(&CommandSpec::new("chmod").arg("666").path(device))?;

        let result = self.destructive_sequence(device, &bootstrap);

        self.events.step(PrepareStep::RestorePermissions);
        let restored = self.privilege.run(
            &CommandSpec::new("chmod")
                .arg(format!("{:o}", original_mode))
                .path(device),
        );

        match (result, restored) {
            (Err(e), Err(restore_err)) => {
                warn!(error = %restore_err, "Failed to restore device permissions after failure");
                Err(e)
            }
            (Err(e), Ok(_)) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(_)) => {
                info!("Device prepared");
                self.events.status("Ready to copy files!");
                Ok(())
            }
        }
    }

    fn destructive_sequence(&self, device: &Path, bootstrap: &[u8]) -> PipelineResult<()> {
        let partition = partition_path(device);

        self.events.step(PrepareStep::ZeroBootSector);
        self.events.status("Writing zeros to MBR...");
        write_at_start(device, &[0u8; BOOT_SECTOR_LEN])?;

        self.events.step(PrepareStep::Partition);
        self.events.status("Formatting device...");
        self.privilege.run(
            &CommandSpec::new("sfdisk")
                .path(device)
                .stdin(partition_script(&self.config.partition_type)),
        )?;
        self.events.percent(1);

        self.events.step(PrepareStep::Format);
        self.privilege.run(
            &CommandSpec::new("mkfs.vfat")
                .arg("-F")
                .arg("32")
                .arg("-n")
                .arg(&self.config.volume_label)
                .path(&partition),
        )?;

        // Only after partitioning: the partition table lives right behind this area.
        self.events.step(PrepareStep::WriteBootstrap);
        self.events.status("Writing to MBR...");
        write_at_start(device, bootstrap)?;

        self.events.step(PrepareStep::InstallLoader);
        self.events.status("Installing syslinux...");
        self.privilege
            .run(&CommandSpec::new("syslinux").arg("-i").path(&partition))?;

        Ok(())
    }
}

/// sfdisk script for one partition spanning the whole disk.
pub fn partition_script(type_code: &str) -> String {
    format!(",,{};\n", type_code)
}

/// First [`BOOTSTRAP_LEN`] bytes of the MBR image.
fn read_bootstrap(path: &Path) -> PipelineResult<Vec<u8>> {
    let mut image = fs::read(path).map_err(|e| PipelineError::io("read", path, e))?;
    if image.len() < BOOTSTRAP_LEN {
        return Err(PipelineError::Validation(format!(
            "Bootstrap image {} is {} bytes, expected at least {}",
            path.display(),
            image.len(),
            BOOTSTRAP_LEN
        )));
    }
    image.truncate(BOOTSTRAP_LEN);
    Ok(image)
}

/// Overwrite the start of the device in place; nothing past `data` is touched.
fn write_at_start(device: &Path, data: &[u8]) -> PipelineResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| PipelineError::io("open", device, e))?;
    file.write_all_at(data, 0)
        .map_err(|e| PipelineError::io("write", device, e))?;
    file.sync_all()
        .map_err(|e| PipelineError::io("sync", device, e))?;
    Ok(())
}
