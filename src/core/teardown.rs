use std::fs;

use tracing::info;

use super::events::{EventSink, PipelineEvent};
use super::mounter::MountedEnvironment;
use super::privilege::PrivilegeContext;
use crate::error::{PipelineError, PipelineResult};

pub const COMPLETED_STATUS: &str = "Bootable USB completed!";

/// Flush, unmount image then partition, delete the work root and signal completion.
///
/// On error `env` keeps whatever is still mounted so the caller can unwind it.
pub fn teardown(
    env: &mut MountedEnvironment,
    privilege: &PrivilegeContext,
    events: &EventSink,
) -> PipelineResult<()> {
    events.status("Syncing changes to disk...!");
    nix::unistd::sync();

    let iso_mount = env.iso_mount().to_path_buf();
    let usb_mount = env.usb_mount().to_path_buf();
    env.unmount(privilege, &iso_mount)?;
    env.unmount(privilege, &usb_mount)?;

    events.status("Cleaning up...");
    let tmp_root = env.dirs().tmp_root.clone();
    fs::remove_dir_all(&tmp_root).map_err(|e| PipelineError::io("remove", &tmp_root, e))?;
    info!(tmp_root = %tmp_root.display(), "Work directories removed");

    events.percent(100);
    events.status(COMPLETED_STATUS);
    events.emit(PipelineEvent::Completed);
    Ok(())
}
