use nix::unistd::{Gid, Group, Uid, User, getgid, getuid};
use tracing::debug;

/// The non-privileged user that the device partition is mounted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOwner {
    pub uid: Uid,
    pub gid: Gid,
}

impl MountOwner {
    /// Format as `uid=N,gid=N` for vfat mount options.
    pub fn as_mount_options(&self) -> String {
        format!("uid={},gid={}", self.uid, self.gid)
    }
}

/// Determine who should own files on the mounted partition.
///
/// Detection order:
/// 1. `SUDO_UID` / `SUDO_GID` - the numeric ids of the user who invoked sudo
/// 2. `SUDO_USER` - looked up in the passwd database
/// 3. The real uid/gid of this process
pub fn get_mount_owner() -> MountOwner {
    if let Some(owner) = get_owner_from_sudo_ids() {
        debug!(uid = %owner.uid, gid = %owner.gid, "Detected mount owner from SUDO_UID");
        return owner;
    }

    if let Some(owner) = get_owner_from_sudo_user() {
        debug!(uid = %owner.uid, gid = %owner.gid, "Detected mount owner from SUDO_USER");
        return owner;
    }

    MountOwner {
        uid: getuid(),
        gid: getgid(),
    }
}

fn get_owner_from_sudo_ids() -> Option<MountOwner> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = match std::env::var("SUDO_GID").ok().and_then(|g| g.parse().ok()) {
        Some(gid) => Gid::from_raw(gid),
        None => User::from_uid(Uid::from_raw(uid)).ok()??.gid,
    };

    Some(MountOwner {
        uid: Uid::from_raw(uid),
        gid,
    })
}

fn get_owner_from_sudo_user() -> Option<MountOwner> {
    let sudo_user = std::env::var("SUDO_USER").ok()?;

    if sudo_user.is_empty() {
        return None;
    }

    let user = User::from_name(&sudo_user).ok()??;
    // Make sure the primary group actually resolves.
    let group = Group::from_gid(user.gid).ok()??;

    Some(MountOwner {
        uid: user.uid,
        gid: group.gid,
    })
}
