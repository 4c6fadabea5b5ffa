//! Detection of mounts and loop attachments that would collide with a run.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use super::hardware::ConfirmationPrompt;
use super::models::{MountKind, MountRecord};
use super::privilege::{CommandSpec, PrivilegeContext};
use crate::error::{PipelineError, PipelineResult};

/// Partition suffixes that may follow a whole-disk path: `1`, `p2`, ...
static PARTITION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^p?\d+$").expect("valid partition regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    pub device: PathBuf,
    pub backing_file: PathBuf,
}

/// Live mount and loop tables of the host.
pub trait SystemTables: Send + Sync {
    /// Raw contents in `/proc/self/mountinfo` format.
    fn mountinfo(&self) -> io::Result<String>;

    fn loop_devices(&self) -> io::Result<Vec<LoopInfo>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecision {
    /// Proceed and unmount everything in `mounted`.
    pub unmount: bool,
    pub mounted: Vec<MountRecord>,
}

impl ConflictDecision {
    pub fn no_conflict() -> Self {
        Self {
            unmount: false,
            mounted: Vec::new(),
        }
    }

    pub fn is_abort(&self) -> bool {
        !self.unmount && !self.mounted.is_empty()
    }
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            // <id> <parent> <maj:min> <root> <mount point> <opts...> - <fstype> <source> <opts>
            let (pre, post) = line.split_once(" - ")?;
            let target = pre.split_whitespace().nth(4)?;
            let source = post.split_whitespace().nth(1)?;
            Some(MountEntry {
                source: PathBuf::from(unescape_mount_path(source)),
                target: PathBuf::from(unescape_mount_path(target)),
            })
        })
        .collect()
}

/// Undo the octal escaping mountinfo applies to spaces, tabs, newlines and backslashes.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = raw
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `source` is `device` itself or one of its partitions.
pub fn is_device_or_partition(source: &Path, device: &Path) -> bool {
    if source == device {
        return true;
    }
    let source = source.to_string_lossy();
    let device = device.to_string_lossy();
    source
        .strip_prefix(device.as_ref())
        .is_some_and(|rest| PARTITION_SUFFIX.is_match(rest))
}

/// Everything on the host that overlaps with `device` or `image`.
pub fn find_conflicts(
    tables: &dyn SystemTables,
    device: &Path,
    image: &Path,
) -> io::Result<Vec<MountRecord>> {
    let mounts = parse_mountinfo(&tables.mountinfo()?);
    let loops = tables.loop_devices()?;
    let image = canonical(image);

    let image_loops: Vec<&LoopInfo> = loops
        .iter()
        .filter(|l| canonical(&l.backing_file) == image)
        .collect();

    let mut records: Vec<MountRecord> = mounts
        .iter()
        .filter(|m| {
            is_device_or_partition(&m.source, device)
                || image_loops.iter().any(|l| l.device == m.source)
        })
        .map(|m| MountRecord {
            kind: MountKind::Mount,
            source: m.source.clone(),
            target: m.target.clone(),
        })
        .collect();

    records.extend(image_loops.iter().map(|l| MountRecord {
        kind: MountKind::LoopAttachment,
        source: l.device.clone(),
        target: l.backing_file.clone(),
    }));

    Ok(records)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub struct MountConflictResolver<'a> {
    tables: &'a dyn SystemTables,
    prompt: &'a dyn ConfirmationPrompt,
}

impl<'a> MountConflictResolver<'a> {
    pub fn new(tables: &'a dyn SystemTables, prompt: &'a dyn ConfirmationPrompt) -> Self {
        Self { tables, prompt }
    }

    /// Look for overlapping mounts and, if any exist, ask whether to unmount them.
    ///
    /// Never unmounts anything itself; see [`release`].
    pub fn check_conflicts(&self, device: &Path, image: &Path) -> PipelineResult<ConflictDecision> {
        let mounted = find_conflicts(self.tables, device, image)
            .map_err(|e| PipelineError::io("read mount tables for", device, e))?;

        if mounted.is_empty() {
            debug!(device = %device.display(), "No mount conflicts");
            return Ok(ConflictDecision::no_conflict());
        }

        let listing = mounted
            .iter()
            .map(|r| format!("  {}", r))
            .collect::<Vec<_>>()
            .join("\n");
        info!(count = mounted.len(), "Found mounts overlapping the selected device or image");

        let unmount = self.prompt.ask_yes_no(
            "Device is in use",
            &format!(
                "The USB device or image is currently mounted:\n{}\nUnmount and continue?",
                listing
            ),
        );

        Ok(ConflictDecision { unmount, mounted })
    }
}

/// Unmount every record of a proceed decision: mounts deepest first, then loop devices.
pub fn release(privilege: &PrivilegeContext, records: &[MountRecord]) -> PipelineResult<()> {
    let mut mounts: Vec<&MountRecord> = records
        .iter()
        .filter(|r| r.kind == MountKind::Mount)
        .collect();
    mounts.sort_by_key(|r| std::cmp::Reverse(r.target.components().count()));

    for record in mounts {
        info!(source = %record.source.display(), target = %record.target.display(), "Unmounting");
        privilege.run(&CommandSpec::new("umount").path(&record.target))?;
    }

    for record in records.iter().filter(|r| r.kind == MountKind::LoopAttachment) {
        info!(device = %record.source.display(), "Detaching loop device");
        if let Err(e) = privilege.run(&CommandSpec::new("losetup").arg("-d").path(&record.source)) {
            warn!(device = %record.source.display(), error = %e, "Failed to detach loop device");
            return Err(e);
        }
    }

    Ok(())
}
