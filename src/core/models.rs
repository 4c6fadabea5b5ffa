use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Partition index used for the single whole-disk partition.
pub const PARTITION_SUFFIX: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDevice {
    pub path: PathBuf,
    pub model: String,
    pub size: String,
    pub transport: String,
}

impl TargetDevice {
    /// The single partition created on the device, e.g. `/dev/sdx` -> `/dev/sdx1`.
    pub fn partition_path(&self) -> PathBuf {
        partition_path(&self.path)
    }

    pub fn is_usb(&self) -> bool {
        self.transport.eq_ignore_ascii_case("usb")
    }
}

pub fn partition_path(device: &Path) -> PathBuf {
    let mut raw = device.as_os_str().to_os_string();
    raw.push(PARTITION_SUFFIX);
    PathBuf::from(raw)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub path: PathBuf,
}

/// Ephemeral directories owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirectories {
    pub tmp_root: PathBuf,
    pub usb_mount: PathBuf,
    pub iso_mount: PathBuf,
}

impl WorkDirectories {
    pub fn under(tmp_root: impl Into<PathBuf>) -> Self {
        let tmp_root = tmp_root.into();
        Self {
            usb_mount: tmp_root.join("usb"),
            iso_mount: tmp_root.join("iso"),
            tmp_root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountKind {
    /// `source` is mounted at `target`.
    Mount,
    /// Loop device `source` is backed by the file `target`.
    LoopAttachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub kind: MountKind,
    pub source: PathBuf,
    pub target: PathBuf,
}

impl fmt::Display for MountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MountKind::Mount => write!(f, "{} on {}", self.source.display(), self.target.display()),
            MountKind::LoopAttachment => write!(
                f,
                "{} backed by {}",
                self.source.display(),
                self.target.display()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Validating,
    ResolvingMounts,
    Preparing,
    Mounting,
    Copying,
    TearingDown,
    Complete,
    Failed,
}

impl PipelineState {
    /// Status line shown on entering the stage. Terminal states report their
    /// own outcome instead.
    pub fn status_text(&self) -> Option<&'static str> {
        match self {
            Self::Validating => Some("Checking selection..."),
            Self::ResolvingMounts => Some("Checking for mounted partitions..."),
            Self::Preparing => Some("Preparing device..."),
            Self::Mounting => Some("Setting up mount points..."),
            Self::Copying => Some("Copying files..."),
            Self::TearingDown => Some("Finishing up..."),
            Self::Idle | Self::Complete | Self::Failed => None,
        }
    }

    /// Whether a failure in this state may leave the device partially written.
    pub fn touches_device(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Mounting | Self::Copying | Self::TearingDown
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::ResolvingMounts => "resolving mounts",
            Self::Preparing => "preparing",
            Self::Mounting => "mounting",
            Self::Copying => "copying",
            Self::TearingDown => "tearing down",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a failed run left behind on the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Untouched,
    Undefined,
}

/// The Drive Preparer's steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PrepareStep {
    WidenPermissions,
    ZeroBootSector,
    Partition,
    Format,
    WriteBootstrap,
    InstallLoader,
    RestorePermissions,
}
