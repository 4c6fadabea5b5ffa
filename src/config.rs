use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tuxboot/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Ephemeral work root; `usb/` and `iso/` mount points live under it.
    pub tmp_root: PathBuf,
    /// sfdisk type code of the single partition.
    pub partition_type: String,
    pub volume_label: String,
    /// syslinux MBR bootstrap image, at least 440 bytes.
    pub mbr_image: PathBuf,
    /// BIOS modules directory staged onto the drive.
    pub syslinux_modules: PathBuf,
    pub loader_dir: String,
    pub loader_config: String,
    pub poll_interval_ms: u64,
    /// fsync every copied file (slow on USB sticks).
    pub sync_files: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tmp_root: PathBuf::from("/tmp/tuxbooter"),
            partition_type: "c".to_string(),
            volume_label: "WINDOWS".to_string(),
            mbr_image: PathBuf::from("/usr/lib/syslinux/mbr/mbr.bin"),
            syslinux_modules: PathBuf::from("/usr/lib/syslinux/modules/bios"),
            loader_dir: "syslinux".to_string(),
            loader_config: "syslinux.cfg".to_string(),
            poll_interval_ms: 100,
            sync_files: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `TUXBOOT_*` env vars and CLI overrides,
    /// in increasing priority.
    pub fn new<T: Serialize>(
        overrides: Option<&T>,
        config_file: Option<&Path>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("TUXBOOT_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
