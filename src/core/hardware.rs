use std::path::PathBuf;

use serde::Deserialize;

use super::models::TargetDevice;

/// One row of the block device listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(rename = "tran", default)]
    pub transport: Option<String>,
}

impl BlockDevice {
    pub fn is_usb(&self) -> bool {
        self.transport
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("usb"))
    }

    /// Human readable "model size" label, as shown in device pickers.
    pub fn label(&self) -> String {
        let model = self.model.as_deref().unwrap_or("Unknown").trim();
        let size = self.size.as_deref().unwrap_or("?");
        format!("{} {}", model, size)
    }

    pub fn into_target(self) -> TargetDevice {
        TargetDevice {
            path: PathBuf::from(&self.name),
            model: self.model.unwrap_or_default().trim().to_string(),
            size: self.size.unwrap_or_default(),
            transport: self.transport.unwrap_or_default(),
        }
    }
}

/// Lists attached block devices.
pub trait DeviceEnumerator: Send + Sync {
    fn list_block_devices(&self) -> anyhow::Result<Vec<BlockDevice>>;

    /// Only devices on the USB transport.
    fn usb_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        Ok(self
            .list_block_devices()?
            .into_iter()
            .filter(BlockDevice::is_usb)
            .collect())
    }
}

/// Yes/no question put to whoever started the run.
pub trait ConfirmationPrompt: Send + Sync {
    fn ask_yes_no(&self, title: &str, text: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_lsblk_row_with_nulls() {
        let dev: BlockDevice =
            serde_json::from_str(r#"{"name":"/dev/sda","tran":"sata","model":null,"size":"1T"}"#)
                .unwrap();
        assert_eq!(dev.name, "/dev/sda");
        assert!(!dev.is_usb());
        assert_eq!(dev.label(), "Unknown 1T");
    }

    #[test]
    fn into_target_trims_model() {
        let dev = BlockDevice {
            name: "/dev/sdx".to_string(),
            model: Some("Cruzer Blade   ".to_string()),
            size: Some("7.5G".to_string()),
            transport: Some("usb".to_string()),
        };
        let target = dev.into_target();
        assert_eq!(target.model, "Cruzer Blade");
        assert!(target.is_usb());
    }
}
