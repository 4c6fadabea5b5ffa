use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::hardware::ConfirmationPrompt;
use crate::core::models::{ImageSource, TargetDevice, WorkDirectories};
use crate::core::privilege::CredentialProvider;
use crate::core::resolver::SystemTables;

/// Everything one run needs to know, passed explicitly through every stage.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config: Arc<AppConfig>,
    pub device: Option<TargetDevice>,
    pub image: Option<ImageSource>,
    pub work_dirs: WorkDirectories,
}

impl RunContext {
    pub fn new(config: AppConfig, device: Option<TargetDevice>, image: Option<PathBuf>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            work_dirs: WorkDirectories::under(&config.tmp_root),
            config: Arc::new(config),
            device,
            image: image.map(|path| ImageSource { path }),
        }
    }
}

/// External collaborators the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialProvider>,
    pub prompt: Arc<dyn ConfirmationPrompt>,
    pub tables: Arc<dyn SystemTables>,
}
