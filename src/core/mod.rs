pub mod copier;
pub mod events;
pub mod hardware;
pub mod models;
pub mod mounter;
pub mod orchestrator;
pub mod ownership;
pub mod preparer;
pub mod privilege;
pub mod progress;
pub mod resolver;
pub mod teardown;

pub use copier::{CopyOptions, CopyResult, copy_tree};
pub use events::{EventReceiver, EventSink, PipelineEvent};
pub use hardware::{BlockDevice, ConfirmationPrompt, DeviceEnumerator};
pub use models::{
    DeviceState, ImageSource, MountKind, MountRecord, PipelineState, PrepareStep, TargetDevice,
    WorkDirectories,
};
pub use orchestrator::{Orchestrator, RunSummary};
pub use privilege::{CommandSpec, CredentialProvider, PrivilegeContext, PrivilegedExecutor};
pub use progress::{ProgressEstimator, ProgressState};
pub use resolver::{ConflictDecision, MountConflictResolver, SystemTables};
