//! Runs one pipeline from validation to teardown.
//!
//! Blocking stages (anything touching the device or running privileged
//! commands) execute one after another on tokio's blocking pool, so privileged
//! commands are never concurrent. Cancellation is honoured only between
//! stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::copier::{self, CopyOptions, CopyResult};
use super::events::{EventReceiver, EventSink, PipelineEvent};
use super::models::{DeviceState, PipelineState, TargetDevice};
use super::mounter::{self, EnvironmentMounter, MountedEnvironment};
use super::preparer::DrivePreparer;
use super::privilege::PrivilegeContext;
use super::progress::ProgressEstimator;
use super::resolver::{self, MountConflictResolver};
use super::teardown;
use crate::context::{Collaborators, RunContext};
use crate::error::{PipelineError, PipelineResult};

pub const NO_DEVICE_MESSAGE: &str = "You must select a USB device first!";
pub const NO_IMAGE_MESSAGE: &str = "You must select an image file first!";
pub const CONFLICT_ABORT_MESSAGE: &str = "Unable to continue without unmounting USB device.";

/// Percent shown once the partition table is written.
const PERCENT_AFTER_PREPARE: u8 = 1;

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub elapsed_secs: i64,
}

/// Resources acquired so far, released on failure.
#[derive(Default)]
struct Acquired {
    state: Option<PipelineState>,
    privilege: Option<Arc<PrivilegeContext>>,
    env: Option<MountedEnvironment>,
}

pub struct Orchestrator {
    ctx: RunContext,
    collaborators: Collaborators,
    events: EventSink,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, collaborators: Collaborators) -> (Self, EventReceiver) {
        let (events, rx) = EventSink::channel();
        (
            Self {
                ctx,
                collaborators,
                events,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Token that stops the run at the next stage boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run in the background; progress arrives on the receiver returned by [`Orchestrator::new`].
    pub fn spawn(self) -> JoinHandle<PipelineResult<RunSummary>> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> PipelineResult<RunSummary> {
        let span = info_span!(
            "pipeline",
            run_id = %self.ctx.run_id,
            device = ?self.ctx.device.as_ref().map(|d| d.path.display().to_string())
        );

        async move {
            self.events.emit(PipelineEvent::Controls { enabled: false });
            self.events.state(PipelineState::Idle);

            let mut acquired = Acquired::default();
            let result = self.drive(&mut acquired).await;

            let outcome = match result {
                Ok(summary) => {
                    self.enter(&mut acquired, PipelineState::Complete);
                    info!(
                        files = summary.files_copied,
                        bytes = summary.bytes_copied,
                        elapsed_secs = summary.elapsed_secs,
                        "Run complete"
                    );
                    Ok(summary)
                }
                Err(e) => {
                    self.fail(&mut acquired, &e).await;
                    Err(e)
                }
            };

            self.events.emit(PipelineEvent::Controls { enabled: true });
            outcome
        }
        .instrument(span)
        .await
    }

    fn enter(&self, acquired: &mut Acquired, state: PipelineState) {
        info!(state = %state, "Entering stage");
        acquired.state = Some(state);
        self.events.state(state);
        if let Some(text) = state.status_text() {
            self.events.status(text);
        }
    }

    /// Stage boundary: the only place a cancellation takes effect.
    fn advance(&self, acquired: &mut Acquired, state: PipelineState) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(state));
        }
        self.enter(acquired, state);
        Ok(())
    }

    async fn drive(&self, acquired: &mut Acquired) -> PipelineResult<RunSummary> {
        self.advance(acquired, PipelineState::Validating)?;
        let (device, image) = self.validate()?;
        let privilege = self.acquire_privilege().await?;
        acquired.privilege = Some(privilege.clone());

        self.advance(acquired, PipelineState::ResolvingMounts)?;
        self.resolve_mounts(&privilege, &device.path, &image).await?;

        self.advance(acquired, PipelineState::Preparing)?;
        {
            let privilege = privilege.clone();
            let events = self.events.clone();
            let config = self.ctx.config.clone();
            let device_path = device.path.clone();
            tokio::task::spawn_blocking(move || {
                DrivePreparer::new(&privilege, &events, &config).prepare(&device_path)
            })
            .await??;
        }

        self.advance(acquired, PipelineState::Mounting)?;
        let env = {
            let privilege = privilege.clone();
            let events = self.events.clone();
            let config = self.ctx.config.clone();
            let dirs = self.ctx.work_dirs.clone();
            let partition = device.partition_path();
            let image = image.clone();
            tokio::task::spawn_blocking(move || {
                EnvironmentMounter::new(&privilege, &events, &config)
                    .mount_all(&dirs, &partition, &image)
            })
            .await??
        };
        acquired.env = Some(env);

        self.advance(acquired, PipelineState::Copying)?;
        let copied = self.copy_with_progress().await?;

        self.advance(acquired, PipelineState::TearingDown)?;
        if let Some(mut env) = acquired.env.take() {
            let privilege = privilege.clone();
            let events = self.events.clone();
            let (env, result) = tokio::task::spawn_blocking(move || {
                let result = teardown::teardown(&mut env, &privilege, &events);
                (env, result)
            })
            .await?;
            if result.is_err() {
                acquired.env = Some(env);
            }
            result?;
        }

        Ok(RunSummary {
            run_id: self.ctx.run_id,
            files_copied: copied.files_copied,
            bytes_copied: copied.bytes_copied,
            elapsed_secs: (Utc::now() - self.ctx.started_at).num_seconds(),
        })
    }

    /// Checks that need no privileges and have no side effects.
    fn validate(&self) -> PipelineResult<(TargetDevice, PathBuf)> {
        let device = self
            .ctx
            .device
            .clone()
            .ok_or_else(|| PipelineError::Validation(NO_DEVICE_MESSAGE.to_string()))?;

        if !device.is_usb() {
            return Err(PipelineError::Validation(format!(
                "{} is not a USB device (transport: {})",
                device.path.display(),
                device.transport
            )));
        }

        let image = self
            .ctx
            .image
            .as_ref()
            .ok_or_else(|| PipelineError::Validation(NO_IMAGE_MESSAGE.to_string()))?;
        match image.path.metadata() {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(PipelineError::Validation(format!(
                    "Image file {} does not exist or is not a regular file",
                    image.path.display()
                )));
            }
        }

        let config = &self.ctx.config;
        if !config.mbr_image.is_file() {
            return Err(PipelineError::Validation(format!(
                "Bootstrap image {} not found, is syslinux installed?",
                config.mbr_image.display()
            )));
        }
        if !config.syslinux_modules.is_dir() {
            return Err(PipelineError::Validation(format!(
                "syslinux modules directory {} not found",
                config.syslinux_modules.display()
            )));
        }

        mounter::ensure_work_dirs_clean(&self.ctx.work_dirs)?;
        Ok((device, image.path.clone()))
    }

    async fn acquire_privilege(&self) -> PipelineResult<Arc<PrivilegeContext>> {
        let credentials = self.collaborators.credentials.clone();
        let context = tokio::task::spawn_blocking(move || {
            let executor = credentials.privileged_executor().map_err(|e| {
                PipelineError::Validation(format!("Unable to obtain root privileges: {:#}", e))
            })?;
            PrivilegeContext::verify(executor)
        })
        .await??;
        Ok(Arc::new(context))
    }

    async fn resolve_mounts(
        &self,
        privilege: &Arc<PrivilegeContext>,
        device: &Path,
        image: &Path,
    ) -> PipelineResult<()> {
        let tables = self.collaborators.tables.clone();
        let prompt = self.collaborators.prompt.clone();
        let privilege = privilege.clone();
        let device = device.to_path_buf();
        let image = image.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let decision = MountConflictResolver::new(tables.as_ref(), prompt.as_ref())
                .check_conflicts(&device, &image)?;

            if decision.is_abort() {
                warn!(mounts = decision.mounted.len(), "Unmount declined");
                return Err(PipelineError::Conflict(CONFLICT_ABORT_MESSAGE.to_string()));
            }
            if decision.unmount {
                resolver::release(&privilege, &decision.mounted)?;
            }
            Ok(())
        })
        .await?
    }

    /// Copier on the blocking pool, estimator as an async task, joined together.
    async fn copy_with_progress(&self) -> PipelineResult<CopyResult> {
        let dirs = self.ctx.work_dirs.clone();
        let copy_done = CancellationToken::new();

        let estimator = ProgressEstimator::new(
            &dirs.iso_mount,
            &dirs.usb_mount,
            self.ctx.config.poll_interval(),
            PERCENT_AFTER_PREPARE,
        );
        let estimator_task = tokio::spawn(estimator.run(copy_done.clone(), self.events.clone()));

        let events = self.events.clone();
        let options = CopyOptions {
            sync_files: self.ctx.config.sync_files,
        };
        let copier_task = tokio::task::spawn_blocking(move || {
            copier::copy_tree(&dirs.iso_mount, &dirs.usb_mount, options, &mut |status| {
                events.status(status)
            })
        });

        let copied = copier_task.await;
        copy_done.cancel();

        match estimator_task.await {
            Ok(state) => info!(
                percent = state.percent,
                current = state.current_files,
                total = ?state.total_files,
                "Estimator finished"
            ),
            Err(e) => warn!(error = %e, "Estimator task failed"),
        }

        copied?
    }

    async fn fail(&self, acquired: &mut Acquired, err: &PipelineError) {
        // A cancellation is raised before its stage is entered, so this is the
        // last stage that actually ran.
        let state = acquired.state.unwrap_or(PipelineState::Idle);

        let held = (acquired.env.take(), acquired.privilege.clone());
        if let (Some(mut env), Some(privilege)) = held {
            let unwound = tokio::task::spawn_blocking(move || env.unwind(&privilege)).await;
            match unwound {
                Ok(Ok(())) => info!("Mounts released after failure"),
                Ok(Err(e)) => warn!(error = %e, "Failed to release mounts after failure"),
                Err(e) => warn!(error = %e, "Unwind task failed"),
            }
        }

        let device_state = if state.touches_device() {
            DeviceState::Undefined
        } else {
            DeviceState::Untouched
        };

        let message = match device_state {
            DeviceState::Untouched => err.to_string(),
            DeviceState::Undefined => format!("{} (device state undefined)", err),
        };
        error!(stage = %state, error = %err, ?device_state, "Run failed");

        self.events.status(message.clone());
        self.events.emit(PipelineEvent::Failed {
            message,
            device_state,
        });
        self.events.state(PipelineState::Failed);
    }
}
