use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tuxboot::PipelineError;
use tuxboot::adapters::{
    BOOT_SIGNATURE, FixedPrompt, SimulatedCredentials, SimulatedExecutor, StaticTables,
};
use tuxboot::config::AppConfig;
use tuxboot::context::{Collaborators, RunContext};
use tuxboot::core::mounter::BOOT_CONFIG;
use tuxboot::core::orchestrator::{CONFLICT_ABORT_MESSAGE, NO_DEVICE_MESSAGE, NO_IMAGE_MESSAGE};
use tuxboot::core::progress::count_regular_files;
use tuxboot::core::teardown::COMPLETED_STATUS;
use tuxboot::core::privilege::CommandOutput;
use tuxboot::core::{
    CommandSpec, CredentialProvider, DeviceState, Orchestrator, PipelineEvent, PipelineState,
    PrepareStep, PrivilegedExecutor, RunSummary, TargetDevice,
};

const DEVICE_LEN: usize = 4096;
const DEVICE_MODE: u32 = 0o640;

struct Fixture {
    _temp: TempDir,
    device: PathBuf,
    image: PathBuf,
    tree: PathBuf,
    store: PathBuf,
    bootstrap: Vec<u8>,
    config: AppConfig,
}

impl Fixture {
    /// A fake device file, an image whose loop mount shows `files` files, and syslinux assets.
    fn new(files: usize) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let device = root.join("sdx");
        fs::write(&device, vec![0xFFu8; DEVICE_LEN]).unwrap();
        fs::set_permissions(&device, fs::Permissions::from_mode(DEVICE_MODE)).unwrap();

        let image = root.join("win.iso");
        fs::write(&image, b"not really an iso").unwrap();

        let tree = root.join("tree");
        fs::create_dir_all(tree.join("boot")).unwrap();
        fs::create_dir_all(tree.join("sources")).unwrap();
        fs::write(tree.join("bootmgr"), b"bootmgr").unwrap();
        fs::write(tree.join("boot/bcd"), b"bcd").unwrap();
        for i in 2..files {
            fs::write(tree.join(format!("sources/part{:03}.wim", i)), vec![b'w'; 64]).unwrap();
        }

        let bootstrap: Vec<u8> = (0..442u32).map(|i| (i % 251) as u8 + 1).collect();
        let mbr_image = root.join("mbr.bin");
        fs::write(&mbr_image, &bootstrap).unwrap();

        let modules = root.join("lib/bios");
        fs::create_dir_all(&modules).unwrap();
        fs::write(modules.join("chain.c32"), b"chain").unwrap();
        fs::write(modules.join("ldlinux.c32"), b"ldlinux").unwrap();

        let config = AppConfig {
            tmp_root: root.join("work/tuxbooter"),
            mbr_image,
            syslinux_modules: modules,
            poll_interval_ms: 1,
            ..AppConfig::default()
        };

        Self {
            store: root.join("store"),
            _temp: temp,
            device,
            image,
            tree,
            bootstrap,
            config,
        }
    }

    fn target(&self) -> TargetDevice {
        TargetDevice {
            path: self.device.clone(),
            model: "Simulated Flash".to_string(),
            size: "8G".to_string(),
            transport: "usb".to_string(),
        }
    }

    fn executor(&self) -> SimulatedExecutor {
        SimulatedExecutor::new()
            .with_image_tree(&self.tree)
            .with_device_store(&self.store)
    }
}

struct Outcome {
    result: Result<RunSummary, PipelineError>,
    events: Vec<PipelineEvent>,
    executor: Arc<SimulatedExecutor>,
    credentials: Arc<SimulatedCredentials>,
    prompt: Arc<FixedPrompt>,
}

impl Outcome {
    fn statuses(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Status(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn percents(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Percent(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn states(&self) -> Vec<PipelineState> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn steps(&self) -> Vec<PrepareStep> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Step(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn failure(&self) -> Option<(&str, DeviceState)> {
        self.events.iter().find_map(|e| match e {
            PipelineEvent::Failed {
                message,
                device_state,
            } => Some((message.as_str(), *device_state)),
            _ => None,
        })
    }
}

async fn run_pipeline(
    config: AppConfig,
    device: Option<TargetDevice>,
    image: Option<PathBuf>,
    executor: SimulatedExecutor,
    tables: StaticTables,
    answer: bool,
) -> Outcome {
    let executor = Arc::new(executor);
    let credentials = Arc::new(SimulatedCredentials::new(executor.clone()));
    let prompt = Arc::new(FixedPrompt::new(answer));
    let collaborators = Collaborators {
        credentials: credentials.clone(),
        prompt: prompt.clone(),
        tables: Arc::new(tables),
    };

    let ctx = RunContext::new(config, device, image);
    let (orchestrator, mut rx) = Orchestrator::new(ctx, collaborators);
    let result = timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("pipeline timed out");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    Outcome {
        result,
        events,
        executor,
        credentials,
        prompt,
    }
}

async fn run_fixture(fx: &Fixture, executor: SimulatedExecutor) -> Outcome {
    run_pipeline(
        fx.config.clone(),
        Some(fx.target()),
        Some(fx.image.clone()),
        executor,
        StaticTables::default(),
        true,
    )
    .await
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

#[tokio::test]
async fn test_full_run_produces_bootable_layout() {
    let fx = Fixture::new(100);
    let out = run_fixture(&fx, fx.executor()).await;

    let summary = out.result.as_ref().expect("run should succeed");
    assert_eq!(summary.files_copied, 100);

    assert_eq!(
        out.states(),
        vec![
            PipelineState::Idle,
            PipelineState::Validating,
            PipelineState::ResolvingMounts,
            PipelineState::Preparing,
            PipelineState::Mounting,
            PipelineState::Copying,
            PipelineState::TearingDown,
            PipelineState::Complete,
        ]
    );
    assert_eq!(out.statuses().last(), Some(&COMPLETED_STATUS));
    assert!(out.events.contains(&PipelineEvent::Completed));
    assert_eq!(
        out.events.first(),
        Some(&PipelineEvent::Controls { enabled: false })
    );
    assert_eq!(
        out.events.last(),
        Some(&PipelineEvent::Controls { enabled: true })
    );

    let statuses = out.statuses();
    for stage in [
        PipelineState::Validating,
        PipelineState::ResolvingMounts,
        PipelineState::Preparing,
        PipelineState::Mounting,
        PipelineState::Copying,
        PipelineState::TearingDown,
    ] {
        let text = stage.status_text().unwrap();
        assert!(statuses.contains(&text), "missing status for {}", stage);
    }
    assert_eq!(statuses[0], "Checking selection...");

    assert!(!fx.config.tmp_root.exists());
    assert_eq!(mode_of(&fx.device), DEVICE_MODE);
    assert_eq!(out.credentials.requests(), 1);
    assert_eq!(out.prompt.times_asked(), 0);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_held_below_completion() {
    let fx = Fixture::new(100);
    let out = run_fixture(&fx, fx.executor()).await;
    assert!(out.result.is_ok());

    let percents = out.percents();
    assert_eq!(percents.first(), Some(&1));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert!(percents[..percents.len() - 1].iter().all(|p| *p <= 99));
}

#[tokio::test]
async fn test_device_bytes_and_staged_files() {
    let fx = Fixture::new(100);
    let out = run_fixture(&fx, fx.executor()).await;
    assert!(out.result.is_ok());

    let data = fs::read(&fx.device).unwrap();
    assert_eq!(data.len(), DEVICE_LEN);
    assert_eq!(&data[..440], &fx.bootstrap[..440]);
    assert!(data[440..510].iter().all(|b| *b == 0));
    assert_eq!(&data[510..512], &BOOT_SIGNATURE);
    assert!(data[512..].iter().all(|b| *b == 0xFF));

    assert_eq!(
        out.steps(),
        vec![
            PrepareStep::WidenPermissions,
            PrepareStep::ZeroBootSector,
            PrepareStep::Partition,
            PrepareStep::Format,
            PrepareStep::WriteBootstrap,
            PrepareStep::InstallLoader,
            PrepareStep::RestorePermissions,
        ]
    );

    // 100 image files, two modules and the boot menu
    assert_eq!(count_regular_files(&fx.store).unwrap(), 103);
    assert_eq!(
        fs::read_to_string(fx.store.join("syslinux/syslinux.cfg")).unwrap(),
        BOOT_CONFIG
    );
    assert!(fx.store.join("syslinux/chain.c32").is_file());
    assert!(!fx.store.join("bios").exists());
    assert_eq!(fs::read(fx.store.join("bootmgr")).unwrap(), b"bootmgr");
}

#[tokio::test]
async fn test_command_order() {
    let fx = Fixture::new(10);
    let out = run_fixture(&fx, fx.executor()).await;
    assert!(out.result.is_ok());

    assert_eq!(
        out.executor.programs(),
        vec![
            "true",
            "chmod",
            "sfdisk",
            "mkfs.vfat",
            "syslinux",
            "chmod",
            "mount",
            "mount",
            "umount",
            "umount",
        ]
    );

    let commands = out.executor.commands();
    let sfdisk = commands.iter().find(|c| c.program == "sfdisk").unwrap();
    assert_eq!(sfdisk.stdin.as_deref(), Some(&b",,c;\n"[..]));

    let mkfs = commands.iter().find(|c| c.program == "mkfs.vfat").unwrap();
    let partition = format!("{}1", fx.device.display());
    assert_eq!(mkfs.args, vec!["-F", "32", "-n", "WINDOWS", partition.as_str()]);

    let umounts: Vec<&str> = commands
        .iter()
        .filter(|c| c.program == "umount")
        .map(|c| c.args[0].as_str())
        .collect();
    let iso = fx.config.tmp_root.join("iso");
    let usb = fx.config.tmp_root.join("usb");
    assert_eq!(
        umounts,
        vec![iso.to_str().unwrap(), usb.to_str().unwrap()]
    );
}

#[tokio::test]
async fn test_missing_device_fails_before_anything_runs() {
    let fx = Fixture::new(10);
    let out = run_pipeline(
        fx.config.clone(),
        None,
        Some(fx.image.clone()),
        fx.executor(),
        StaticTables::default(),
        true,
    )
    .await;

    assert!(matches!(out.result, Err(PipelineError::Validation(_))));
    assert_eq!(out.failure(), Some((NO_DEVICE_MESSAGE, DeviceState::Untouched)));
    assert_eq!(
        out.statuses(),
        vec!["Checking selection...", NO_DEVICE_MESSAGE]
    );
    assert_eq!(out.credentials.requests(), 0);
    assert!(out.executor.commands().is_empty());
    assert_eq!(out.states().last(), Some(&PipelineState::Failed));
}

#[tokio::test]
async fn test_missing_image_fails_before_anything_runs() {
    let fx = Fixture::new(10);
    let out = run_pipeline(
        fx.config.clone(),
        Some(fx.target()),
        None,
        fx.executor(),
        StaticTables::default(),
        true,
    )
    .await;

    assert_eq!(out.failure(), Some((NO_IMAGE_MESSAGE, DeviceState::Untouched)));
    assert_eq!(out.credentials.requests(), 0);
    assert_eq!(fs::read(&fx.device).unwrap(), vec![0xFFu8; DEVICE_LEN]);
}

#[tokio::test]
async fn test_declined_unmount_leaves_device_untouched() {
    let fx = Fixture::new(10);
    let tables = StaticTables {
        mountinfo: format!(
            "36 25 8:17 / /media/user/WINDOWS rw,nosuid,nodev shared:1 - vfat {}1 rw,fmask=0022\n",
            fx.device.display()
        ),
        loops: Vec::new(),
    };

    let out = run_pipeline(
        fx.config.clone(),
        Some(fx.target()),
        Some(fx.image.clone()),
        fx.executor(),
        tables,
        false,
    )
    .await;

    assert!(matches!(out.result, Err(PipelineError::Conflict(_))));
    assert_eq!(out.failure(), Some((CONFLICT_ABORT_MESSAGE, DeviceState::Untouched)));
    assert_eq!(out.prompt.times_asked(), 1);
    assert_eq!(out.executor.programs(), vec!["true"]);
    assert_eq!(fs::read(&fx.device).unwrap(), vec![0xFFu8; DEVICE_LEN]);
}

#[tokio::test]
async fn test_accepted_unmount_releases_conflicts_first() {
    let fx = Fixture::new(10);
    let tables = StaticTables {
        mountinfo: format!(
            "36 25 8:17 / /media/user/WINDOWS rw,nosuid,nodev shared:1 - vfat {}1 rw\n",
            fx.device.display()
        ),
        loops: Vec::new(),
    };

    let out = run_pipeline(
        fx.config.clone(),
        Some(fx.target()),
        Some(fx.image.clone()),
        fx.executor(),
        tables,
        true,
    )
    .await;

    assert!(out.result.is_ok());
    let commands = out.executor.commands();
    assert_eq!(commands[1].program, "umount");
    assert_eq!(commands[1].args, vec!["/media/user/WINDOWS"]);
    assert_eq!(commands[2].program, "chmod");
}

#[tokio::test]
async fn test_format_failure_restores_permissions_and_reports_undefined() {
    let fx = Fixture::new(10);
    let out = run_fixture(&fx, fx.executor().failing("mkfs.vfat")).await;

    assert!(matches!(out.result, Err(PipelineError::Command { .. })));
    let (message, state) = out.failure().expect("failure event");
    assert_eq!(state, DeviceState::Undefined);
    assert!(message.contains("mkfs.vfat"), "{}", message);
    assert!(message.ends_with("(device state undefined)"), "{}", message);

    let programs = out.executor.programs();
    assert_eq!(programs.last().map(String::as_str), Some("chmod"));
    assert!(!programs.iter().any(|p| p == "syslinux" || p == "mount"));
    assert_eq!(mode_of(&fx.device), DEVICE_MODE);
    assert_eq!(out.steps().last(), Some(&PrepareStep::RestorePermissions));
}

#[tokio::test]
async fn test_image_mount_failure_unwinds_partition_mount() {
    let fx = Fixture::new(10);
    let out = run_fixture(&fx, fx.executor().failing_with_arg("mount", "loop")).await;

    assert!(out.result.is_err());
    assert_eq!(out.failure().map(|f| f.1), Some(DeviceState::Undefined));

    let commands = out.executor.commands();
    let last = commands.last().unwrap();
    assert_eq!(last.program, "umount");
    assert_eq!(
        PathBuf::from(&last.args[0]),
        fx.config.tmp_root.join("usb")
    );
    assert_eq!(commands.iter().filter(|c| c.program == "umount").count(), 1);
    assert!(!fx.config.tmp_root.exists());
}

#[tokio::test]
async fn test_rejected_credentials_abort_cleanly() {
    let fx = Fixture::new(10);
    let out = run_fixture(&fx, fx.executor().rejecting_auth()).await;

    assert!(matches!(out.result, Err(PipelineError::Validation(_))));
    let (message, state) = out.failure().unwrap();
    assert!(message.starts_with("Unable to obtain root privileges"), "{}", message);
    assert_eq!(state, DeviceState::Untouched);
    assert_eq!(out.executor.programs(), vec!["true"]);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let fx = Fixture::new(10);
    let executor = Arc::new(fx.executor());
    let collaborators = Collaborators {
        credentials: Arc::new(SimulatedCredentials::new(executor.clone())),
        prompt: Arc::new(FixedPrompt::new(true)),
        tables: Arc::new(StaticTables::default()),
    };
    let ctx = RunContext::new(fx.config.clone(), Some(fx.target()), Some(fx.image.clone()));
    let (orchestrator, _rx) = Orchestrator::new(ctx, collaborators);

    orchestrator.cancellation_token().cancel();
    let result = orchestrator.spawn().await.unwrap();

    assert!(matches!(
        result,
        Err(PipelineError::Cancelled(PipelineState::Validating))
    ));
    assert!(executor.commands().is_empty());
}

#[tokio::test]
async fn test_second_run_over_same_device_succeeds() {
    let fx = Fixture::new(20);
    assert!(run_fixture(&fx, fx.executor()).await.result.is_ok());
    let second = run_fixture(&fx, fx.executor()).await;
    assert!(second.result.is_ok());
    assert_eq!(count_regular_files(&fx.store).unwrap(), 23);
}

#[tokio::test]
async fn test_populated_work_root_is_left_alone() {
    let fx = Fixture::new(10);
    fs::create_dir_all(&fx.config.tmp_root).unwrap();
    let precious = fx.config.tmp_root.join("precious.txt");
    fs::write(&precious, b"keep me").unwrap();

    let out = run_fixture(&fx, fx.executor()).await;

    assert!(matches!(out.result, Err(PipelineError::Validation(_))));
    assert_eq!(out.failure().map(|f| f.1), Some(DeviceState::Untouched));
    assert_eq!(fs::read(&precious).unwrap(), b"keep me");
    assert_eq!(out.credentials.requests(), 0);
    assert!(out.executor.commands().is_empty());
    assert_eq!(fs::read(&fx.device).unwrap(), vec![0xFFu8; DEVICE_LEN]);
}

/// Cancels the run as soon as `program` has been executed.
struct CancelAfter {
    inner: Arc<SimulatedExecutor>,
    program: &'static str,
    token: OnceLock<CancellationToken>,
}

impl PrivilegedExecutor for CancelAfter {
    fn execute(&self, command: &CommandSpec) -> std::io::Result<CommandOutput> {
        let output = self.inner.execute(command)?;
        if command.program == self.program {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
        }
        Ok(output)
    }
}

struct Handout(Arc<CancelAfter>);

impl CredentialProvider for Handout {
    fn privileged_executor(&self) -> anyhow::Result<Arc<dyn PrivilegedExecutor>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_cancel_after_preparing_skips_mounting() {
    let fx = Fixture::new(10);
    let inner = Arc::new(fx.executor());
    let executor = Arc::new(CancelAfter {
        inner: inner.clone(),
        program: "syslinux",
        token: OnceLock::new(),
    });
    let collaborators = Collaborators {
        credentials: Arc::new(Handout(executor.clone())),
        prompt: Arc::new(FixedPrompt::new(true)),
        tables: Arc::new(StaticTables::default()),
    };
    let ctx = RunContext::new(fx.config.clone(), Some(fx.target()), Some(fx.image.clone()));
    let (orchestrator, mut rx) = Orchestrator::new(ctx, collaborators);
    assert!(executor.token.set(orchestrator.cancellation_token()).is_ok());

    let result = timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("pipeline timed out");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        result,
        Err(PipelineError::Cancelled(PipelineState::Mounting))
    ));
    let failure = events.iter().find_map(|e| match e {
        PipelineEvent::Failed {
            message,
            device_state,
        } => Some((message.clone(), *device_state)),
        _ => None,
    });
    let (message, state) = failure.expect("failure event");
    assert_eq!(state, DeviceState::Undefined);
    assert!(message.ends_with("(device state undefined)"), "{}", message);

    let programs = inner.programs();
    assert_eq!(programs.last().map(String::as_str), Some("chmod"));
    assert!(!programs.iter().any(|p| p == "mount"));
    assert!(!events.contains(&PipelineEvent::State(PipelineState::Mounting)));
}
