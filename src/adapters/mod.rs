#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{
    DirectExecutor, LinuxCredentialProvider, LsblkEnumerator, ProcTables, SudoExecutor,
    TerminalPrompt, read_loop_devices,
};
pub use simulated::{
    BOOT_SIGNATURE, FixedPrompt, SimulatedCredentials, SimulatedEnumerator, SimulatedExecutor,
    StaticTables,
};
