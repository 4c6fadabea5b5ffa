//! Recursive copy of the staged image tree onto the mounted partition.
//!
//! Copies are resilient to the quirks of the target filesystem: permission and
//! timestamp preservation are best effort (vfat stores neither faithfully), and
//! existing destination files are overwritten so a re-run converges on the
//! same tree.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Per-file errors listed in the final report before truncating.
const MAX_REPORTED_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub files_copied: u64,
    pub bytes_copied: u64,
}

/// Result of scanning a directory
#[derive(Debug, Default)]
pub(crate) struct ScanResult {
    /// All regular files found, parents visited before children
    pub files: Vec<FileInfo>,
    /// All directories found, in creation order (parents before children)
    pub directories: Vec<PathBuf>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
}

/// Copy every regular file and directory under `source` into `destination`.
///
/// `on_status` is called once per top-level entry of `source`, just before the
/// first file under it is copied.
pub fn copy_tree(
    source: &Path,
    destination: &Path,
    options: CopyOptions,
    on_status: &mut dyn FnMut(String),
) -> PipelineResult<CopyResult> {
    info!(
        source = %source.display(),
        destination = %destination.display(),
        "Starting tree copy"
    );
    let start_time = Instant::now();

    let scan = scan_directory(source)?;
    debug!(
        total_files = scan.files.len(),
        total_bytes = scan.total_bytes,
        total_dirs = scan.directories.len(),
        "Scan complete"
    );

    fs::create_dir_all(destination)
        .map_err(|e| PipelineError::io("create directory", destination, e))?;
    create_directory_structure(source, destination, &scan.directories)?;

    let mut bytes_copied: u64 = 0;
    let mut files_copied: u64 = 0;
    let mut errors: Vec<CopyError> = Vec::new();
    let mut current_top: Option<OsString> = None;

    for file_info in &scan.files {
        let relative = relative_to(&file_info.path, source)?;
        let top = relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_os_string());
        if top.is_some() && top != current_top {
            if let Some(name) = &top {
                on_status(format!("Copying {}...", name.to_string_lossy()));
            }
            current_top = top;
        }

        let dest_path = destination.join(relative);
        debug!(file = %relative.display(), size = file_info.size, "Copying file");

        match copy_single_file(&file_info.path, &dest_path, options.sync_files) {
            Ok(file_bytes) => {
                bytes_copied += file_bytes;
                files_copied += 1;
            }
            Err(e) if e.is_device_removed => {
                return Err(PipelineError::io(
                    "copy (device removed)",
                    &dest_path,
                    io::Error::other(e.message),
                ));
            }
            Err(e) => {
                error!(file = %relative.display(), error = %e.message, "Failed to copy file");
                errors.push(CopyError {
                    file: relative.display().to_string(),
                    message: e.message,
                });
            }
        }
    }

    if !errors.is_empty() {
        let mut summary = format!(
            "copy completed with {} error(s):\n{}",
            errors.len(),
            errors
                .iter()
                .take(MAX_REPORTED_ERRORS)
                .map(|e| format!("  - {}: {}", e.file, e.message))
                .collect::<Vec<_>>()
                .join("\n")
        );
        if errors.len() > MAX_REPORTED_ERRORS {
            summary.push_str(&format!(
                "\n  ... and {} more errors",
                errors.len() - MAX_REPORTED_ERRORS
            ));
        }
        return Err(PipelineError::io(
            "copy into",
            destination,
            io::Error::other(summary),
        ));
    }

    info!(
        files = files_copied,
        total_bytes = bytes_copied,
        duration_secs = start_time.elapsed().as_secs(),
        "Tree copy complete"
    );

    Ok(CopyResult {
        files_copied,
        bytes_copied,
    })
}

fn relative_to<'p>(path: &'p Path, base: &Path) -> PipelineResult<&'p Path> {
    path.strip_prefix(base).map_err(|_| {
        PipelineError::io(
            "resolve",
            path,
            io::Error::other(format!("not under {}", base.display())),
        )
    })
}

/// Scan a directory recursively, collecting files and directories.
pub(crate) fn scan_directory(source: &Path) -> PipelineResult<ScanResult> {
    let mut result = ScanResult::default();
    scan_directory_recursive(source, &mut result)?;
    Ok(result)
}

fn scan_directory_recursive(current: &Path, result: &mut ScanResult) -> PipelineResult<()> {
    let mut entries = fs::read_dir(current)
        .map_err(|e| PipelineError::io("read directory", current, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| PipelineError::io("read directory", current, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                if is_device_removed_error(&e) {
                    return Err(PipelineError::io("stat", &path, e));
                }
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            result.directories.push(path.clone());
            scan_directory_recursive(&path, result)?;
        } else if metadata.is_file() {
            result.total_bytes += metadata.len();
            result.files.push(FileInfo {
                path,
                size: metadata.len(),
            });
        } else {
            debug!(path = %path.display(), "Skipping symlink or special file");
        }
    }

    Ok(())
}

/// Create all directories in the destination, preserving structure
fn create_directory_structure(
    source: &Path,
    destination: &Path,
    directories: &[PathBuf],
) -> PipelineResult<()> {
    for dir_path in directories {
        let dest_dir = destination.join(relative_to(dir_path, source)?);

        fs::create_dir_all(&dest_dir)
            .map_err(|e| PipelineError::io("create directory", &dest_dir, e))?;

        if let Ok(metadata) = fs::metadata(dir_path) {
            if let Err(e) = fs::set_permissions(&dest_dir, metadata.permissions()) {
                debug!(
                    path = %dest_dir.display(),
                    error = %e,
                    "Failed to set directory permissions"
                );
            }
        }
    }
    Ok(())
}

/// Error information from a file copy operation
struct FileCopyError {
    message: String,
    is_device_removed: bool,
}

impl FileCopyError {
    fn new(context: &str, e: &io::Error) -> Self {
        Self {
            message: format!("{}: {}", context, e),
            is_device_removed: is_device_removed_error(e),
        }
    }
}

struct CopyError {
    file: String,
    message: String,
}

/// Copy a single file, truncating any existing destination file.
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, FileCopyError> {
    let source_metadata =
        fs::metadata(source).map_err(|e| FileCopyError::new("Failed to read source metadata", &e))?;

    let source_file =
        File::open(source).map_err(|e| FileCopyError::new("Failed to open source file", &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(dest)
        .map_err(|e| FileCopyError::new("Failed to create destination file", &e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| FileCopyError::new("Failed to read from source", &e))?;

        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| FileCopyError::new("Failed to write to destination", &e))?;

        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| FileCopyError::new("Failed to flush destination file", &e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| FileCopyError::new("Failed to get inner file handle", e.error()))?;

        inner
            .sync_all()
            .map_err(|e| FileCopyError::new("Failed to sync file", &e))?;
    }

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(bytes_written)
}

/// Check if an I/O error indicates the device has been removed
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected => true,
        _ => error.raw_os_error().is_some_and(|os_error| {
            matches!(
                os_error,
                libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE
            )
        }),
    }
}
