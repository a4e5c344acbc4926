//! File logging for a short-lived plugin process.
//!
//! The runtime owns stdout (result JSON) and stderr, so log lines go to a
//! file. Rotation happens once at startup: the plugin lives for one
//! command, there is no long-running writer to rotate under.

use crate::config::LogOptions;
use crate::utils::constants::PLUGIN_NAME;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const MIB: u64 = 1024 * 1024;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn rotated(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Shift `path` to `path.1`, `path.1` to `path.2` and so on once it exceeds
/// `max_size_mib`, keeping at most `max_count` rotated files, then drop
/// rotated files older than `max_age_days`.
pub fn rotate(path: &Path, max_size_mib: u64, max_count: u32, max_age_days: u64) -> std::io::Result<()> {
    let oversized = match fs::metadata(path) {
        Ok(meta) => meta.len() >= max_size_mib.saturating_mul(MIB),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    if oversized {
        if max_count == 0 {
            fs::remove_file(path)?;
        } else {
            let _ = fs::remove_file(rotated(path, max_count));
            for n in (1..max_count).rev() {
                let from = rotated(path, n);
                if from.exists() {
                    fs::rename(&from, rotated(path, n + 1))?;
                }
            }
            fs::rename(path, rotated(path, 1))?;
        }
    }

    let max_age = DAY.saturating_mul(u32::try_from(max_age_days).unwrap_or(u32::MAX));
    let now = SystemTime::now();
    for n in 1..=max_count {
        let file = rotated(path, n);
        let expired = fs::metadata(&file)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map_or(false, |age| age > max_age);
        if expired {
            let _ = fs::remove_file(&file);
        }
    }
    Ok(())
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. Falls back to stderr when the log file
/// cannot be prepared so a broken log directory never fails the command.
pub fn init(opts: &LogOptions) {
    let filter = EnvFilter::try_new(&opts.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let path = Path::new(&opts.log_file_path);

    if let Err(e) = rotate(
        path,
        opts.log_file_max_size,
        opts.log_file_max_count,
        opts.log_file_max_age,
    ) {
        eprintln!("{}: log rotation for {} failed: {}", PLUGIN_NAME, path.display(), e);
    }

    let installed = match open_log(path) {
        Ok(file) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
            .try_init(),
        Err(e) => {
            eprintln!("{}: cannot open log file {}: {}", PLUGIN_NAME, path.display(), e);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
                .try_init()
        }
    };
    if let Err(e) = installed {
        eprintln!("{}: logger already initialised: {}", PLUGIN_NAME, e);
    }
}
