//! Logging setup: size-capped file output with SIGHUP rotation, optional
//! console mirror, level from config with `RUST_LOG` override.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::infrastructure::config::LoggerConfig;

// The non-blocking writer thread lives as long as its guard does.
static LOG_GUARDS: Lazy<Mutex<Vec<non_blocking::WorkerGuard>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

static ACTIVE_WRITER: Lazy<Mutex<Option<RotatingWriter>>> = Lazy::new(|| Mutex::new(None));

/// Append-mode log file that rotates itself once `max_bytes` is exceeded and
/// on demand (SIGHUP). Rotation renames the file with a UTC stamp and prunes
/// the oldest backups beyond `max_backups`.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<WriterInner>>,
}

struct WriterInner {
    file: File,
    path: PathBuf,
    written: u64,
    max_bytes: u64,
    max_backups: usize,
}

impl RotatingWriter {
    pub fn open(path: PathBuf, max_megabytes: u64, max_backups: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Mutex::new(WriterInner {
                file,
                path,
                written,
                max_bytes: max_megabytes.saturating_mul(1024 * 1024),
                max_backups,
            })),
        })
    }

    /// Rename the current file aside and reopen a fresh one.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rotate()
    }
}

impl WriterInner {
    fn rotate(&mut self) -> Result<()> {
        self.file.flush().ok();
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spider".to_string());
        let stamped = self
            .path
            .with_file_name(format!("{}.{}.log", stem, Utc::now().format("%Y%m%dT%H%M%S")));
        if self.path.exists() {
            fs::rename(&self.path, &stamped)
                .with_context(|| format!("rotate log file to {}", stamped.display()))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen log file {}", self.path.display()))?;
        self.written = 0;
        self.prune_backups(&stem);
        Ok(())
    }

    fn prune_backups(&self, stem: &str) {
        let Some(dir) = self.path.parent() else { return };
        if self.max_backups == 0 {
            return;
        }
        let prefix = format!("{stem}.");
        let active = self.path.file_name().map(|n| n.to_os_string());
        let Ok(entries) = fs::read_dir(dir) else { return };
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| Some(p.file_name().unwrap_or_default().to_os_string()) != active)
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        // UTC stamps sort lexicographically; oldest first.
        backups.sort();
        while backups.len() > self.max_backups {
            let oldest = backups.remove(0);
            fs::remove_file(&oldest).ok();
        }
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.max_bytes > 0 && inner.written + buf.len() as u64 > inner.max_bytes {
            inner
                .rotate()
                .map_err(|err| std::io::Error::other(err.to_string()))?;
        }
        let n = inner.file.write(buf)?;
        inner.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file.flush()
    }
}

/// Install the global subscriber. Called once at startup, before any
/// component loads.
pub fn init(config: &LoggerConfig) -> Result<()> {
    let writer = RotatingWriter::open(
        config.file.path.clone(),
        config.file.max_log_file_size,
        config.file.max_log_file_count,
    )?;
    let (file_writer, guard) = non_blocking(writer.clone());
    LOG_GUARDS.lock().unwrap_or_else(|e| e.into_inner()).push(guard);
    *ACTIVE_WRITER.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);
    let subscriber = Registry::default().with(filter).with(file_layer);
    if config.console {
        subscriber.with(fmt::layer().with_writer(std::io::stdout)).init();
    } else {
        subscriber.init();
    }
    info!(file = %config.file.path.display(), level = %config.level, "logger initialized");
    Ok(())
}

/// Rotate the active log file; wired to SIGHUP by the application shell.
pub fn rotate() {
    let writer = ACTIVE_WRITER.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(writer) = writer {
        if let Err(err) = writer.rotate() {
            eprintln!("log rotation failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_stamps_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spider.log");
        let mut writer = RotatingWriter::open(path.clone(), 0, 5).unwrap();
        writer.write_all(b"before rotation\n").unwrap();
        writer.flush().unwrap();
        writer.rotate().unwrap();
        writer.write_all(b"after rotation\n").unwrap();
        writer.flush().unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"spider.log".to_string()));
        assert!(names.iter().any(|n| n.starts_with("spider.") && n != "spider.log"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "after rotation\n");
    }

    #[test]
    fn size_cap_triggers_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spider.log");
        let mut writer = RotatingWriter::open(path.clone(), 1, 5).unwrap();
        {
            let mut inner = writer.inner.lock().unwrap();
            inner.max_bytes = 8;
        }
        writer.write_all(b"0123456\n").unwrap();
        writer.write_all(b"x\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x\n");
    }

    #[test]
    fn prune_keeps_newest_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spider.log");
        for stamp in ["20240101T000000", "20240102T000000", "20240103T000000"] {
            fs::write(dir.path().join(format!("spider.{stamp}.log")), "old").unwrap();
        }
        let writer = RotatingWriter::open(path, 0, 2).unwrap();
        {
            let inner = writer.inner.lock().unwrap();
            inner.prune_backups("spider");
        }
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "spider.log")
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["spider.20240102T000000.log", "spider.20240103T000000.log"]
        );
    }
}
