//! Logging setup: tracing to stdout with env-filter, plus size-rotated file
//! streams under `logs/`. One dedicated file collects future-timestamp
//! rejections so broken-RTC nodes can be audited without grepping the main
//! stream. File writes happen on a logger task, never on the correlator.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::guard::FutureTimestampEvent;

/// Console plus a size-rotated file under `logs/`, both behind the same
/// env filter.
pub fn init(cfg: &Config) {
    let default_filter = if cfg.debug {
        "wesense_mesh_ingest=debug,rumqttc=warn".to_string()
    } else {
        format!("wesense_mesh_ingest={},rumqttc=warn", cfg.log_level)
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let file_writer = RotatingWriter::new(SizeRotatingLog::new(
        cfg.log_dir.join("ingester.log"),
        cfg.log_max_bytes,
        cfg.log_backup_count,
    ));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
}

/// Append-only log file with size-based rotation: when the active file
/// exceeds `max_bytes` it is renamed to `<name>.1` (shifting older backups
/// up to `backup_count`) and a fresh file is started.
pub struct SizeRotatingLog {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    file: Option<File>,
    written: u64,
}

impl SizeRotatingLog {
    pub fn new(path: PathBuf, max_bytes: u64, backup_count: usize) -> Self {
        Self { path, max_bytes, backup_count, file: None, written: 0 }
    }

    pub fn append(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_bytes(&buf)
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let file = self.file.as_mut().expect("log file open");
        file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn open(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        for i in (1..self.backup_count).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                fs::rename(&from, self.backup_path(i + 1))?;
            }
        }
        if self.backup_count > 0 && self.path.exists() {
            fs::rename(&self.path, self.backup_path(1))?;
        } else if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.written = 0;
        self.open()
    }

    fn backup_path(&self, i: usize) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(format!(".{i}"));
        PathBuf::from(s)
    }
}

/// `MakeWriter` adapter so a tracing layer can share a rotating file. The
/// lock is held per write, never across rotation boundaries visible to
/// callers.
#[derive(Clone)]
pub struct RotatingWriter(Arc<Mutex<SizeRotatingLog>>);

impl RotatingWriter {
    pub fn new(log: SizeRotatingLog) -> Self {
        Self(Arc::new(Mutex::new(log)))
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut log = self.0.lock().expect("log writer poisoned");
        log.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Consumes timestamp-guard rejections and appends them to the dedicated
/// stream. Ends when all guard senders are dropped.
pub async fn run_future_timestamp_log(
    mut rx: mpsc::Receiver<FutureTimestampEvent>,
    mut log: SizeRotatingLog,
) {
    while let Some(ev) = rx.recv().await {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = log.append(&ev.log_line(now)) {
            warn!(error = %e, "future_timestamp_log_write_failed");
        }
    }
}
