//! Record sinks.
//!
//! Sinks receive fully rendered records and are the only part of the engine
//! that performs I/O. They are shared between worker threads and serialize
//! writes internally.

use crate::config::{FileOutputConfig, FormatType, OutputConfig, Strategy, SyslogOutputConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type for output operations.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Output closed")]
    Closed,
}

/// Where record ids should start, as seen by a freshly opened sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOrigin {
    /// Bytes already present in the destination
    pub size: u64,
    /// Time the current destination was created
    pub epoch: DateTime<Utc>,
}

impl SinkOrigin {
    pub fn now() -> Self {
        Self {
            size: 0,
            epoch: Utc::now(),
        }
    }
}

/// Trait for record destinations.
pub trait Output: Send + Sync {
    /// Write one complete record.
    fn write(&self, record: &[u8]) -> Result<(), OutputError>;

    /// Flush any buffered data.
    fn flush(&self) -> Result<(), OutputError>;

    /// Reopen the destination, e.g. after it was moved by an external
    /// rotation tool.
    fn reopen(&self) -> Result<(), OutputError> {
        self.flush()
    }

    /// Close the output. Later writes fail with [`OutputError::Closed`].
    fn close(&self) -> Result<(), OutputError>;

    /// Current destination origin. Changes when a file sink rotates.
    fn origin(&self) -> SinkOrigin;
}

/// Create the sink described by `config`.
pub fn create_output(
    config: &OutputConfig,
    format: FormatType,
) -> Result<Arc<dyn Output>, OutputError> {
    match config {
        OutputConfig::Stdout => Ok(Arc::new(StdoutOutput::new())),
        OutputConfig::File(file) => Ok(Arc::new(FileOutput::open(file, format)?)),
        OutputConfig::Syslog(syslog) => syslog_output(syslog),
    }
}

#[cfg(unix)]
fn syslog_output(config: &SyslogOutputConfig) -> Result<Arc<dyn Output>, OutputError> {
    Ok(Arc::new(SyslogOutput::new(config)?))
}

#[cfg(not(unix))]
fn syslog_output(_config: &SyslogOutputConfig) -> Result<Arc<dyn Output>, OutputError> {
    Err(OutputError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "syslog output requires a unix platform",
    )))
}

/// Stdout output.
pub struct StdoutOutput {
    origin: SinkOrigin,
    closed: AtomicBool,
}

impl StdoutOutput {
    pub fn new() -> Self {
        Self {
            origin: SinkOrigin::now(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for StdoutOutput {
    fn write(&self, record: &[u8]) -> Result<(), OutputError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }
        io::stdout().lock().write_all(record)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        io::stdout().flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn origin(&self) -> SinkOrigin {
        self.origin
    }
}

/// In-memory output that keeps every record.
pub struct MemoryOutput {
    origin: SinkOrigin,
    records: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::with_origin(SinkOrigin::now())
    }

    pub fn with_origin(origin: SinkOrigin) -> Self {
        Self {
            origin,
            records: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail with an I/O error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records written so far, lossily decoded.
    pub fn records(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }

    pub fn last(&self) -> Option<String> {
        self.records
            .lock()
            .last()
            .map(|r| String::from_utf8_lossy(r).into_owned())
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for MemoryOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for MemoryOutput {
    fn write(&self, record: &[u8]) -> Result<(), OutputError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "memory output is failing").into());
        }
        self.records.lock().push(record.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn origin(&self) -> SinkOrigin {
        self.origin
    }
}

struct OpenFile {
    writer: BufWriter<File>,
    size: u64,
    epoch: DateTime<Utc>,
}

impl OpenFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }
}

/// File output with optional size-based rotation.
///
/// The format header is written whenever an empty file is opened and the
/// footer before a file is rotated away, reopened or closed.
pub struct FileOutput {
    path: PathBuf,
    format: FormatType,
    strategy: Strategy,
    buffer_size: usize,
    rotate_on_size: u64,
    rotations: u32,
    state: Mutex<Option<OpenFile>>,
    dropped: AtomicU64,
}

impl FileOutput {
    pub fn open(config: &FileOutputConfig, format: FormatType) -> Result<Self, OutputError> {
        let output = Self {
            path: config.path.clone(),
            format,
            strategy: config.strategy,
            buffer_size: usize::try_from(config.buffer_size).unwrap_or(usize::MAX),
            rotate_on_size: config.rotate_on_size,
            rotations: config.rotations,
            state: Mutex::new(None),
            dropped: AtomicU64::new(0),
        };
        let file = output.open_file()?;
        *output.state.lock() = Some(file);
        Ok(output)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records discarded by the performance strategy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn open_file(&self) -> Result<OpenFile, OutputError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let metadata = file.metadata()?;
        let epoch = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let capacity = if self.strategy.is_buffered() {
            self.buffer_size
        } else {
            0
        };
        let mut open = OpenFile {
            writer: BufWriter::with_capacity(capacity, file),
            size: metadata.len(),
            epoch,
        };

        if open.size == 0 {
            open.append(self.format.header().as_bytes())?;
            open.writer.flush()?;
        }

        debug!(path = %self.path.display(), size = open.size, "Opened audit log file");
        Ok(open)
    }

    fn finish(&self, open: &mut OpenFile) -> io::Result<()> {
        open.append(self.format.footer().as_bytes())?;
        open.writer.flush()?;
        if self.strategy.sync_on_write() {
            open.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn needs_rotation(&self, open: &OpenFile, incoming: usize) -> bool {
        let header = self.format.header().len() as u64;
        self.rotate_on_size > 0
            && open.size > header
            && open.size + incoming as u64 > self.rotate_on_size
    }

    fn rotate(&self, open: &mut OpenFile) -> Result<(), OutputError> {
        self.finish(open)?;

        let keep = self.rotations.max(1);
        let oldest = self.rotated_path(keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for i in (1..keep).rev() {
            let from = self.rotated_path(i);
            if from.exists() {
                fs::rename(&from, self.rotated_path(i + 1))?;
            }
        }
        fs::rename(&self.path, self.rotated_path(1))?;

        *open = self.open_file()?;
        debug!(path = %self.path.display(), keep, "Rotated audit log file");
        Ok(())
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(format!(".{}", index));
        PathBuf::from(path)
    }

    fn write_record(&self, open: &mut OpenFile, record: &[u8]) -> Result<(), OutputError> {
        if self.needs_rotation(open, record.len()) {
            self.rotate(open)?;
        }

        open.append(record)?;
        if !self.strategy.is_buffered() {
            open.writer.flush()?;
        }
        if self.strategy.sync_on_write() {
            open.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Output for FileOutput {
    fn write(&self, record: &[u8]) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        let open = state.as_mut().ok_or(OutputError::Closed)?;

        match self.write_record(open, record) {
            Err(OutputError::Io(e)) if self.strategy.can_drop_data() => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(path = %self.path.display(), error = %e, "Dropped audit record");
                Ok(())
            }
            result => result,
        }
    }

    fn flush(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        let open = state.as_mut().ok_or(OutputError::Closed)?;
        open.writer.flush()?;
        Ok(())
    }

    fn reopen(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        if let Some(open) = state.as_mut() {
            self.finish(open)?;
        }
        *state = Some(self.open_file()?);
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        match state.take() {
            Some(mut open) => {
                self.finish(&mut open)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn origin(&self) -> SinkOrigin {
        match self.state.lock().as_ref() {
            Some(open) => SinkOrigin {
                size: open.size,
                epoch: open.epoch,
            },
            None => SinkOrigin::now(),
        }
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        if let Some(open) = self.state.get_mut().as_mut() {
            let _ = open.writer.flush();
        }
    }
}

/// Default local syslog socket.
#[cfg(unix)]
pub const SYSLOG_SOCKET: &str = "/dev/log";

/// Local syslog output over a unix datagram socket.
#[cfg(unix)]
pub struct SyslogOutput {
    socket: std::os::unix::net::UnixDatagram,
    target: PathBuf,
    ident: String,
    priority: u8,
    origin: SinkOrigin,
    closed: AtomicBool,
}

#[cfg(unix)]
impl SyslogOutput {
    pub fn new(config: &SyslogOutputConfig) -> Result<Self, OutputError> {
        Self::with_socket(config, SYSLOG_SOCKET)
    }

    /// Send to a socket other than `/dev/log`.
    pub fn with_socket(
        config: &SyslogOutputConfig,
        target: impl Into<PathBuf>,
    ) -> Result<Self, OutputError> {
        Ok(Self {
            socket: std::os::unix::net::UnixDatagram::unbound()?,
            target: target.into(),
            ident: config.ident.clone(),
            // Priority = facility * 8 + severity
            priority: config.facility.code() * 8 + config.priority.code(),
            origin: SinkOrigin::now(),
            closed: AtomicBool::new(false),
        })
    }

    /// Frame a record as `<PRI>ident: message`.
    fn format_syslog(&self, record: &[u8]) -> Vec<u8> {
        let message = record.strip_suffix(b"\n").unwrap_or(record);
        let prefix = format!("<{}>{}: ", self.priority, self.ident);
        let mut datagram = Vec::with_capacity(prefix.len() + message.len());
        datagram.extend_from_slice(prefix.as_bytes());
        datagram.extend_from_slice(message);
        datagram
    }
}

#[cfg(unix)]
impl Output for SyslogOutput {
    fn write(&self, record: &[u8]) -> Result<(), OutputError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }
        self.socket.send_to(&self.format_syslog(record), &self.target)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn origin(&self) -> SinkOrigin {
        self.origin
    }
}
