//! Configuration types for the audit log engine.

use crate::error::AuditError;
use crate::filter::Policy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted write buffer for buffered file strategies.
pub const MIN_BUFFER_SIZE: u64 = 4096;

/// Largest accepted number of kept rotations.
pub const MAX_ROTATIONS: u32 = 999;

/// Main configuration for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLogConfig {
    /// Event classes to log
    pub policy: Policy,
    /// Record format, fixed for the engine lifetime
    pub format: FormatType,
    /// Server version reported in lifecycle records
    pub server_version: String,
    /// Comma separated `user@host` list; only these accounts are logged
    pub include_accounts: String,
    /// Comma separated `user@host` list; these accounts are not logged
    pub exclude_accounts: String,
    /// Record destination
    pub output: OutputConfig,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            policy: Policy::All,
            format: FormatType::Old,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            include_accounts: String::new(),
            exclude_accounts: String::new(),
            output: OutputConfig::File(FileOutputConfig::default()),
        }
    }
}

impl AuditLogConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AuditError> {
        if !self.include_accounts.trim().is_empty() && !self.exclude_accounts.trim().is_empty() {
            return Err(AuditError::ConflictingAccountFilter {
                requested: "include_accounts",
                active: "exclude_accounts",
            });
        }

        if let OutputConfig::File(file) = &self.output {
            if file.path.as_os_str().is_empty() {
                return Err(AuditError::InvalidConfig("output path is empty".to_string()));
            }
            if file.buffer_size < MIN_BUFFER_SIZE {
                return Err(AuditError::InvalidConfig(format!(
                    "buffer_size must be at least {}",
                    MIN_BUFFER_SIZE
                )));
            }
            if file.rotations > MAX_ROTATIONS {
                return Err(AuditError::InvalidConfig(format!(
                    "rotations must not exceed {}",
                    MAX_ROTATIONS
                )));
            }
        }

        Ok(())
    }
}

/// Record formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    /// Legacy XML, fields as attributes
    Old,
    /// XML, fields as child elements
    New,
    /// One JSON object per line
    Json,
    /// Comma separated, double-quoted values
    Csv,
}

/// Record destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    /// Write to stdout
    Stdout,
    /// Append to a file
    File(FileOutputConfig),
    /// Send to the local syslog daemon
    Syslog(SyslogOutputConfig),
}

/// File sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutputConfig {
    pub path: PathBuf,
    pub strategy: Strategy,
    /// Write buffer size for buffered strategies (bytes)
    pub buffer_size: u64,
    /// Rotate once the file would grow past this size; 0 disables rotation
    pub rotate_on_size: u64,
    /// Rotated files to keep
    pub rotations: u32,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit.log"),
            strategy: Strategy::Asynchronous,
            buffer_size: 1_048_576,
            rotate_on_size: 0,
            rotations: 0,
        }
    }
}

/// How the file sink commits writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Buffered; writers wait for buffer space
    Asynchronous,
    /// Buffered; records may be dropped under backpressure
    Performance,
    /// Unbuffered writes
    Semisynchronous,
    /// Unbuffered writes, synced to disk after each record
    Synchronous,
}

impl Strategy {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Asynchronous | Self::Performance)
    }

    pub fn sync_on_write(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    pub fn can_drop_data(&self) -> bool {
        matches!(self, Self::Performance)
    }
}

/// Syslog sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogOutputConfig {
    /// Tag prepended to every message
    pub ident: String,
    pub facility: SyslogFacility,
    pub priority: SyslogPriority,
}

impl Default for SyslogOutputConfig {
    fn default() -> Self {
        Self {
            ident: "percona-audit".to_string(),
            facility: SyslogFacility::User,
            priority: SyslogPriority::Info,
        }
    }
}

/// Syslog facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogFacility {
    Kern,
    User,
    Mail,
    Daemon,
    Auth,
    Syslog,
    Lpr,
    News,
    Uucp,
    Cron,
    Authpriv,
    Ftp,
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl SyslogFacility {
    pub fn code(&self) -> u8 {
        match self {
            Self::Kern => 0,
            Self::User => 1,
            Self::Mail => 2,
            Self::Daemon => 3,
            Self::Auth => 4,
            Self::Syslog => 5,
            Self::Lpr => 6,
            Self::News => 7,
            Self::Uucp => 8,
            Self::Cron => 9,
            Self::Authpriv => 10,
            Self::Ftp => 11,
            Self::Local0 => 16,
            Self::Local1 => 17,
            Self::Local2 => 18,
            Self::Local3 => 19,
            Self::Local4 => 20,
            Self::Local5 => 21,
            Self::Local6 => 22,
            Self::Local7 => 23,
        }
    }
}

/// Syslog severity assigned to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogPriority {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl SyslogPriority {
    pub fn code(&self) -> u8 {
        match self {
            Self::Emerg => 0,
            Self::Alert => 1,
            Self::Crit => 2,
            Self::Err => 3,
            Self::Warning => 4,
            Self::Notice => 5,
            Self::Info => 6,
            Self::Debug => 7,
        }
    }
}
