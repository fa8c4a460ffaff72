//! Database Audit Log
//!
//! Audit log record encoding and event filtering for a database server.
//! Renders connection and statement events as legacy XML, XML, JSON or CSV
//! records, tracks per-session state and writes to file, syslog or custom
//! sinks.

pub mod buffer;
pub mod charset;
pub mod config;
pub mod error;
pub mod escape;
pub mod event;
pub mod filter;
mod format;
pub mod logger;
pub mod output;
pub mod record;
pub mod record_id;
pub mod replay;
pub mod session;
pub mod statement;

pub use config::{AuditLogConfig, FormatType, OutputConfig};
pub use error::AuditError;
pub use event::{
    AuditEvent, ConnectionEvent, ConnectionSubclass, EventClass, GeneralEvent, GeneralSubclass,
};
pub use filter::{AccountFilter, Policy};
pub use logger::{AuditLogger, EngineStats, Outcome, Settings};
pub use output::{create_output, MemoryOutput, Output, OutputError, SinkOrigin};
pub use record::{RecordBuilder, Rendered, RequiredSize, Written};
pub use record_id::{RecordId, RecordIdGenerator, Timestamp};
pub use replay::ReplayEvent;
pub use session::SessionId;
