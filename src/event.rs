//! Events raised by the host server.
//!
//! Events are borrowed views; the engine never keeps one past the call
//! that delivered it.

use crate::record_id::Timestamp;
use encoding_rs::{Encoding, UTF_8};
use serde::{Deserialize, Serialize};

/// Event class, used by the policy mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    General,
    Connection,
}

impl EventClass {
    /// Bit of this class in a policy mask.
    pub const fn mask(self) -> u8 {
        match self {
            Self::General => 1 << 0,
            Self::Connection => 1 << 1,
        }
    }
}

/// Statement-level sub-events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneralSubclass {
    /// Raised before the statement runs
    Log,
    Error,
    Result,
    /// Raised after the statement completes
    #[default]
    Status,
}

/// A statement or command event.
#[derive(Debug, Clone, Copy)]
pub struct GeneralEvent<'a> {
    pub subclass: GeneralSubclass,
    pub error_code: i32,
    pub thread_id: u64,
    pub time: Timestamp,
    /// Full account description as reported by the server
    pub user: &'a str,
    /// Command name such as `Query`, `Init DB`, `Quit`
    pub command: &'a str,
    /// Statement text in `charset`
    pub query: &'a [u8],
    pub charset: &'static Encoding,
    /// SQL command class such as `select`, `change_db`
    pub sql_command: &'a str,
    pub host: &'a str,
    pub external_user: &'a str,
    pub ip: &'a str,
}

impl<'a> GeneralEvent<'a> {
    /// A UTF-8 `Query` status event with empty account fields.
    pub fn query(thread_id: u64, sql_command: &'a str, query: &'a str) -> Self {
        Self {
            subclass: GeneralSubclass::Status,
            error_code: 0,
            thread_id,
            time: Timestamp::now(),
            user: "",
            command: "Query",
            query: query.as_bytes(),
            charset: UTF_8,
            sql_command,
            host: "",
            external_user: "",
            ip: "",
        }
    }

    pub fn command_is(&self, name: &str) -> bool {
        self.command == name
    }
}

/// Connection lifecycle sub-events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSubclass {
    #[default]
    Connect,
    Disconnect,
    ChangeUser,
}

impl ConnectionSubclass {
    /// Record name used for this sub-event.
    pub fn record_name(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Quit",
            Self::ChangeUser => "Change user",
        }
    }
}

/// A connection event.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionEvent<'a> {
    pub subclass: ConnectionSubclass,
    /// Zero when the connection (or user change) succeeded
    pub status: i32,
    pub thread_id: u64,
    pub user: &'a str,
    pub priv_user: &'a str,
    pub external_user: &'a str,
    pub proxy_user: &'a str,
    pub host: &'a str,
    pub ip: &'a str,
    pub database: &'a str,
}

impl<'a> ConnectionEvent<'a> {
    /// A successful connect with empty optional fields.
    pub fn connect(thread_id: u64, user: &'a str, host: &'a str, database: &'a str) -> Self {
        Self {
            subclass: ConnectionSubclass::Connect,
            status: 0,
            thread_id,
            user,
            priv_user: user,
            external_user: "",
            proxy_user: "",
            host,
            ip: "",
            database,
        }
    }
}

/// Any event the engine handles.
#[derive(Debug, Clone, Copy)]
pub enum AuditEvent<'a> {
    General(GeneralEvent<'a>),
    Connection(ConnectionEvent<'a>),
}

impl AuditEvent<'_> {
    pub fn class(&self) -> EventClass {
        match self {
            Self::General(_) => EventClass::General,
            Self::Connection(_) => EventClass::Connection,
        }
    }

    pub fn thread_id(&self) -> u64 {
        match self {
            Self::General(e) => e.thread_id,
            Self::Connection(e) => e.thread_id,
        }
    }
}

impl<'a> From<GeneralEvent<'a>> for AuditEvent<'a> {
    fn from(event: GeneralEvent<'a>) -> Self {
        Self::General(event)
    }
}

impl<'a> From<ConnectionEvent<'a>> for AuditEvent<'a> {
    fn from(event: ConnectionEvent<'a>) -> Self {
        Self::Connection(event)
    }
}
