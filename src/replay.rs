//! Owned event descriptions for replaying captured traffic.
//!
//! One JSON object per line:
//!
//! ```json
//! {"session":1,"event":{"class":"connection","user":"alice","host":"localhost"}}
//! {"session":1,"event":{"class":"general","sql_command":"select","query":"SELECT 1"}}
//! ```

use crate::charset::charset_for_name;
use crate::error::AuditError;
use crate::event::{AuditEvent, ConnectionEvent, ConnectionSubclass, GeneralEvent, GeneralSubclass};
use crate::record_id::Timestamp;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};

/// One replayed event and the session that raised it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub session: SessionId,
    pub event: ReplayPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum ReplayPayload {
    General(ReplayGeneral),
    Connection(ReplayConnection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayGeneral {
    pub subclass: GeneralSubclass,
    pub error_code: i32,
    /// Defaults to the session id
    pub thread_id: Option<u64>,
    /// Unix seconds; the replay time when absent
    pub time: Option<i64>,
    pub user: String,
    pub command: String,
    pub query: String,
    /// Raw statement bytes in `charset`, used instead of `query` when set
    pub query_bytes: Option<Vec<u8>>,
    pub charset: String,
    pub sql_command: String,
    pub host: String,
    pub external_user: String,
    pub ip: String,
}

impl Default for ReplayGeneral {
    fn default() -> Self {
        Self {
            subclass: GeneralSubclass::Status,
            error_code: 0,
            thread_id: None,
            time: None,
            user: String::new(),
            command: "Query".to_string(),
            query: String::new(),
            query_bytes: None,
            charset: "utf8mb4".to_string(),
            sql_command: String::new(),
            host: String::new(),
            external_user: String::new(),
            ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConnection {
    pub subclass: ConnectionSubclass,
    pub status: i32,
    pub thread_id: Option<u64>,
    pub user: String,
    /// Defaults to `user`
    pub priv_user: Option<String>,
    pub external_user: String,
    pub proxy_user: String,
    pub host: String,
    pub ip: String,
    pub database: String,
}

impl ReplayEvent {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }

    /// Borrow as an engine event.
    pub fn as_event(&self) -> Result<AuditEvent<'_>, AuditError> {
        let thread_id = |explicit: Option<u64>| explicit.unwrap_or(self.session.0);

        match &self.event {
            ReplayPayload::General(g) => {
                let charset = charset_for_name(&g.charset)
                    .ok_or_else(|| AuditError::UnknownCharset(g.charset.clone()))?;
                Ok(GeneralEvent {
                    subclass: g.subclass,
                    error_code: g.error_code,
                    thread_id: thread_id(g.thread_id),
                    time: g.time.map(Timestamp::from_secs).unwrap_or_else(Timestamp::now),
                    user: &g.user,
                    command: &g.command,
                    query: g.query_bytes.as_deref().unwrap_or(g.query.as_bytes()),
                    charset,
                    sql_command: &g.sql_command,
                    host: &g.host,
                    external_user: &g.external_user,
                    ip: &g.ip,
                }
                .into())
            }
            ReplayPayload::Connection(c) => Ok(ConnectionEvent {
                subclass: c.subclass,
                status: c.status,
                thread_id: thread_id(c.thread_id),
                user: &c.user,
                priv_user: c.priv_user.as_deref().unwrap_or(&c.user),
                external_user: &c.external_user,
                proxy_user: &c.proxy_user,
                host: &c.host,
                ip: &c.ip,
                database: &c.database,
            }
            .into()),
        }
    }

    /// Whether the session is over after this event.
    pub fn ends_session(&self) -> bool {
        matches!(
            &self.event,
            ReplayPayload::Connection(ReplayConnection {
                subclass: ConnectionSubclass::Disconnect,
                ..
            })
        )
    }
}
