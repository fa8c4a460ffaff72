//! Per-session state.
//!
//! Each session is driven by one server worker thread at a time; the
//! registry only hands out exclusive access to one entry.

use crate::buffer::ScratchBuffer;
use crate::charset::{decode_identifier, truncate_on_char_boundary};
use crate::event::{AuditEvent, ConnectionEvent, GeneralEvent, GeneralSubclass};
use crate::filter::AccountFilter;
use crate::statement::use_database;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum stored database name length in bytes.
pub const NAME_LEN: usize = 192;

/// Host-supplied opaque session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    db: String,
    skip_logging: bool,
    scratch: ScratchBuffer,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current default database, empty when none is known.
    pub fn database(&self) -> &str {
        &self.db
    }

    /// Whether the account filter suppressed this session at its last
    /// connection event.
    pub fn skip_logging(&self) -> bool {
        self.skip_logging
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut ScratchBuffer {
        &mut self.scratch
    }

    /// Split borrow for rendering: the database and the scratch buffer.
    pub(crate) fn render_parts(&mut self) -> (&str, &mut ScratchBuffer) {
        (&self.db, &mut self.scratch)
    }

    /// Fold an event into the session before any policy check.
    pub fn update(&mut self, event: &AuditEvent<'_>, filter: &AccountFilter) {
        match event {
            AuditEvent::Connection(e) => self.on_connection(e, filter),
            AuditEvent::General(e) => self.on_general(e),
        }
    }

    fn on_connection(&mut self, event: &ConnectionEvent<'_>, filter: &AccountFilter) {
        self.skip_logging = !filter.allows(event.user, event.host);
        if event.status == 0 {
            self.set_database(event.database.to_string());
        }
    }

    fn on_general(&mut self, event: &GeneralEvent<'_>) {
        // The status event for Init DB does not carry the name, so take it
        // from the log event that precedes the change.
        if event.subclass == GeneralSubclass::Log
            && event.command_is("Init DB")
            && !event.query.iter().any(|b| matches!(b, b'\n' | b'\r' | b'\t' | b' '))
        {
            self.set_database(decode_identifier(event.charset, event.query));
        }

        if event.subclass == GeneralSubclass::Status
            && event.sql_command == "change_db"
            && event.command_is("Query")
            && event.error_code == 0
        {
            if let Some(name) = use_database(event.query) {
                self.set_database(decode_identifier(event.charset, name));
            }
        }
    }

    fn set_database(&mut self, mut db: String) {
        truncate_on_char_boundary(&mut db, NAME_LEN);
        self.db = db;
    }
}

/// Live sessions keyed by [`SessionId`].
///
/// The map only guards membership; each session carries its own lock so a
/// slow sink write never blocks unrelated sessions sharing a shard.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the session, creating it on first
    /// use.
    pub fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let session = Arc::clone(self.sessions.entry(id).or_default().value());
        let mut state = session.lock();
        f(&mut state)
    }

    pub fn remove(&self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn database(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).map(|s| s.lock().database().to_string())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
