//! The audit log engine.
//!
//! [`AuditLogger`] is shared by every server worker thread. Each call to
//! [`AuditLogger::notify`] folds the event into its session, applies the
//! policy and account filter, renders the record and hands it to the sink.

use crate::config::AuditLogConfig;
use crate::error::AuditError;
use crate::event::{AuditEvent, GeneralSubclass};
use crate::filter::{AccountFilter, Policy};
use crate::output::{create_output, Output};
use crate::record::{RecordBuilder, Rendered, RequiredSize, Written};
use crate::record_id::{RecordIdGenerator, Timestamp};
use crate::session::{SessionId, SessionRegistry, SessionState};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Size of the per-call stack buffer records are first rendered into.
pub const RECORD_BUFFER_SIZE: usize = 4096;

/// Filtering configuration, published as one immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub policy: Policy,
    pub accounts: AccountFilter,
}

/// What [`AuditLogger::notify`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A record was written
    Written,
    /// Suppressed by the policy or the account filter
    Suppressed,
    /// The event never produces a record
    Ignored,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub records_written: u64,
    pub events_filtered: u64,
    pub write_errors: u64,
    pub conversion_errors: u64,
    pub buffer_regrowths: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    records_written: AtomicU64,
    events_filtered: AtomicU64,
    write_errors: AtomicU64,
    conversion_errors: AtomicU64,
    buffer_regrowths: AtomicU64,
}

/// Audit log engine.
pub struct AuditLogger {
    settings: ArcSwap<Settings>,
    /// Serializes read-modify-write of `settings`
    update_lock: Mutex<()>,
    builder: RecordBuilder,
    output: Arc<dyn Output>,
    sessions: SessionRegistry,
    counters: Counters,
    /// Set while writes are failing, so the failure is logged once
    write_failing: AtomicBool,
}

impl AuditLogger {
    /// Create an engine writing to `output`.
    ///
    /// Record ids continue from the sink's current size.
    pub fn new(config: &AuditLogConfig, output: Arc<dyn Output>) -> Result<Self, AuditError> {
        config.validate()?;
        let accounts =
            AccountFilter::from_lists(&config.include_accounts, &config.exclude_accounts)?;

        let origin = output.origin();
        let ids = Arc::new(RecordIdGenerator::new(origin.size, origin.epoch));
        let builder = RecordBuilder::new(config.format, ids, config.server_version.clone());

        info!(
            format = ?config.format,
            policy = ?config.policy,
            first_record = origin.size + 1,
            "Audit logger initialized"
        );

        Ok(Self {
            settings: ArcSwap::from_pointee(Settings {
                policy: config.policy,
                accounts,
            }),
            update_lock: Mutex::new(()),
            builder,
            output,
            sessions: SessionRegistry::new(),
            counters: Counters::default(),
            write_failing: AtomicBool::new(false),
        })
    }

    /// Create an engine with the sink described in `config`.
    pub fn from_config(config: &AuditLogConfig) -> Result<Self, AuditError> {
        config.validate()?;
        let output = create_output(&config.output, config.format)?;
        Self::new(config, output)
    }

    /// Write the `Audit` lifecycle record.
    pub fn start(&self) -> Result<(), AuditError> {
        self.lifecycle_record("Audit")
    }

    /// Write the `NoAudit` lifecycle record and close the sink.
    pub fn shutdown(&self) -> Result<(), AuditError> {
        let result = self.lifecycle_record("NoAudit");
        self.output.close()?;
        info!(
            records = self.counters.records_written.load(Ordering::Relaxed),
            "Audit logger shut down"
        );
        result
    }

    /// Handle one event raised by `session`.
    pub fn notify(
        &self,
        session: SessionId,
        event: &AuditEvent<'_>,
    ) -> Result<Outcome, AuditError> {
        let settings = self.settings.load_full();

        self.sessions.with_session(session, |state| {
            state.update(event, &settings.accounts);

            if !settings.policy.allows(event.class()) || state.skip_logging() {
                self.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::Suppressed);
            }

            if !produces_record(event) {
                return Ok(Outcome::Ignored);
            }

            self.record_event(state, event)
        })
    }

    /// Forget a session's state.
    pub fn end_session(&self, session: SessionId) -> bool {
        self.sessions.remove(session)
    }

    pub fn set_policy(&self, policy: Policy) {
        let _guard = self.update_lock.lock();
        let mut next = Settings::clone(&self.settings.load());
        next.policy = policy;
        self.settings.store(Arc::new(next));
        info!(?policy, "Audit policy updated");
    }

    /// Replace the include list. The previous configuration stays in force
    /// when the update is rejected.
    pub fn set_include_accounts(&self, list: &str) -> Result<(), AuditError> {
        self.update_accounts("include_accounts", |accounts| accounts.with_include(list))
    }

    /// Replace the exclude list.
    pub fn set_exclude_accounts(&self, list: &str) -> Result<(), AuditError> {
        self.update_accounts("exclude_accounts", |accounts| accounts.with_exclude(list))
    }

    fn update_accounts<F>(&self, name: &'static str, update: F) -> Result<(), AuditError>
    where
        F: FnOnce(&AccountFilter) -> Result<AccountFilter, AuditError>,
    {
        let _guard = self.update_lock.lock();
        let current = self.settings.load_full();

        match update(&current.accounts) {
            Ok(accounts) => {
                self.settings.store(Arc::new(Settings {
                    policy: current.policy,
                    accounts,
                }));
                info!(setting = name, "Account filter updated");
                Ok(())
            }
            Err(e) => {
                warn!(setting = name, error = %e, "Rejected account filter update");
                Err(e)
            }
        }
    }

    /// Reopen the sink after external log rotation.
    pub fn reopen(&self) -> Result<(), AuditError> {
        self.output.reopen()?;
        self.sync_epoch();
        info!("Audit log reopened");
        Ok(())
    }

    pub fn flush(&self) -> Result<(), AuditError> {
        Ok(self.output.flush()?)
    }

    /// Current filtering snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn policy(&self) -> Policy {
        self.settings.load().policy
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn builder(&self) -> &RecordBuilder {
        &self.builder
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            records_written: self.counters.records_written.load(Ordering::Relaxed),
            events_filtered: self.counters.events_filtered.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            conversion_errors: self.counters.conversion_errors.load(Ordering::Relaxed),
            buffer_regrowths: self.counters.buffer_regrowths.load(Ordering::Relaxed),
            active_sessions: self.sessions.len(),
        }
    }

    fn lifecycle_record(&self, name: &str) -> Result<(), AuditError> {
        let time = Timestamp::now();
        let mut buf = [0u8; RECORD_BUFFER_SIZE];

        match self.builder.audit_record(&mut buf, name, time) {
            Ok(written) => self.emit(&buf[..written.len], written),
            Err(RequiredSize(required)) => {
                let mut heap = vec![0u8; required];
                let written = self
                    .builder
                    .audit_record(&mut heap, name, time)
                    .map_err(|RequiredSize(required)| AuditError::Render { required })?;
                self.emit(&heap[..written.len], written)
            }
        }
    }

    fn record_event(
        &self,
        state: &mut SessionState,
        event: &AuditEvent<'_>,
    ) -> Result<Outcome, AuditError> {
        let time = Timestamp::now();
        let (db, scratch) = state.render_parts();
        let builder = &self.builder;

        let build = |buf: &mut [u8]| -> Rendered {
            match event {
                AuditEvent::General(e) => builder.general_record(buf, e, db),
                AuditEvent::Connection(e) => {
                    builder.connection_record(buf, e.subclass.record_name(), e, time)
                }
            }
        };

        // Once a session has grown its scratch buffer, keep using it.
        let use_scratch = scratch.is_allocated();
        let mut stack = [0u8; RECORD_BUFFER_SIZE];
        let first = if use_scratch {
            build(scratch.as_mut_slice())
        } else {
            build(&mut stack[..])
        };

        match first {
            Ok(written) => {
                let bytes = if use_scratch {
                    &scratch.as_mut_slice()[..written.len]
                } else {
                    &stack[..written.len]
                };
                self.emit(bytes, written)?;
            }
            Err(RequiredSize(required)) => {
                self.counters.buffer_regrowths.fetch_add(1, Ordering::Relaxed);
                debug!(
                    thread_id = event.thread_id(),
                    required,
                    previous = scratch.capacity(),
                    "Growing record buffer"
                );

                let buf = scratch.ensure_capacity(required);
                let written = build(&mut *buf)
                    .map_err(|RequiredSize(required)| AuditError::Render { required })?;
                self.emit(&buf[..written.len], written)?;
            }
        }

        Ok(Outcome::Written)
    }

    fn emit(&self, record: &[u8], written: Written) -> Result<(), AuditError> {
        if written.conversion_errors > 0 {
            self.counters
                .conversion_errors
                .fetch_add(written.conversion_errors as u64, Ordering::Relaxed);
            debug!(
                errors = written.conversion_errors,
                "Statement text had unconvertible characters"
            );
        }

        match self.output.write(record) {
            Ok(()) => {
                self.counters.records_written.fetch_add(1, Ordering::Relaxed);
                if self.write_failing.swap(false, Ordering::AcqRel) {
                    info!("Audit log writes recovered");
                }
                self.sync_epoch();
                Ok(())
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                if !self.write_failing.swap(true, Ordering::AcqRel) {
                    error!(error = %e, "Failed to write audit record");
                }
                Err(e.into())
            }
        }
    }

    /// Follow the sink's epoch after it rotated.
    fn sync_epoch(&self) {
        let epoch = self.output.origin().epoch;
        let ids = self.builder.ids();
        if epoch.timestamp() != ids.epoch().timestamp() {
            ids.set_epoch(epoch);
            debug!(%epoch, "Record id epoch changed");
        }
    }
}

/// Only statement status events and connection events produce records;
/// `Quit` and `Change user` statements are covered by connection records.
fn produces_record(event: &AuditEvent<'_>) -> bool {
    match event {
        AuditEvent::General(e) => {
            e.subclass == GeneralSubclass::Status
                && !e.command_is("Quit")
                && !e.command_is("Change user")
        }
        AuditEvent::Connection(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatType;
    use crate::event::{ConnectionEvent, ConnectionSubclass, GeneralEvent};
    use crate::output::{MemoryOutput, SinkOrigin};
    use chrono::{TimeZone, Utc};

    fn engine(policy: Policy, format: FormatType) -> (AuditLogger, Arc<MemoryOutput>) {
        let output = Arc::new(MemoryOutput::with_origin(SinkOrigin {
            size: 0,
            epoch: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }));
        let config = AuditLogConfig {
            policy,
            format,
            ..AuditLogConfig::default()
        };
        let logger = AuditLogger::new(&config, output.clone()).unwrap();
        (logger, output)
    }

    #[test]
    fn test_logins_policy() {
        let (logger, output) = engine(Policy::Logins, FormatType::Json);
        let session = SessionId(1);

        let query = GeneralEvent::query(1, "select", "SELECT 1");
        assert_eq!(logger.notify(session, &query.into()).unwrap(), Outcome::Suppressed);

        let connect = ConnectionEvent::connect(1, "alice", "localhost", "");
        assert_eq!(logger.notify(session, &connect.into()).unwrap(), Outcome::Written);
        assert_eq!(output.len(), 1);
        assert!(output.last().unwrap().contains("\"name\":\"Connect\""));
    }

    #[test]
    fn test_none_policy() {
        let (logger, output) = engine(Policy::None, FormatType::Old);
        let session = SessionId(1);

        let connect = ConnectionEvent::connect(1, "alice", "localhost", "");
        let query = GeneralEvent::query(1, "select", "SELECT 1");
        assert_eq!(logger.notify(session, &connect.into()).unwrap(), Outcome::Suppressed);
        assert_eq!(logger.notify(session, &query.into()).unwrap(), Outcome::Suppressed);
        assert!(output.is_empty());
        assert_eq!(logger.stats().events_filtered, 2);
    }

    #[test]
    fn test_queries_policy_records_database() {
        let (logger, output) = engine(Policy::Queries, FormatType::Json);
        let session = SessionId(9);

        logger
            .notify(session, &GeneralEvent::query(9, "change_db", "use shop").into())
            .unwrap();
        logger
            .notify(session, &GeneralEvent::query(9, "select", "SELECT * FROM t").into())
            .unwrap();

        let last = output.last().unwrap();
        assert!(last.contains("\"db\":\"shop\""));
        assert!(last.contains("\"sqltext\":\"SELECT * FROM t\""));
    }

    #[test]
    fn test_quit_and_non_status_ignored() {
        let (logger, output) = engine(Policy::All, FormatType::Csv);
        let session = SessionId(1);

        let quit = GeneralEvent {
            command: "Quit",
            ..GeneralEvent::query(1, "", "")
        };
        let change_user = GeneralEvent {
            command: "Change user",
            ..GeneralEvent::query(1, "", "")
        };
        let log = GeneralEvent {
            subclass: GeneralSubclass::Log,
            ..GeneralEvent::query(1, "select", "SELECT 1")
        };
        assert_eq!(logger.notify(session, &quit.into()).unwrap(), Outcome::Ignored);
        assert_eq!(logger.notify(session, &change_user.into()).unwrap(), Outcome::Ignored);
        assert_eq!(logger.notify(session, &log.into()).unwrap(), Outcome::Ignored);
        assert!(output.is_empty());
    }

    #[test]
    fn test_disconnect_record_name() {
        let (logger, output) = engine(Policy::All, FormatType::Csv);
        let quit = ConnectionEvent {
            subclass: ConnectionSubclass::Disconnect,
            ..ConnectionEvent::connect(4, "u", "h", "")
        };
        logger.notify(SessionId(4), &quit.into()).unwrap();
        assert!(output.last().unwrap().starts_with("\"Quit\","));
    }

    #[test]
    fn test_excluded_account_suppressed() {
        let (logger, output) = engine(Policy::All, FormatType::Json);
        logger.set_exclude_accounts("bob@%").unwrap();

        let bob = SessionId(1);
        logger
            .notify(bob, &ConnectionEvent::connect(1, "bob", "h", "").into())
            .unwrap();
        let outcome = logger
            .notify(bob, &GeneralEvent::query(1, "select", "SELECT 1").into())
            .unwrap();
        assert_eq!(outcome, Outcome::Suppressed);

        let alice = SessionId(2);
        logger
            .notify(alice, &ConnectionEvent::connect(2, "alice", "h", "").into())
            .unwrap();
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn test_conflicting_update_keeps_settings() {
        let (logger, _) = engine(Policy::All, FormatType::Json);
        logger.set_include_accounts("alice@%").unwrap();

        let err = logger.set_exclude_accounts("bob@%").unwrap_err();
        assert!(matches!(err, AuditError::ConflictingAccountFilter { .. }));
        assert!(logger.settings().accounts.include_list().is_some());
        assert!(logger.settings().accounts.allows("alice", "h"));

        logger.set_include_accounts("").unwrap();
        logger.set_exclude_accounts("bob@%").unwrap();
        assert!(!logger.settings().accounts.allows("bob", "h"));
    }

    #[test]
    fn test_large_query_grows_scratch() {
        let (logger, output) = engine(Policy::All, FormatType::Csv);
        let session = SessionId(3);
        let query = format!("SELECT '{}'", "x".repeat(RECORD_BUFFER_SIZE * 2));

        logger
            .notify(session, &GeneralEvent::query(3, "select", &query).into())
            .unwrap();
        assert_eq!(logger.stats().buffer_regrowths, 1);
        assert!(output.last().unwrap().contains(&query));

        // The grown buffer is reused for later events.
        logger
            .notify(session, &GeneralEvent::query(3, "select", &query).into())
            .unwrap();
        assert_eq!(logger.stats().buffer_regrowths, 1);
        let capacity = logger
            .sessions()
            .with_session(session, |state| state.scratch().capacity());
        assert!(capacity >= query.len());
    }

    #[test]
    fn test_write_failure_reported() {
        let (logger, output) = engine(Policy::All, FormatType::Json);
        output.set_failing(true);

        let event = ConnectionEvent::connect(1, "u", "h", "");
        assert!(matches!(
            logger.notify(SessionId(1), &event.into()),
            Err(AuditError::Output(_))
        ));
        assert!(logger.notify(SessionId(1), &event.into()).is_err());
        assert_eq!(logger.stats().write_errors, 2);

        output.set_failing(false);
        assert_eq!(logger.notify(SessionId(1), &event.into()).unwrap(), Outcome::Written);
        assert_eq!(logger.stats().records_written, 1);
    }

    #[test]
    fn test_lifecycle_records() {
        let (logger, output) = engine(Policy::None, FormatType::Json);
        logger.start().unwrap();
        logger.shutdown().unwrap();

        let records = output.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].contains("\"name\":\"Audit\""));
        assert!(records[1].contains("\"name\":\"NoAudit\""));
        assert!(records[0].contains("\"record\":\"1_2024-01-02T03:04:05\""));
        assert!(records[1].contains("\"record\":\"2_2024-01-02T03:04:05\""));
    }

    #[test]
    fn test_ids_continue_from_sink_size() {
        let output = Arc::new(MemoryOutput::with_origin(SinkOrigin {
            size: 500,
            epoch: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }));
        let config = AuditLogConfig {
            format: FormatType::Csv,
            ..AuditLogConfig::default()
        };
        let logger = AuditLogger::new(&config, output.clone()).unwrap();
        logger.start().unwrap();
        assert!(output.last().unwrap().contains("\"501_2024-01-02T03:04:05\""));
    }

    #[test]
    fn test_end_session() {
        let (logger, _) = engine(Policy::All, FormatType::Json);
        logger
            .notify(SessionId(5), &GeneralEvent::query(5, "change_db", "use a").into())
            .unwrap();
        assert_eq!(logger.stats().active_sessions, 1);
        assert!(logger.end_session(SessionId(5)));
        assert_eq!(logger.stats().active_sessions, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AuditLogConfig {
            include_accounts: "a@%".to_string(),
            exclude_accounts: "b@%".to_string(),
            ..AuditLogConfig::default()
        };
        assert!(AuditLogger::new(&config, Arc::new(MemoryOutput::new())).is_err());
    }
}
