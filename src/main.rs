//! Database Audit Log replay CLI
//!
//! Feeds JSON-lines server events through the audit log engine and writes
//! the resulting records to the configured sink.

use anyhow::Context;
use clap::Parser;
use db_audit_log::{AuditLogConfig, AuditLogger, ReplayEvent};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "db-audit-log",
    about = "Replay database server events through the audit log engine",
    version
)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, default_value = "audit-log.yaml")]
    config: PathBuf,

    /// JSON-lines event file; reads stdin when omitted or "-"
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Records may go to stdout, so diagnostics go to stderr
    let log_level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    if args.print_config {
        let config = AuditLogConfig::default();
        let yaml = serde_yaml::to_string(&config)?;
        println!("{}", yaml);
        return Ok(());
    }

    let config = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        let config: AuditLogConfig = serde_yaml::from_str(&content)?;
        info!(path = %args.config.display(), "Loaded configuration");
        config
    } else if args.validate {
        error!(path = %args.config.display(), "Configuration file not found");
        std::process::exit(1);
    } else {
        info!("Using default configuration");
        AuditLogConfig::default()
    };

    if args.validate {
        config.validate()?;
        info!("Configuration is valid");
        println!("Configuration Summary:");
        println!("  Policy: {:?}", config.policy);
        println!("  Format: {:?}", config.format);
        println!("  Output: {:?}", config.output);
        if !config.include_accounts.is_empty() {
            println!("  Include accounts: {}", config.include_accounts);
        }
        if !config.exclude_accounts.is_empty() {
            println!("  Exclude accounts: {}", config.exclude_accounts);
        }
        return Ok(());
    }

    let logger = AuditLogger::from_config(&config)?;
    logger.start()?;

    let input: Box<dyn BufRead> = match &args.events {
        Some(path) if path.as_os_str() != "-" => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        _ => Box::new(BufReader::new(io::stdin())),
    };

    let replayed = replay(&logger, input)?;

    let stats = logger.stats();
    logger.shutdown()?;
    info!(events = replayed, "Replay finished");
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// Feed every event line to the engine. Bad lines are logged and skipped.
fn replay(logger: &AuditLogger, input: Box<dyn BufRead>) -> anyhow::Result<u64> {
    let mut replayed = 0;

    for (index, line) in input.lines().enumerate() {
        let line = line?;
        let lineno = index + 1;

        let event = match ReplayEvent::parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = lineno, error = %e, "Skipping malformed event");
                continue;
            }
        };

        let audit_event = match event.as_event() {
            Ok(audit_event) => audit_event,
            Err(e) => {
                warn!(line = lineno, error = %e, "Skipping event");
                continue;
            }
        };

        if let Err(e) = logger.notify(event.session, &audit_event) {
            warn!(line = lineno, session = %event.session, error = %e, "Event not logged");
        }
        if event.ends_session() {
            logger.end_session(event.session);
        }
        replayed += 1;
    }

    Ok(replayed)
}
