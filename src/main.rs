mod analytics;
mod config;
mod models;
mod protection;
mod protocol;
mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::io::BufReader;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analytics::reporter::StatsReporter;
use crate::config::settings::{LoggingConfig, Settings};
use crate::protection::decision::DecisionLoop;
use crate::protection::detector::Detector;
use crate::protocol::server::{LineServer, MAX_LINE_LENGTH};
use crate::storage::blacklist::Blacklist;
use crate::storage::history::History;
use crate::storage::slot_clock::SlotClock;

/// Detects bad bots by the HTML/asset request ratio per IP over a time window.
///
/// Reads `SOURCE_IP|FORWARDED_FOR|PATH` lines on stdin and answers each with
/// `OK` or `BLOCK` on stdout.
#[derive(Parser, Debug)]
#[command(name = "botdetect", version, about)]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(long, env = "BOTDETECT_CONFIG")]
    config: Option<String>,

    /// Duration of one aggregation slot
    #[arg(long, env = "BOTDETECT_TIMESLOT_SECS")]
    timeslot_secs: Option<u64>,

    /// Time window to observe
    #[arg(long, env = "BOTDETECT_WINDOW_SECS")]
    window_secs: Option<u64>,

    /// Build a new blacklist after this much time
    #[arg(long, env = "BOTDETECT_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// How often stale history and blacklist entries are swept
    #[arg(long, env = "BOTDETECT_EXPIRE_INTERVAL_MS")]
    expire_interval_ms: Option<u64>,

    /// Application requests an IP may make before it is considered
    #[arg(long, env = "BOTDETECT_MAX_REQUESTS")]
    max_requests: Option<u64>,

    /// Blacklist IPs whose total/app ratio is above this threshold
    #[arg(long, env = "BOTDETECT_MAX_RATIO")]
    max_ratio: Option<f64>,

    /// How long a blacklisted IP stays blocked
    #[arg(long, env = "BOTDETECT_BLACKLIST_TTL_SECS")]
    blacklist_ttl_secs: Option<u64>,

    /// Label format for time slots (strftime, default hour:minute)
    #[arg(long, env = "BOTDETECT_TIMESTAMP_FORMAT")]
    timestamp_format: Option<String>,

    /// Ignore private IPs when collecting candidates
    #[arg(long, env = "BOTDETECT_IGNORE_PRIVATE_IPS", action = ArgAction::Set)]
    ignore_private_ips: Option<bool>,

    /// Base log filter, e.g. "info" or "warn,botdetect=debug"
    #[arg(long, env = "BOTDETECT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Append logs to this file as well as stderr
    #[arg(long, env = "BOTDETECT_LOG_FILE")]
    log_file: Option<String>,

    /// Trace the decisions the program makes
    #[arg(long, env = "BOTDETECT_TRACE")]
    trace: bool,
}

impl Args {
    /// Build the effective settings: defaults, then the config file, then flags.
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        self.apply(&mut settings);
        settings.validate().context("Invalid configuration")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut Settings) {
        let d = &mut settings.detection;
        if let Some(v) = self.timeslot_secs {
            d.timeslot_secs = v;
        }
        if let Some(v) = self.window_secs {
            d.window_secs = v;
        }
        if let Some(v) = self.interval_ms {
            d.decision_interval_ms = v;
        }
        if let Some(v) = self.expire_interval_ms {
            d.expire_interval_ms = v;
        }
        if let Some(v) = self.max_requests {
            d.max_requests = v;
        }
        if let Some(v) = self.max_ratio {
            d.max_ratio = v;
        }
        if let Some(v) = self.blacklist_ttl_secs {
            d.blacklist_ttl_secs = v;
        }
        if let Some(v) = &self.timestamp_format {
            d.timestamp_format = v.clone();
        }
        if let Some(v) = self.ignore_private_ips {
            settings.filter.ignore_private_ips = v;
        }
        if let Some(v) = &self.log_level {
            settings.logging.level = v.clone();
        }
        if let Some(v) = &self.log_file {
            settings.logging.file = Some(v.clone());
        }
        if self.trace {
            settings.logging.trace = true;
        }
    }
}

/// Log filter directives for the given logging config.
fn filter_directives(logging: &LoggingConfig) -> String {
    if logging.trace {
        format!("{},botdetect=trace", logging.level)
    } else {
        logging.level.clone()
    }
}

/// Raise this crate to `trace` on top of an existing filter.
fn apply_trace(filter: EnvFilter, trace: bool) -> Result<EnvFilter> {
    if !trace {
        return Ok(filter);
    }
    let directive = "botdetect=trace"
        .parse()
        .context("Invalid trace directive")?;
    Ok(filter.add_directive(directive))
}

/// Initialise the `tracing` subscriber. Everything goes to stderr (stdout
/// carries verdicts), optionally mirrored into a log file. `RUST_LOG`
/// replaces `logging.level`, but `logging.trace` still applies on top.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => apply_trace(filter, logging.trace)?,
        Err(_) => EnvFilter::new(filter_directives(logging)),
    };

    let (json_layer, text_layer) = if logging.json {
        (
            Some(fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(fmt::layer().with_writer(std::io::stderr).with_target(true)),
        )
    };

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}

/// Background task that evicts history buckets outside the window and
/// expired blacklist entries.
async fn cleanup_loop(
    history: Arc<History>,
    blacklist: Arc<Blacklist>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                history.sweep(history.cutoff());
                blacklist.sweep();
            }
        }
    }
    debug!("Cleanup loop stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let args = Args::parse();
    let settings = args.settings()?;

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _log_guard = init_tracing(&settings.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting botdetect");
    if let Some(path) = &args.config {
        info!("Config loaded from {}", path);
    }
    debug!(settings = ?settings, "Effective configuration");

    // ---------------------------------------------------------------
    // 3. Engine
    // ---------------------------------------------------------------
    let detection = &settings.detection;
    let clock = Arc::new(SlotClock::new(detection));
    let history = Arc::new(History::new(clock.clone(), detection.window()));
    let blacklist = Arc::new(Blacklist::new(detection.blacklist_ttl()));
    let decision = Arc::new(DecisionLoop::new(history.clone(), blacklist.clone(), detection));
    let detector = Arc::new(Detector::new(history.clone(), blacklist.clone(), &settings));

    info!(
        timeslot_secs = detection.timeslot_secs,
        window_secs = detection.window_secs,
        ignore_private_ips = settings.filter.ignore_private_ips,
        slot = %clock.label(),
        "Detection engine initialised"
    );

    // ---------------------------------------------------------------
    // 4. Spawn background tasks
    // ---------------------------------------------------------------
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let clock_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        clock.run(clock_cancel).await;
    }));

    let decision_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        decision.run(decision_cancel).await;
    }));

    handles.push(tokio::spawn(cleanup_loop(
        history.clone(),
        blacklist.clone(),
        detection.expire_interval(),
        cancel.clone(),
    )));

    if settings.logging.stats_interval_secs > 0 {
        let reporter = StatsReporter::new(
            detector.clone(),
            Duration::from_secs(settings.logging.stats_interval_secs),
        );
        let reporter_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            reporter.run(reporter_cancel).await;
        }));
    }

    // ---------------------------------------------------------------
    // 5. Serve stdin until EOF or Ctrl+C
    // ---------------------------------------------------------------
    let server = LineServer::new(detector.clone(), MAX_LINE_LENGTH);
    let server_cancel = cancel.clone();
    let stdin = BufReader::new(tokio::io::stdin());
    let served = tokio::select! {
        result = server.run(stdin, tokio::io::stdout(), server_cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(0)
        }
    };

    info!("Shutting down botdetect...");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }

    match served {
        Ok(lines) => {
            let stats = detector.stats();
            info!(
                lines = lines,
                tracked_ips = stats.tracked_ips,
                blacklisted = stats.blacklisted,
                "botdetect shut down gracefully"
            );
            Ok(())
        }
        Err(e) => {
            error!("Line server error: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "botdetect",
            "--max-requests",
            "50",
            "--max-ratio",
            "1.2",
            "--ignore-private-ips",
            "false",
            "--trace",
        ])
        .unwrap();
        let settings = args.settings().unwrap();

        assert_eq!(settings.detection.max_requests, 50);
        assert!((settings.detection.max_ratio - 1.2).abs() < f64::EPSILON);
        assert!(!settings.filter.ignore_private_ips);
        assert!(settings.logging.trace);
        assert_eq!(settings.detection.window_secs, 3600);
    }

    #[test]
    fn test_invalid_flags_are_rejected() {
        let args = Args::try_parse_from(["botdetect", "--timeslot-secs", "0"]).unwrap();
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_filter_directives() {
        let mut logging = Settings::default().logging;
        assert_eq!(filter_directives(&logging), "info");
        logging.trace = true;
        assert_eq!(filter_directives(&logging), "info,botdetect=trace");
    }

    #[test]
    fn test_trace_applies_over_env_filter() {
        let filter = apply_trace(EnvFilter::new("warn"), true).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("botdetect=trace"));

        let untouched = apply_trace(EnvFilter::new("warn"), false).unwrap();
        assert!(!untouched.to_string().contains("botdetect"));
    }

    #[tokio::test]
    async fn test_cleanup_loop_expires_and_stops() {
        let settings = Settings::default();
        let clock = Arc::new(SlotClock::new(&settings.detection));
        let history = Arc::new(History::new(clock, settings.detection.window()));
        let blacklist = Arc::new(Blacklist::new(Duration::from_millis(30)));
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        blacklist.insert_if_absent(addr);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(cleanup_loop(
            history,
            blacklist.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        // Gone within ttl + expire interval (plus scheduling slack).
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!blacklist.contains(&addr));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup loop should exit once cancelled")
            .unwrap();
    }
}
