//! Tellwatch CLI - Command-line interface for Tellwatch
//!
//! Commands:
//! - replay: Run recorded landmark frames through the detector (NDJSON in, NDJSON out)
//! - review: Summarize a saved session or review document
//! - doctor: Diagnose configuration and session files
//! - config: Print the default detector configuration

use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tellwatch::review::{MomentReason, ReviewSession};
use tellwatch::session::SessionMemory;
use tellwatch::{
    Detector, DetectorConfig, FrameInput, IndicatorKind, TellError, PRODUCER_NAME,
    TELLWATCH_VERSION,
};

/// Tellwatch - Behavioral tell detection from facial landmark streams
#[derive(Parser)]
#[command(name = "tellwatch")]
#[command(version = TELLWATCH_VERSION)]
#[command(about = "Detect behavioral tells in recorded landmark streams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay NDJSON frame records through the detector
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Detector configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Save the session document into this directory when the input ends
        #[arg(long)]
        save_session: Option<PathBuf>,

        /// Save the review timeline into this directory when the input ends
        #[arg(long)]
        save_review: Option<PathBuf>,

        /// Buffer output instead of flushing after each frame
        #[arg(long = "no-flush", action = ArgAction::SetFalse)]
        flush: bool,
    },

    /// Summarize a saved session or review document
    Review {
        /// Session (`memory_*.json`) or review (`*_review.json`) document path
        session: PathBuf,

        /// Output the review as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and session files
    Doctor {
        /// Check a configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Check a saved session document
        #[arg(long)]
        session: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default detector configuration
    Config,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays a clean NDJSON stream
fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(d) = "tellwatch=info".parse() {
        filter = filter.add_directive(d);
    }
    fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn run(cli: Cli) -> Result<(), TellwatchCliError> {
    match cli.command {
        Commands::Replay {
            input,
            config,
            save_session,
            save_review,
            flush,
        } => cmd_replay(
            &input,
            config.as_deref(),
            save_session.as_deref(),
            save_review.as_deref(),
            flush,
        ),
        Commands::Review { session, json } => cmd_review(&session, json),
        Commands::Doctor {
            config,
            session,
            json,
        } => cmd_doctor(config.as_deref(), session.as_deref(), json),
        Commands::Config => {
            println!("{}", DetectorConfig::default().to_json()?);
            Ok(())
        }
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, TellwatchCliError> {
    if path.as_os_str() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

fn cmd_replay(
    input: &Path,
    config: Option<&Path>,
    save_session: Option<&Path>,
    save_review: Option<&Path>,
    flush: bool,
) -> Result<(), TellwatchCliError> {
    let config = match config {
        Some(path) => DetectorConfig::from_path(path)?,
        None => DetectorConfig::default(),
    };
    let mut detector = Detector::new(config);
    let reader = open_input(input)?;
    let mut stdout = io::stdout();
    let mut review: Option<ReviewSession> = None;
    let mut frames = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let frame: FrameInput = serde_json::from_str(trimmed).map_err(|e| {
            TellwatchCliError::ParseError(format!("Failed to parse frame on line {}: {}", index + 1, e))
        })?;

        let output = detector.process_frame(&frame);
        if let Some(alert) = &output.alert {
            info!(timestamp = alert.timestamp, "{}", alert);
        }

        let timeline = review.get_or_insert_with(|| match detector.session() {
            Some(session) => ReviewSession::new(session.session_id.clone()),
            None => ReviewSession::default(),
        });
        timeline.record(&output, detector.baseline());
        if let Some(note) = &frame.marker {
            timeline.add_marker(note.clone());
        }

        writeln!(stdout, "{}", serde_json::to_string(&output)?)?;
        if flush {
            stdout.flush()?;
        }
        frames += 1;
    }

    if frames == 0 {
        return Err(TellwatchCliError::NoFrames);
    }

    let summary = detector.summary()?;
    info!(
        frames,
        detections = summary.total_detections,
        avg_confidence = summary.avg_confidence,
        "replay finished"
    );
    for insight in &summary.insights {
        info!("{}", insight);
    }

    if let (Some(dir), Some(review)) = (save_review, &review) {
        let path = review.save_to_dir(dir)?;
        eprintln!("Review saved to {}", path.display());
    }

    if let Some(dir) = save_session {
        let path = detector.save_session(dir)?;
        eprintln!("Session saved to {}", path.display());
    }

    Ok(())
}

fn cmd_review(path: &Path, json: bool) -> Result<(), TellwatchCliError> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if value.get("key_moments").is_some() {
        let review = ReviewSession::from_json(&content)?;
        return print_timeline_review(&review, json);
    }

    let session = SessionMemory::from_json(&content)?;
    let report = ReviewReport::from_session(&session);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Tellwatch Session Review");
    println!("========================");
    println!("Session:  {}", report.session_id);
    println!("Started:  {}", report.started);
    println!("Duration: {:.1}s", report.duration);
    if session.baseline_metrics.calibrated {
        let baseline = &session.baseline_metrics;
        println!("\nBaseline:");
        println!("  Heart rate: {:.1} BPM", baseline.bpm);
        println!("  Blink rate: {:.2}/s", baseline.blink_rate);
        println!("  Lip ratio:  {:.3}", baseline.lip_ratio);
        println!("  Emotion:    {}", baseline.dominant_emotion);
    } else {
        println!("\nBaseline: not calibrated");
    }

    println!("\nDetections: {}", report.total_detections);
    println!("  High confidence: {}", report.deception_count);
    println!("  Avg confidence:  {:.1}%", report.avg_confidence * 100.0);
    println!("  Max confidence:  {:.1}%", report.max_confidence * 100.0);
    if report.detections_per_minute > 0.0 {
        println!("  Per minute:      {:.1}", report.detections_per_minute);
    }

    if !report.indicator_counts.is_empty() {
        println!("\nIndicators:");
        let mut counts: Vec<_> = report.indicator_counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1));
        for (kind, count) in counts {
            println!("  {:<12} {}", kind.as_str(), count);
        }
    }

    if !report.insights.is_empty() {
        println!("\nInsights:");
        for insight in &report.insights {
            println!("  - {}", insight);
        }
    }

    println!("\nFinal thresholds:");
    for (kind, value) in &report.thresholds {
        println!("  {:<12} {:.3}", kind.as_str(), value);
    }

    Ok(())
}

/// `HH:MM:SS` for a number of seconds
fn clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}

fn print_timeline_review(review: &ReviewSession, json: bool) -> Result<(), TellwatchCliError> {
    let stats = review.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Tellwatch Session Review - {}", review.session_name);
    println!("========================");
    println!(
        "Duration: {} (calibration: {})",
        clock(stats.duration),
        clock(stats.calibration_duration)
    );
    println!("Frames:   {}", stats.total_frames);

    println!("\nTells: {} ({:.1}/min)", stats.total_tells, stats.tells_per_minute);
    let mut by_type: Vec<_> = stats.tells_by_type.iter().collect();
    by_type.sort_by(|a, b| b.1.cmp(a.1));
    for (kind, count) in by_type {
        println!("  {:<12} {}", kind.as_str(), count);
    }

    println!(
        "\nStress: average {:.2}, peak at {}",
        stats.avg_stress_level,
        clock(stats.max_stress_timestamp)
    );
    let distribution = &stats.stress_distribution;
    for (label, pct) in [
        ("LOW", distribution.low),
        ("MEDIUM", distribution.medium),
        ("HIGH", distribution.high),
    ] {
        println!("  {:<7} {:5.1}% {}", label, pct, "#".repeat((pct / 5.0) as usize));
    }

    println!("\nHeart rate:");
    println!("  Baseline: {:.1} BPM", stats.baseline_bpm);
    println!("  Average:  {:.1} BPM", stats.avg_bpm);
    println!("  Range:    {:.1} - {:.1} BPM", stats.min_bpm, stats.max_bpm);
    println!("  Variance: {:.1}", stats.bpm_variance);

    println!(
        "\nAlerts: {} ({} high confidence)",
        stats.total_alerts, stats.high_confidence_alerts
    );
    println!("  Avg confidence: {:.1}%", stats.avg_alert_confidence * 100.0);

    println!("\nKey moments: {}", stats.key_moments_count);
    for (i, moment) in review.key_moments.iter().take(5).enumerate() {
        let reason = match moment.reason {
            MomentReason::AlertCluster => "alert_cluster",
            MomentReason::HighStress => "high_stress",
            MomentReason::Manual => "manual",
        };
        let indicators: Vec<&str> = moment.indicators.iter().take(3).map(|k| k.as_str()).collect();
        println!("  {}. [{}] {}: {}", i + 1, clock(moment.timestamp), reason, indicators.join(", "));
        if !moment.notes.is_empty() {
            println!("     Note: {}", moment.notes);
        }
    }
    if review.key_moments.len() > 5 {
        println!("  ... and {} more", review.key_moments.len() - 5);
    }

    Ok(())
}

fn cmd_doctor(
    config: Option<&Path>,
    session: Option<&Path>,
    json: bool,
) -> Result<(), TellwatchCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "tellwatch_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Tellwatch version {}", TELLWATCH_VERSION),
    });

    if let Some(path) = config {
        checks.push(check_file(path, "config", |json| {
            DetectorConfig::from_json(json).map(|config| {
                format!(
                    "Configuration valid (alert threshold {:.2}, cooldown {:.1}s)",
                    config.alerts.alert_threshold, config.alerts.cooldown
                )
            })
        }));
    }

    if let Some(path) = session {
        checks.push(check_file(path, "session", |json| {
            SessionMemory::from_json(json).map(|session| {
                format!(
                    "Session {} valid ({} detections)",
                    session.session_id,
                    session.detection_events.len()
                )
            })
        }));
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (replay ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: TELLWATCH_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Tellwatch Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(TellwatchCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

/// Read and parse one file for the doctor report
fn check_file<F>(path: &Path, name: &str, parse: F) -> DoctorCheck
where
    F: FnOnce(&str) -> Result<String, TellError>,
{
    if !path.exists() {
        return DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: format!("{} does not exist", path.display()),
        };
    }

    let outcome = std::fs::read_to_string(path)
        .map_err(TellError::from)
        .and_then(|json| parse(&json));
    match outcome {
        Ok(message) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message,
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "doctor check failed");
            DoctorCheck {
                name: name.to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug)]
enum TellwatchCliError {
    Io(io::Error),
    Tell(TellError),
    Json(serde_json::Error),
    NoFrames,
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for TellwatchCliError {
    fn from(e: io::Error) -> Self {
        TellwatchCliError::Io(e)
    }
}

impl From<TellError> for TellwatchCliError {
    fn from(e: TellError) -> Self {
        TellwatchCliError::Tell(e)
    }
}

impl From<serde_json::Error> for TellwatchCliError {
    fn from(e: serde_json::Error) -> Self {
        TellwatchCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<TellwatchCliError> for CliError {
    fn from(e: TellwatchCliError) -> Self {
        match e {
            TellwatchCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            TellwatchCliError::Tell(TellError::NoActiveSession) => CliError {
                code: "NO_SESSION".to_string(),
                message: "No session was started".to_string(),
                hint: Some("Ensure the input contains at least one frame".to_string()),
            },
            TellwatchCliError::Tell(e) => CliError {
                code: "TELLWATCH_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'tellwatch doctor' for details".to_string()),
            },
            TellwatchCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            TellwatchCliError::NoFrames => CliError {
                code: "NO_FRAMES".to_string(),
                message: "No frames found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            TellwatchCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            TellwatchCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Each line must be one JSON frame record".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ReviewReport {
    session_id: String,
    started: String,
    duration: f64,
    total_detections: usize,
    deception_count: usize,
    avg_confidence: f64,
    max_confidence: f64,
    detections_per_minute: f64,
    indicator_counts: BTreeMap<IndicatorKind, usize>,
    insights: Vec<String>,
    thresholds: BTreeMap<IndicatorKind, f64>,
}

impl ReviewReport {
    fn from_session(session: &SessionMemory) -> Self {
        let ended = session
            .detection_events
            .last()
            .map_or(session.started_at, |event| event.timestamp);
        let summary = session.summary(ended);

        let mut indicator_counts = BTreeMap::new();
        for event in &session.detection_events {
            for kind in &event.indicators {
                *indicator_counts.entry(*kind).or_insert(0) += 1;
            }
        }

        let max_confidence = session
            .confidence_scores
            .iter()
            .copied()
            .fold(0.0, f64::max);
        let detections_per_minute = if summary.duration > 0.0 {
            summary.total_detections as f64 / (summary.duration / 60.0)
        } else {
            0.0
        };

        Self {
            session_id: summary.session_id,
            started: session.timestamp.to_rfc3339(),
            duration: summary.duration,
            total_detections: summary.total_detections,
            deception_count: summary.deception_count,
            avg_confidence: summary.avg_confidence,
            max_confidence,
            detections_per_minute,
            indicator_counts,
            insights: summary.insights,
            thresholds: summary.current_thresholds,
        }
    }
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay_flush(args: &[&str]) -> bool {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Replay { flush, .. } => flush,
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn test_flush_defaults_on_and_can_be_disabled() {
        assert!(replay_flush(&["tellwatch", "replay"]));
        assert!(!replay_flush(&["tellwatch", "replay", "--no-flush"]));
        assert!(Cli::try_parse_from(["tellwatch", "replay", "--flush", "false"]).is_err());
    }

    #[test]
    fn test_replay_review_dir() {
        let cli = Cli::try_parse_from(["tellwatch", "replay", "--save-review", "reviews"]).unwrap();
        let Commands::Replay { save_review, .. } = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(save_review, Some(PathBuf::from("reviews")));
    }

    #[test]
    fn test_clock() {
        assert_eq!(clock(0.0), "00:00:00");
        assert_eq!(clock(3725.9), "01:02:05");
        assert_eq!(clock(-4.0), "00:00:00");
    }
}
