#![forbid(unsafe_code)]

// Load driver - fans out simulated users on one scheduler, optionally across
// worker processes, and aggregates their reports

use crate::api::ApiClient;
use crate::sim::{self, UserCtx, UserProfile, UserReport};
use crate::stats::{self, SimStats};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full user lifecycle against the chat platform
    Simulate,
    /// Ping/pong connection test against an echo server
    Connect,
}

/// Every knob of one run. Workers inherit the parent's config unchanged
/// apart from the output path suffix.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub mode: Mode,
    pub base_url: String,
    pub users: usize,
    pub processes: usize,
    pub messages_per_user: u32,
    pub message_interval: Duration,
    pub message_jitter: Duration,
    pub passive: bool,
    pub report_period: Option<Duration>,
    pub duration: Duration,
    pub output: Option<PathBuf>,
    pub profiles: Vec<UserProfile>,
    pub start_jitter_secs: (u64, u64),
    pub worker: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Simulate,
            base_url: "http://localhost:8080".to_string(),
            users: 50,
            processes: 1,
            messages_per_user: 10,
            message_interval: Duration::from_secs(2),
            message_jitter: Duration::from_millis(500),
            passive: false,
            report_period: Some(Duration::from_secs(5)),
            duration: Duration::from_secs(60),
            output: None,
            profiles: sim::default_profiles(),
            start_jitter_secs: (1, 5),
            worker: None,
        }
    }
}

/// Runs one batch of simulated users on the current scheduler and reports
/// the aggregate outcome.
pub async fn run_batch(config: SimConfig) -> Result<()> {
    let batch = config.worker.unwrap_or(0);
    println!(
        "making {}-{} connections",
        batch * config.users,
        (batch + 1) * config.users
    );

    let stats = SimStats::new();
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building http client")?;
    let api = ApiClient::new(http, config.base_url.clone());
    let deadline = tokio::time::Instant::now() + config.duration;
    let config = Arc::new(config);

    let reporter = config
        .report_period
        .map(|period| stats::spawn_reporter(stats.clone(), period));

    let mut handles = Vec::with_capacity(config.users);
    for index in 0..config.users {
        let profile = config.profiles[index % config.profiles.len()].clone();
        let ctx = UserCtx {
            index,
            api: api.clone(),
            profile,
            stats: stats.clone(),
            config: config.clone(),
            deadline,
        };
        let handle = match config.mode {
            Mode::Simulate => tokio::spawn(sim::run_user(ctx)),
            Mode::Connect => tokio::spawn(sim::run_pinger(ctx)),
        };
        handles.push(handle);
    }

    // Each task captures its own failure; a panic is tallied here instead of
    // propagating to the rest of the batch
    let mut reports: Vec<UserReport> = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(join_err) => {
                stats.inc_errors();
                warn!("user {} task panicked: {}", index, join_err);
            }
        }
    }

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    print_summary(&reports, &stats);

    if let Some(path) = config.output.as_ref() {
        write_transcripts(path, &reports)?;
        println!("Transcripts saved to: {}", path.display());
    }

    Ok(())
}

fn print_summary(reports: &[UserReport], stats: &SimStats) {
    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    let sent: u64 = reports.iter().map(|r| r.sent).sum();
    let received: u64 = reports
        .iter()
        .map(|r| r.received_partner + r.received_self)
        .sum();
    let snap = stats.snapshot();

    println!("\n=== Run Summary ===");
    println!("Users: {} ok, {} failed", reports.len() - failed, failed);
    println!("Signups: {}", snap.signups);
    println!("Messages: {} sent, {} received", sent, received);
    println!("Errors: {}", snap.errors);
    println!("===================");
}

/// Writes one JSON object mapping user id (or token when the id was never
/// learned) to that user's ordered transcript.
fn write_transcripts(path: &Path, reports: &[UserReport]) -> Result<()> {
    let mut transcripts = serde_json::Map::new();
    for report in reports {
        transcripts.insert(
            report.output_key(),
            serde_json::to_value(&report.transcript)?,
        );
    }
    let json = serde_json::to_string_pretty(&serde_json::Value::Object(transcripts))?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Suffixes the output path with the worker index so each process writes its
/// own file. No cross-process aggregation.
pub fn worker_output_path(path: &Path, worker: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("transcripts");
    let suffixed = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{worker}.{ext}"),
        None => format!("{stem}-{worker}"),
    };
    path.with_file_name(suffixed)
}

/// Re-executes the current binary once per worker, forwarding the original
/// arguments minus `--processes` and adding `--worker <index>`. Each child
/// runs its own runtime and batch; the parent only waits on exit status.
pub async fn spawn_workers(processes: usize) -> Result<()> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let args = strip_processes_flag(std::env::args().skip(1).collect());

    let mut children = Vec::with_capacity(processes);
    for worker in 0..processes {
        let child = tokio::process::Command::new(&exe)
            .args(&args)
            .arg("--worker")
            .arg(worker.to_string())
            .spawn()
            .with_context(|| format!("spawning worker {worker}"))?;
        children.push((worker, child));
    }
    info!("spawned {} worker processes", processes);

    let mut failures = 0usize;
    for (worker, mut child) in children {
        let status = child.wait().await?;
        if !status.success() {
            warn!("worker {} exited with {}", worker, status);
            failures += 1;
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {processes} workers failed");
    }
    Ok(())
}

fn strip_processes_flag(args: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--processes" || arg == "-p" {
            let _ = iter.next(); // drop the value too
        } else {
            out.push(arg);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_output_path_is_index_suffixed() {
        assert_eq!(
            worker_output_path(Path::new("out/transcripts.json"), 3),
            PathBuf::from("out/transcripts-3.json")
        );
        assert_eq!(
            worker_output_path(Path::new("results"), 0),
            PathBuf::from("results-0")
        );
    }

    #[test]
    fn strip_processes_flag_drops_flag_and_value() {
        let args = vec![
            "--users".to_string(),
            "10".to_string(),
            "--processes".to_string(),
            "4".to_string(),
            "--passive".to_string(),
        ];
        assert_eq!(
            strip_processes_flag(args),
            vec!["--users", "10", "--passive"]
        );
    }

    #[test]
    fn transcripts_file_maps_key_to_ordered_messages() {
        let mut report = UserReport {
            token: "tok".to_string(),
            user_id: Some(12),
            partner_id: Some(7),
            destination: Some("chatroom".to_string()),
            sent: 2,
            received_partner: 2,
            received_self: 0,
            transcript: vec!["first".to_string(), "second".to_string()],
            error: None,
        };

        let dir = std::env::temp_dir().join(format!("chatswarm-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("transcripts.json");

        write_transcripts(&path, std::slice::from_ref(&report)).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["12"][0], "first");
        assert_eq!(value["12"][1], "second");

        // without a learned id the key falls back to the token
        report.user_id = None;
        write_transcripts(&path, std::slice::from_ref(&report)).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["tok"][0], "first");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
