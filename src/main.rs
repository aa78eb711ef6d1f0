#![forbid(unsafe_code)]

//! chatswarm - load driver for the event-protocol chat platform
//!
//! Usage:
//!   cargo run -- --users 50 --duration 60
//!   cargo run -- --users 500 --processes 10 --url http://platform:8080
//!   cargo run -- --mode connect --users 200 --url http://localhost:8081

use anyhow::Result;
use chatswarm::driver::{self, Mode, SimConfig};
use chatswarm::sim::{default_profiles, UserProfile};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatswarm=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = SimConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    config.mode = match args[i + 1].as_str() {
                        "simulate" => Mode::Simulate,
                        "connect" => Mode::Connect,
                        other => {
                            eprintln!("Unknown mode '{}', using simulate", other);
                            Mode::Simulate
                        }
                    };
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--url" => {
                if i + 1 < args.len() {
                    config.base_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--users" | "-u" => {
                if i + 1 < args.len() {
                    config.users = args[i + 1].parse().unwrap_or(config.users);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--processes" | "-p" => {
                if i + 1 < args.len() {
                    config.processes = args[i + 1].parse::<usize>().unwrap_or(1).max(1);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--messages" => {
                if i + 1 < args.len() {
                    config.messages_per_user =
                        args[i + 1].parse().unwrap_or(config.messages_per_user);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--interval-ms" => {
                if i + 1 < args.len() {
                    if let Ok(ms) = args[i + 1].parse() {
                        config.message_interval = Duration::from_millis(ms);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--jitter-ms" => {
                if i + 1 < args.len() {
                    if let Ok(ms) = args[i + 1].parse() {
                        config.message_jitter = Duration::from_millis(ms);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--passive" => {
                config.passive = true;
                i += 1;
            }
            "--report-secs" => {
                if i + 1 < args.len() {
                    config.report_period = match args[i + 1].parse::<u64>() {
                        Ok(0) => None,
                        Ok(secs) => Some(Duration::from_secs(secs)),
                        Err(_) => config.report_period,
                    };
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if i + 1 < args.len() {
                    if let Ok(secs) = args[i + 1].parse() {
                        config.duration = Duration::from_secs(secs);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--treatments" => {
                if i + 1 < args.len() {
                    config.profiles = parse_treatments(&args[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            // Internal: set by the parent when fanning out worker processes
            "--worker" => {
                if i + 1 < args.len() {
                    config.worker = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    // Parent of a multi-process run only fans out and waits
    if config.processes > 1 && config.worker.is_none() {
        return driver::spawn_workers(config.processes).await;
    }

    if let (Some(worker), Some(path)) = (config.worker, config.output.clone()) {
        config.output = Some(driver::worker_output_path(&path, worker));
    }

    driver::run_batch(config).await
}

/// Overrides the built-in profile roster: a comma-separated list of
/// treatment ids, each paired with a view text cycled from the defaults.
fn parse_treatments(list: &str) -> Vec<UserProfile> {
    let defaults = default_profiles();
    let profiles: Vec<UserProfile> = list
        .split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .enumerate()
        .map(|(i, treatment)| UserProfile {
            treatment,
            view: defaults[i % defaults.len()].view.clone(),
        })
        .collect();
    if profiles.is_empty() {
        eprintln!("No valid treatments in '{list}', using the built-in roster");
        defaults
    } else {
        profiles
    }
}

fn print_usage() {
    println!("chatswarm - load driver for the event-protocol chat platform");
    println!("\nUsage:");
    println!("  cargo run -- [OPTIONS]");
    println!("\nOptions:");
    println!("  -m, --mode <MODE>        simulate (full user lifecycle) or connect");
    println!("                           (echo-server ping test) (default: simulate)");
    println!("  --url <URL>              Platform base URL (default: http://localhost:8080)");
    println!("  -u, --users <N>          Simulated users per process (default: 50)");
    println!("  -p, --processes <N>      Worker processes to fan out across (default: 1)");
    println!("  --messages <N>           Messages per user after the opener (default: 10)");
    println!("  --interval-ms <MS>       Pause between messages (default: 2000)");
    println!("  --jitter-ms <MS>         Random spread applied to the pause (default: 500)");
    println!("  --passive                Reply to partner messages instead of a fixed count");
    println!("  --report-secs <SECS>     Stats reporting interval, 0 disables (default: 5)");
    println!("  -d, --duration <SECS>    Run deadline (default: 60)");
    println!("  -o, --output <PATH>      Write per-user transcripts to a JSON file");
    println!("  --treatments <LIST>      Comma-separated treatment ids, e.g. 1,5");
    println!("  -h, --help               Print this help message");
    println!("\nExamples:");
    println!("  # 50 users against a local platform");
    println!("  cargo run -- --users 50 --duration 60");
    println!("");
    println!("  # 500 connections spread over 10 processes");
    println!("  cargo run -- --mode connect --users 50 --processes 10 --url http://localhost:8081");
    println!("");
    println!("  # passive responders, transcripts saved at the end");
    println!("  cargo run -- --users 20 --passive --output transcripts.json");
    println!("\nEnvironment Variables:");
    println!("  RUST_LOG=debug          Enable debug logging");
    println!("  RUST_LOG=info           Enable info logging");
}
