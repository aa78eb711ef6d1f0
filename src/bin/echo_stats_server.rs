#![forbid(unsafe_code)]

//! Reference echo server, counting variant - tracks connected count and
//! per-connection message counts, resets them when the designated first
//! connection pings, and delays each pong to model blocking work.

use anyhow::Result;
use chatswarm::server::{EchoStatsServer, DEFAULT_PONG_DELAY};
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
    let mut port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8081);
    let mut delay = DEFAULT_PONG_DELAY;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse().unwrap_or(port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--delay-ms" => {
                if i + 1 < args.len() {
                    if let Ok(ms) = args[i + 1].parse() {
                        delay = Duration::from_millis(ms);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("echo_stats_server - counting echo target with artificial delay");
                println!("\nOptions:");
                println!("  --port <PORT>     Listen port (default: PORT env or 8081)");
                println!("  --delay-ms <MS>   Delay before each pong (default: 100)");
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    EchoStatsServer::new(delay).serve(port).await
}
