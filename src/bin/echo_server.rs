#![forbid(unsafe_code)]

//! Reference echo server - answers every `ping` with a `pong` on the same
//! connection. A protocol target for manual testing, not part of a load run.

use anyhow::Result;
use chatswarm::server::EchoServer;

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
            "--help" | "-h" => {
                println!("echo_server - ping/pong echo target");
                println!("\nOptions:");
                println!("  --port <PORT>   Listen port (default: PORT env or 8081)");
                return Ok(());
            }
            _ => {
                i += 1;
            }
        }
    }

    EchoServer::new().serve(port).await
}
