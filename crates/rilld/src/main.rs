//! rilld - streaming query-execution gateway
//!
//! Usage:
//!   # With a config file
//!   rilld --config rill.yaml
//!
//!   # Everything from flags / environment
//!   rilld --supabase-url https://meta.example.com \
//!         --supabase-key $SERVICE_KEY \
//!         --port 8080 --max-workers 3

use clap::Parser;
use rilld::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    rilld::server::run(cli).await
}

fn print_banner() {
    eprintln!(
        r#"
        _ _ _
  _ __(_) | |
 | '__| | | |
 | |  | | | |
 |_|  |_|_|_|

Streaming Query-Execution Gateway v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
