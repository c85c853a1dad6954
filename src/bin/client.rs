//! Local proxy binary
//!
//! Usage: sockscipher-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (.toml or .json)
//!   -g, --generate       Print a local configuration template
//!   -h, --help           Print help information

use std::env;

use sockscipher::{Config, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_local(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"sockscipher-local - SOCKS5/SOCKS4/HTTP front end for the encrypted tunnel

USAGE:
    sockscipher-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (.toml or .json)
    -g, --generate       Print a local configuration template
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (TOML):
    server_host = "proxy.example.com"
    server_port = 8443
    local_host = "127.0.0.1"
    local_port = 1080
    method = "aes-256-gcm"
    key = "<base64, from sockscipher-server --generate>"
    local_mode = "tunnel"

    [tls]
    enabled = true

EXAMPLES:
    Write a template:
        sockscipher-local --generate > local.toml

    Run the proxy:
        sockscipher-local --config local.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let mut config = Config::default();
    config.password = "change-me".into();

    println!("# sockscipher local configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config.to_toml()?);

    Ok(())
}

async fn run_local(config_path: &str) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;

    tracing::info!(
        "Starting local proxy on {} ({:?} mode)",
        config.local_addr(),
        config.local_mode
    );

    let worker = Worker::with_system_resolver(config);
    let addr = worker
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start: {}", e))?;
    tracing::info!("Local proxy ready on {} (SOCKS5, SOCKS4, HTTP)", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        "Shutting down, {} connection(s) open",
        worker.current_connections()
    );

    if let Some(report) = worker.metrics_report() {
        tracing::info!("\n{}", report);
    }
    worker.stop().await;

    Ok(())
}
