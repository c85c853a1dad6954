//! Tunnel server binary
//!
//! Usage: sockscipher-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (.toml or .json)
//!   -g, --generate       Generate a new server configuration
//!   -h, --help           Print help information

use std::env;

use base64::{engine::general_purpose::STANDARD, Engine};

use sockscipher::crypto::SecureRandom;
use sockscipher::{Config, ServerWorker};

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
            run_server(&args[2]).await?;
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
        r#"sockscipher-server - encrypted tunnel endpoint

USAGE:
    sockscipher-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (.toml or .json)
    -g, --generate       Generate a new server configuration
    -h, --help           Print help information

EXAMPLES:
    Generate a new configuration:
        sockscipher-server --generate > server.toml

    Run the server:
        sockscipher-server --config server.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let mut config = Config {
        server_host: "0.0.0.0".into(),
        ..Config::default()
    };
    let key = SecureRandom::vec(config.method.key_size());
    config.key = Some(STANDARD.encode(&key));

    println!("# sockscipher server configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config.to_toml()?);
    println!();
    println!("# Client settings (copy into local.toml):");
    println!("#   method = \"{}\"", config.method);
    println!("#   key = \"{}\"", STANDARD.encode(&key));
    println!("#   server_host = \"YOUR_SERVER_IP\"");
    println!("#   server_port = {}", config.server_port);

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;

    tracing::info!(
        "Starting tunnel server on {} ({}, TLS {})",
        config.server_addr(),
        config.method,
        if config.tls.enabled { "on" } else { "off" }
    );

    let worker = ServerWorker::with_system_resolver(config);
    let addr = worker
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start: {}", e))?;
    tracing::info!("Tunnel server ready on {}", addr);

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
