use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scriptbox::capabilities::{connector_bindings, connector_js_backend};
use scriptbox::{Config, Sandbox};

fn print_help() {
    println!(
        "\
scriptbox v{}

Runs an untrusted JavaScript script against JSON payloads in a sandbox.

USAGE:
    scriptbox [OPTIONS] SCRIPT PAYLOADS

ARGUMENTS:
    SCRIPT      Path to the script source file
    PAYLOADS    Path to a JSON file holding one payload object or an array
                of payloads, or - to read it from stdin

OPTIONS:
    -c, --config PATH    Path to TOML configuration file [default: built-in defaults]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

OUTPUT:
    One outcome per payload ({{logs, result, error}}) as JSON on stdout.
    An array of payloads yields an array of outcomes in input order.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, scriptbox=debug,warn)

EXAMPLES:
    scriptbox script.js payloads.json
    scriptbox --config scriptbox.toml script.js payloads.json
    echo '{{\"user\": {{}}}}' | scriptbox script.js -",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config: Option<String>,
    script: String,
    payloads: String,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scriptbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config requires a path"))?;
                config = Some(path);
            }
            "-" => positional.push(arg),
            other if other.starts_with('-') => bail!("unknown option '{other}' (see --help)"),
            _ => positional.push(arg),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([script, payloads]) => Ok(Args {
            config,
            script,
            payloads,
        }),
        Err(_) => bail!("expected SCRIPT and PAYLOADS arguments (see --help)"),
    }
}

fn read_payloads(path: &str) -> Result<Value> {
    let content = if path == "-" {
        std::io::read_to_string(std::io::stdin()).context("cannot read payloads from stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("cannot read payloads from {path}"))?
    };
    serde_json::from_str(&content).with_context(|| format!("invalid payload JSON in {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Logs go to stderr, stdout is reserved for outcomes
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scriptbox=info")),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };
    info!(
        "Timeout: {:?}, total timeout: {:?}, concurrency: {}",
        config.sandbox.timeout, config.sandbox.total_timeout, config.sandbox.concurrency
    );

    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("cannot read script {}", args.script))?;
    let payloads = read_payloads(&args.payloads)?;

    let sandbox = Sandbox::new(
        source,
        connector_bindings(&config),
        config.sandbox.clone(),
        Arc::new(connector_js_backend(&config)),
    )?;
    if let Some(e) = sandbox.compile_error() {
        warn!("Script does not compile, every run will report it: {e}");
    }

    let output = tokio::select! {
        output = async {
            match payloads {
                Value::Array(items) => {
                    info!("Running batch of {} payloads", items.len());
                    serde_json::to_string_pretty(&sandbox.run_many(items).await)
                }
                single => serde_json::to_string_pretty(&sandbox.run_one(single).await),
            }
        } => output?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            return Ok(());
        }
    };

    println!("{output}");
    Ok(())
}
