use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modkit_graphql::{GraphQlClientFactory, GraphQlOptions, GraphQlRequest};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// GraphQL client driver - runs queries through the authenticated client factory
#[derive(Parser)]
#[command(name = "graphql-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and print it with secrets redacted
    Check,
    /// Send a GraphQL query and print the response envelope
    Query {
        /// Named client from the `clients` section; the default client otherwise
        #[arg(long)]
        client: Option<String>,
        /// Query text, or `@path` to read it from a file
        #[arg(short, long)]
        query: String,
        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,
        #[arg(long)]
        operation_name: Option<String>,
    },
    /// Force a token refresh for the default credentials
    RefreshToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    if let Some(path) = cli.config.as_deref()
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    let options = GraphQlOptions::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_ctrl_c().await;
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Check => check(&options),
        Commands::Query {
            client,
            query,
            variables,
            operation_name,
        } => {
            let request = build_request(&query, variables.as_deref(), operation_name)?;
            run_query(options, client.as_deref(), &request, &cancel).await
        }
        Commands::RefreshToken => refresh_token(options, &cancel).await,
    }
}

fn init_logging(verbose: u8, json: bool) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal, cancelling"),
        Err(e) => tracing::error!(%e, "Error handling Ctrl+C signal"),
    }
}

fn check(options: &GraphQlOptions) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", serde_json::to_string_pretty(options)?);
    Ok(())
}

fn load_query(raw: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read query file {path}")),
        None => Ok(raw.to_owned()),
    }
}

fn build_request(
    query: &str,
    variables: Option<&str>,
    operation_name: Option<String>,
) -> Result<GraphQlRequest> {
    let mut request = GraphQlRequest::new(load_query(query)?);
    if let Some(raw) = variables {
        let parsed: Value = serde_json::from_str(raw).context("--variables is not valid JSON")?;
        anyhow::ensure!(parsed.is_object(), "--variables must be a JSON object");
        request = request.with_variables(parsed);
    }
    if let Some(name) = operation_name {
        request = request.with_operation_name(name);
    }
    Ok(request)
}

async fn run_query(
    options: GraphQlOptions,
    client: Option<&str>,
    request: &GraphQlRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let factory = GraphQlClientFactory::builder(options).build()?;
    let client = match client {
        Some(name) => factory.create_client_by_name(name, cancel).await?,
        None => factory.create_client(cancel).await?,
    };
    tracing::debug!(endpoint = %client.endpoint(), "sending query");

    let response = client.send_query::<Value, Value>(request, cancel).await?;
    if response.errors.as_ref().is_some_and(|e| !e.is_empty()) {
        tracing::warn!("GraphQL response carries errors");
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn refresh_token(options: GraphQlOptions, cancel: &CancellationToken) -> Result<()> {
    let factory = GraphQlClientFactory::builder(options).build()?;
    if factory.refresh_token(cancel).await? {
        println!("Token refreshed");
    } else {
        println!("No token obtained; check client_id/client_secret");
    }
    Ok(())
}
