//! Talon - command-line console for a remote forensics server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use talon_core::logging::{init_logging, log_dir, LogConfig};
use talon_core::services::api_config::load_api_config;
use talon_core::{AuthMethod, Endpoint, StreamState, StreamingRow, TalonConfig, TalonState};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "talon")]
#[command(about = "Command-line console for a remote forensics server")]
#[command(version)]
struct Cli {
    /// Config file (TOML or JSON); defaults to the first one found
    #[arg(long, env = "TALON_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `talon_core=debug`
    #[arg(long, env = "TALON_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store credentials for a server
    Configure(ConfigureArgs),
    /// Remove stored credentials
    Clear,
    /// Probe the server and print its version
    Info,
    /// Search enrolled clients
    Clients {
        /// Search expression; empty lists all clients
        #[arg(default_value = "")]
        search: String,
        /// Maximum number of results
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// List hunts
    Hunts,
    /// Call any catalog endpoint by name and print the raw JSON response
    Call(CallArgs),
    /// Run a query
    Query {
        /// Query text
        query: String,
        /// Run on the server instead of through the local client executable
        #[arg(long)]
        remote: bool,
        /// Row limit for remote queries
        #[arg(long)]
        max_rows: Option<u64>,
    },
    /// Follow the push-event stream
    Events {
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Read certificates from a server-generated API client config
    ExtractCerts {
        /// Path to the API client config
        path: PathBuf,
        /// Store the certificates under the data directory and switch to mutual TLS
        #[arg(long)]
        install: bool,
        /// Server URL; defaults to the config's connection string
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(Args)]
struct ConfigureArgs {
    /// Server base URL, e.g. https://dfir.example.com:8889
    #[arg(long, env = "TALON_SERVER_URL")]
    server: String,

    /// API key (bearer token)
    #[arg(long, env = "TALON_API_KEY", conflicts_with_all = ["username", "cert"])]
    api_key: Option<String>,

    /// Basic auth user name
    #[arg(long, requires = "password", conflicts_with = "cert")]
    username: Option<String>,

    /// Basic auth password
    #[arg(long, env = "TALON_PASSWORD", requires = "username")]
    password: Option<String>,

    /// Client certificate (PEM or DER)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PKCS#8, PEM or DER)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// CA certificate for the server
    #[arg(long, requires = "cert")]
    ca: Option<PathBuf>,
}

#[derive(Args)]
struct CallArgs {
    /// Endpoint name, e.g. `get_client` or `list_flows`
    endpoint: String,

    /// Client identifier for client and flow endpoints
    #[arg(long)]
    client: Option<String>,

    /// Flow identifier
    #[arg(long)]
    flow: Option<String>,

    /// Hunt identifier
    #[arg(long)]
    hunt: Option<String>,

    /// Query parameter as `key=value`; may be repeated
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// JSON request body
    #[arg(long)]
    body: Option<String>,
}

impl CallArgs {
    fn endpoint(&self) -> Result<Endpoint> {
        let client = || self.client.clone().context("--client is required for this endpoint");
        let flow = || self.flow.clone().context("--flow is required for this endpoint");
        let hunt = || self.hunt.clone().context("--hunt is required for this endpoint");

        Ok(match self.endpoint.as_str() {
            "server_info" => Endpoint::ServerInfo,
            "list_clients" => Endpoint::ListClients,
            "get_client" => Endpoint::GetClient { client_id: client()? },
            "list_flows" => Endpoint::ListFlows { client_id: client()? },
            "get_flow" => Endpoint::GetFlow { client_id: client()?, flow_id: flow()? },
            "cancel_flow" => Endpoint::CancelFlow { client_id: client()?, flow_id: flow()? },
            "collect_artifact" => Endpoint::CollectArtifact { client_id: client()? },
            "list_hunts" => Endpoint::ListHunts,
            "get_hunt" => Endpoint::GetHunt { hunt_id: hunt()? },
            "create_hunt" => Endpoint::CreateHunt,
            "modify_hunt" => Endpoint::ModifyHunt { hunt_id: hunt()? },
            "list_artifacts" => Endpoint::ListArtifacts,
            "query" => Endpoint::Query,
            other => bail!("Unknown endpoint '{other}'"),
        })
    }
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

impl ConfigureArgs {
    fn auth_method(&self) -> Result<AuthMethod> {
        match (&self.api_key, &self.username, &self.password, &self.cert, &self.key) {
            (Some(token), ..) => Ok(AuthMethod::api_key(token)),
            (None, Some(user), Some(pass), ..) => Ok(AuthMethod::basic(user, pass)),
            (None, None, _, Some(cert), Some(key)) => {
                let method = AuthMethod::mutual_tls(cert, key);
                Ok(match &self.ca {
                    Some(ca) => method.with_ca(ca),
                    None => method,
                })
            }
            _ => bail!("Specify --api-key, --username/--password, or --cert/--key"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new(log_dir());
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter);
    }
    let _logging_guard = init_logging(log_config);

    let config = match &cli.config {
        Some(path) => {
            let mut config = TalonConfig::load_from_file(path)?;
            config.apply_env()?;
            config
        }
        None => TalonConfig::load()?,
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Talon");
    let state = TalonState::new(config);

    let result = run(&state, cli.command).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

async fn run(state: &TalonState, command: Command) -> Result<()> {
    match command {
        Command::Configure(args) => {
            let credentials = state.configure(&args.server, args.auth_method()?)?;
            println!(
                "Configured {} auth for {} ({})",
                credentials.method.kind(),
                credentials.server_url,
                state.credentials().provider_name()
            );
        }
        Command::Clear => {
            state.credentials().clear_credentials()?;
            println!("Credentials cleared");
        }
        Command::Info => {
            let info = state.connect().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Clients { search, limit } => {
            let clients = state.dispatcher().list_clients(&search, limit).await?;
            println!("{}", serde_json::to_string_pretty(&clients)?);
        }
        Command::Hunts => {
            let hunts = state.dispatcher().list_hunts().await?;
            println!("{}", serde_json::to_string_pretty(&hunts)?);
        }
        Command::Call(args) => {
            let endpoint = args.endpoint()?;
            let body = args
                .body
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .context("--body is not valid JSON")?;
            let query: Vec<(&str, String)> =
                args.params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
            let response = state.dispatcher().execute_raw(&endpoint, &query, body.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Query { query, remote, max_rows } => {
            if remote {
                let mut request = talon_core::models::QueryRequest::new(query);
                if let Some(max_rows) = max_rows {
                    request = request.with_max_rows(max_rows);
                }
                for row in state.dispatcher().run_query(&request).await? {
                    print_row(&row)?;
                }
            } else {
                let (handle, mut rows) = state.stream_query(&query)?;
                tracing::debug!(query_id = %handle.id(), "Streaming local query");
                while let Some(row) = rows.next().await {
                    print_row(&row?)?;
                }
            }
        }
        Command::Events { count, seconds } => follow_events(state, count, seconds).await?,
        Command::ExtractCerts { path, install, server } => {
            let api_config = load_api_config(&path)?;
            let bundle = &api_config.bundle;
            println!("common name: {}", bundle.common_name());
            if let Some(conn) = &api_config.connection_string {
                println!("api endpoint: {conn}");
            }

            if install {
                let server = server
                    .or_else(|| api_config.server_url())
                    .context("No --server given and the config has no api_connection_string")?;
                let dir = talon_core::config::default_data_dir().join("identity");
                let credentials =
                    state.bridge().install_bundle(state.credentials(), &server, bundle, &dir)?;
                state.credentials().materialize_identity()?;
                println!("Mutual TLS active for {} ({})", credentials.server_url, dir.display());
            }
        }
    }
    Ok(())
}

async fn follow_events(state: &TalonState, count: Option<usize>, seconds: Option<u64>) -> Result<()> {
    let mut events = state.events().subscribe_all();
    let mut transitions = state.events().subscribe_state();
    state.events().connect().await?;

    let deadline = tokio::time::sleep(seconds.map_or(Duration::MAX, Duration::from_secs));
    tokio::pin!(deadline);

    let mut seen = 0usize;
    let outcome = loop {
        if count.is_some_and(|limit| seen >= limit) {
            break Ok(());
        }
        tokio::select! {
            _ = &mut deadline => break Ok(()),
            next = events.recv() => match next {
                Ok(event) => {
                    seen += 1;
                    println!("{:<20} {}", event.kind(), event.summary());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output fell behind");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
            transition = transitions.recv() => match transition {
                Ok(StreamState::Failed { reason }) => break Err(anyhow!("Event stream failed: {reason}")),
                Ok(StreamState::Reconnecting { attempt }) => eprintln!("reconnecting (attempt {attempt})"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    state.events().disconnect().await;
    outcome
}

fn print_row(row: &StreamingRow) -> Result<()> {
    if row.is_end_of_stream() {
        eprintln!("{} rows", row.final_row_count.unwrap_or_default());
        return Ok(());
    }
    let object: serde_json::Map<String, serde_json::Value> = row
        .columns
        .iter()
        .zip(&row.values)
        .map(|(column, value)| -> Result<(String, serde_json::Value)> {
            Ok((column.clone(), serde_json::to_value(value)?))
        })
        .collect::<Result<_>>()?;
    println!("{}", serde_json::Value::Object(object));
    Ok(())
}
