use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use keyserver_conn::{
    classify, load_settings,
    session::{set_new_session, ClientSessionChange},
    CallKeyserverEndpoint, CallOptions, ConnectionContext, Endpoint, KeyserverConnections,
    KeyserverRequests, MemoryStore, SessionRecovery,
};
use serde_json::Value;
use shared::domain::KeyserverId;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// TOML settings file; defaults to `keyserver_conn.toml` when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calls one endpoint on every listed keyserver with the same input.
    Call {
        endpoint: String,
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long = "keyserver", required = true)]
        keyservers: Vec<String>,
        /// Seeds a session cookie, as `keyserver_id=cookie`.
        #[arg(long = "cookie")]
        cookies: Vec<String>,
    },
    /// Prints the transport affinity and response shape of an endpoint.
    Classify { endpoint: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Classify { endpoint } => {
            let info = classify(&endpoint).ok_or_else(|| anyhow!("unknown endpoint: {endpoint}"))?;
            println!(
                "{} affinity={:?} response={:?}",
                info.endpoint, info.affinity, info.response_shape
            );
        }
        Command::Call {
            endpoint,
            input,
            keyservers,
            cookies,
        } => {
            let endpoint: Endpoint = endpoint.parse()?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let settings = load_settings(cli.config.as_deref())?;

            let store = Arc::new(MemoryStore::from_config(&settings));
            for cookie in &cookies {
                let (keyserver_id, cookie) = cookie
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--cookie expects keyserver_id=cookie, got {cookie}"))?;
                let change = ClientSessionChange::Valid {
                    current_user_info: None,
                    cookie: Some(cookie.to_string()),
                    session_id: None,
                };
                let keyserver_id = KeyserverId::from(keyserver_id);
                set_new_session(store.as_ref(), change, None, None, None, &keyserver_id);
            }

            let ctx = Arc::new(ConnectionContext::new(settings, store));
            let recovery = Arc::new(SessionRecovery::new(ctx.clone(), None, None));
            let connections = KeyserverConnections::new(ctx, recovery);

            let requests: KeyserverRequests = keyservers
                .into_iter()
                .map(|id| (KeyserverId(id), input.clone()))
                .collect();
            info!(endpoint = %endpoint, keyservers = requests.len(), "calling keyservers");
            let results = connections
                .call_many_settled(endpoint, requests, CallOptions::default())
                .await;

            let mut failed = false;
            for (keyserver_id, result) in results {
                match result {
                    Ok(response) => println!("{keyserver_id}: {response}"),
                    Err(err) => {
                        failed = true;
                        eprintln!("{keyserver_id}: error: {err}");
                    }
                }
            }
            if failed {
                return Err(anyhow!("at least one keyserver call failed"));
            }
        }
    }

    Ok(())
}
