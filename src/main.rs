//! CLI for keyrelay
//!
//! Subcommands:
//! - `server`: run the relay
//! - `subscribe`: follow one or more keys and print every publish
//! - `publish`: push a JSON body to a key (webhook style)
//! - `call`: request/response over a channel

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};

use keyrelay::broker::Broker;
use keyrelay::broker::engine;
use keyrelay::client::{ClientEvent, ClientOptions, Gateway, SubscriberClient, key_from_path};
use keyrelay::config::{Settings, load_config_from};
use keyrelay::persistence::{MemoryStore, SledStore};
use keyrelay::transport::start_websocket_server;
use keyrelay::utils::logging;

#[derive(Parser, Debug)]
#[command(name = "keyrelay", version)]
#[command(about = "Keyed pub/sub relay with last-value cache")]
struct Cli {
    /// Configuration file (defaults to `config/default.*` when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides `log.level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the WebSocket relay
    Server,
    /// Subscribe to keys and print each published envelope as a JSON line
    Subscribe {
        /// Relay URL, overrides `client.url`
        #[arg(long)]
        url: Option<String>,
        /// Keys to follow; `_all_` follows everything
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Publish a JSON body to a key
    #[command(group(ArgGroup::new("target").required(true).args(["key", "key_path"])))]
    Publish {
        #[arg(long)]
        url: Option<String>,
        /// Key to publish to
        #[arg(long)]
        key: Option<String>,
        /// Dotted path into the body that holds the key, e.g. `order.id`
        #[arg(long)]
        key_path: Option<String>,
        /// JSON body; read from stdin when absent
        #[arg(long)]
        data: Option<String>,
    },
    /// Send a request on `<channel>.q` and print the answer from `<channel>.a`
    Call {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        channel: String,
        /// JSON request body
        #[arg(long)]
        request: String,
        /// Overrides `gateway.response_timeout_secs`
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = load_config_from(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log.level));

    let result = match cli.command {
        Command::Server => run_server(&settings).await,
        Command::Subscribe { url, keys } => {
            run_subscribe(&settings, url.unwrap_or_else(|| settings.client.url.clone()), keys)
                .await
        }
        Command::Publish {
            url,
            key,
            key_path,
            data,
        } => {
            let url = url.unwrap_or_else(|| settings.client.url.clone());
            run_publish(&settings, url, key, key_path, data).await
        }
        Command::Call {
            url,
            channel,
            request,
            timeout_secs,
        } => {
            let url = url.unwrap_or_else(|| settings.client.url.clone());
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.gateway.response_timeout());
            run_call(url, timeout, &channel, &request).await
        }
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

async fn run_server(settings: &Settings) -> Result<()> {
    let addr = settings.server.addr();
    let broker = if settings.store.in_memory {
        info!("using in-memory last-value store");
        Broker::new(MemoryStore::new())
    } else {
        info!("using sled last-value store at {}", settings.store.path);
        let store = SledStore::open(&settings.store.path)
            .with_context(|| format!("failed to open store at {}", settings.store.path))?;
        Broker::new(store)
    }
    .into_shared();

    tokio::select! {
        res = start_websocket_server(&addr, broker.clone()) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    engine::lock(&broker).flush_store();
    Ok(())
}

async fn run_subscribe(settings: &Settings, url: String, keys: Vec<String>) -> Result<()> {
    let options = ClientOptions {
        url,
        ..ClientOptions::from(&settings.client)
    };
    let (handle, mut events) = SubscriberClient::start(options);
    for key in keys {
        handle.subscribe(key);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Publish(envelope)) => println!("{}", envelope.to_text()?),
                Some(ClientEvent::Subscribed(ack)) => {
                    if let Some(cached) = ack.cached_value {
                        println!("{}", cached.to_text()?);
                    }
                }
                Some(ClientEvent::Status(status)) => info!("connection status: {status}"),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                handle.stop();
                break;
            }
        }
    }

    Ok(())
}

async fn run_publish(
    settings: &Settings,
    url: String,
    key: Option<String>,
    key_path: Option<String>,
    data: Option<String>,
) -> Result<()> {
    let raw = match data {
        Some(data) => data,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read body from stdin")?;
            buf
        }
    };
    let body: Value = serde_json::from_str(&raw).context("body is not valid JSON")?;

    let key = match (key, key_path) {
        (Some(key), _) => key,
        (None, Some(path)) => key_from_path(&body, &path)?,
        (None, None) => anyhow::bail!("either --key or --key-path is required"),
    };

    let sent = Gateway::from_settings(url, &settings.gateway)
        .publish(&key, body)
        .await?;
    println!("{}", sent.to_text()?);
    Ok(())
}

async fn run_call(url: String, timeout: Duration, channel: &str, request: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(request).context("request is not valid JSON")?;
    let answer = Gateway::new(url, timeout).request(channel, payload).await?;

    match answer.get("output").and_then(Value::as_str) {
        Some(output) => println!("{output}"),
        None => println!("{answer}"),
    }
    Ok(())
}
