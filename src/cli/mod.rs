//! CLI commands for chatrelay using clap.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;

use crate::agent::Agent;
use crate::config::{load_settings, Settings};
use crate::executor::Executor;
use crate::hub::{run_hub, Delivery, Hub, HubOptions};
use crate::store::Store;
use crate::telegram::{Messenger, OfflineMessenger, TelegramMessenger};

/// chatrelay - relay chat commands to remote agents.
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "Relay Telegram commands to remote agents and queue messages for offline users", long_about = None)]
pub struct Commands {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the hub: Telegram poll loop plus HTTP listener
    Hub {
        /// Address to listen on (default from settings)
        #[arg(long, env = "CHATRELAY_LISTEN")]
        listen: Option<SocketAddr>,

        /// Data directory for users and queues
        #[arg(long, env = "CHATRELAY_DATA")]
        data: Option<PathBuf>,
    },

    /// Run an agent that registers with a hub and executes scripts
    Agent {
        /// Name the agent registers under
        #[arg(long, env = "CHATRELAY_AGENT_NAME")]
        name: Option<String>,

        /// Hub base URL
        #[arg(long, env = "CHATRELAY_UPSTREAM")]
        upstream: Option<String>,

        /// Address to listen on
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Directory holding the <command>.sh scripts
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },

    /// Send a message to a user through the hub
    Send {
        /// Recipient user name
        to: String,

        /// Message text
        #[arg(required = true)]
        text: Vec<String>,

        /// Hub base URL (default: agent.upstream from settings)
        #[arg(long, env = "CHATRELAY_UPSTREAM")]
        hub: Option<String>,

        /// Data directory used when the hub is unreachable
        #[arg(long, env = "CHATRELAY_DATA")]
        data: Option<PathBuf>,
    },

    /// Run one script locally, as an agent would
    Exec {
        /// Command name (script without .sh)
        command: String,

        /// Arguments passed to the script
        args: Vec<String>,

        /// Sender identity exposed to the script
        #[arg(long, default_value = "cli")]
        from: String,

        /// Directory holding the scripts
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Hub { listen, data } => cmd_hub(*listen, data.as_deref()).await,
            Command::Agent {
                name,
                upstream,
                listen,
                base_dir,
            } => cmd_agent(name, upstream, *listen, base_dir.as_deref()).await,
            Command::Send {
                to,
                text,
                hub,
                data,
            } => cmd_send(to, text, hub.as_deref(), data.as_deref()).await,
            Command::Exec {
                command,
                args,
                from,
                base_dir,
            } => cmd_exec(command, args, from, base_dir.as_deref()).await,
        }
    }
}

// Command implementations

async fn cmd_hub(listen: Option<SocketAddr>, data: Option<&Path>) -> Result<()> {
    let settings = load_settings()?;
    let listen = match listen {
        Some(listen) => listen,
        None => settings
            .hub
            .listen
            .parse()
            .with_context(|| format!("Invalid hub listen address {}", settings.hub.listen))?,
    };
    let data_dir = match data {
        Some(dir) => dir.to_path_buf(),
        None => settings.hub.data_dir()?,
    };

    tracing::info!("Starting hub on {}", listen);
    run_hub(&settings, listen, &data_dir).await?;
    Ok(())
}

async fn cmd_agent(
    name: &Option<String>,
    upstream: &Option<String>,
    listen: Option<SocketAddr>,
    base_dir: Option<&Path>,
) -> Result<()> {
    let mut settings = load_settings()?;
    if let Some(dir) = base_dir {
        settings.executor.base_dir = Some(dir.to_path_buf());
    }

    let executor = Executor::from_config(&settings.executor)?;
    let agent = Agent::from_settings(&settings, name.clone(), upstream.clone(), listen, executor)?;
    Arc::new(agent).run().await?;
    Ok(())
}

async fn cmd_send(to: &str, text: &[String], hub: Option<&str>, data: Option<&Path>) -> Result<()> {
    let text = text.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("Nothing to send");
    }

    let settings = load_settings()?;
    let hub_url = hub.unwrap_or(&settings.agent.upstream);

    match post_to_hub(hub_url, to, &text).await {
        Ok((status, body)) => {
            println!("{}", body.trim());
            if !status.is_success() {
                anyhow::bail!("Hub answered {}", status);
            }
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Hub at {} unreachable ({}), delivering directly", hub_url, e);
            send_direct(&settings, to, &text, data).await
        }
    }
}

/// `POST <hub>/message/<to>`; only transport failures are errors.
async fn post_to_hub(hub_url: &str, to: &str, text: &str) -> Result<(reqwest::StatusCode, String)> {
    let mut url = Url::parse(hub_url).with_context(|| format!("Invalid hub URL {}", hub_url))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Invalid hub URL {}", hub_url))?
        .pop_if_empty()
        .push("message")
        .push(to);

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()?;
    let response = client.post(url).body(text.to_string()).send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok((status, body))
}

/// Deliver without a running hub by taking over its data directory.
async fn send_direct(settings: &Settings, to: &str, text: &str, data: Option<&Path>) -> Result<()> {
    let data_dir = match data {
        Some(dir) => dir.to_path_buf(),
        None => settings.hub.data_dir()?,
    };

    let mut store = Store::acquire(&data_dir)?;
    if let Err(e) = store.load() {
        tracing::warn!("Starting with empty state: {}", e);
    }

    let messenger: Arc<dyn Messenger> = match settings.bot_token() {
        Ok(token) => Arc::new(TelegramMessenger::new(token)),
        Err(_) => Arc::new(OfflineMessenger),
    };
    let hub = Hub::new(store, messenger, HubOptions::from_settings(settings))?;

    match hub.deliver_or_queue(to, text).await? {
        Delivery::Sent => println!("sent to {}", to),
        Delivery::Queued => println!("queued for {}", to),
    }
    Ok(())
}

async fn cmd_exec(command: &str, args: &[String], from: &str, base_dir: Option<&Path>) -> Result<()> {
    let mut settings = load_settings()?;
    if let Some(dir) = base_dir {
        settings.executor.base_dir = Some(dir.to_path_buf());
    }

    // Output is mirrored to stdout while the script runs.
    let executor = Executor::from_config(&settings.executor)?;
    let execution = executor.execute(command, args, from).await;
    execution.result?;
    Ok(())
}
