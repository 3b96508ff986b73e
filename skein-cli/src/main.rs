//! skein: line-oriented front end for the multi-network runtime.
//!
//! Reads commands from stdin and prints every delivered line. Commands:
//!
//!   /net <id>                 switch the active network
//!   /connect <id>             start a configured network
//!   /disconnect [id]          quit without reconnecting
//!   /join <#chan>  /part <#chan>
//!   /msg <target> <text>      /me <target> <text>
//!   /raw <line>
//!   /dcc list | accept <id> | reject <id> | close <id>
//!   /dcc chat <nick> <local-ip>
//!   /stats                    flow statistics of the active network
//!   /quit

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use skein_sdk::config::{self, ClientConfig, SettingsStore};
use skein_sdk::router::{DeliveryKind, RoutedEvent};
use skein_sdk::store::{
    ConversationStore, MemoryStore, MentionNotifier, NoEncryption, TabId, TargetState,
};
use skein_sdk::target::{ConversationTarget, NetworkId};
use skein_sdk::Runtime;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "skein", about = "Multi-network IRC client")]
struct Args {
    /// Config file (defaults to ~/.config/skein/config.toml)
    #[arg(long, env = "SKEIN_CONFIG")]
    config: Option<PathBuf>,

    /// Connect only this network instead of every autoconnect network
    #[arg(long)]
    network: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Prints each appended line, then hands it to the in-memory store.
struct ConsoleStore {
    inner: MemoryStore,
}

impl ConversationStore for ConsoleStore {
    fn target_state(&self, target: &ConversationTarget) -> TargetState {
        self.inner.target_state(target)
    }

    fn active_target(&self, network: &NetworkId) -> Option<ConversationTarget> {
        self.inner.active_target(network)
    }

    fn find_or_create(&self, target: &ConversationTarget) -> TabId {
        self.inner.find_or_create(target)
    }

    fn append(&self, tab: TabId, event: &RoutedEvent) {
        println!("{}", render(event));
        self.inner.append(tab, event);
    }

    fn mark_activity(&self, tab: TabId, highlight: bool) {
        self.inner.mark_activity(tab, highlight);
    }
}

fn render(ev: &RoutedEvent) -> String {
    let time = ev.timestamp.format("%H:%M:%S");
    let from = ev.from.as_deref().unwrap_or("*");
    match ev.kind {
        DeliveryKind::Message => format!("[{time}] {} <{from}> {}", ev.target, ev.text),
        DeliveryKind::Action => format!("[{time}] {} * {from} {}", ev.target, ev.text),
        DeliveryKind::Notice => format!("[{time}] {} -{from}- {}", ev.target, ev.text),
        DeliveryKind::System => format!("[{time}] {} -- {}", ev.target, ev.text),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "skein_cli=info,skein_sdk=info".into());
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let path = args.config.unwrap_or_else(config::default_config_path);
    let cfg = ClientConfig::load_from(&path)?;
    if cfg.networks.is_empty() {
        bail!("no networks configured in {}", path.display());
    }
    tracing::info!(config = %path.display(), networks = cfg.networks.len(), "Starting skein");

    let settings = SettingsStore::new(cfg);
    let runtime = Runtime::new(
        settings,
        Arc::new(ConsoleStore {
            inner: MemoryStore::new(),
        }),
        Arc::new(NoEncryption),
        Arc::new(MentionNotifier),
    );

    let _alerts = runtime.on_alert(|alert| {
        println!("\x07[{}] highlight from {}", alert.network, alert.event.from.as_deref().unwrap_or("?"));
    });
    let _lag = runtime.on_lag(|(network, report)| {
        tracing::debug!(network = %network, lag_ms = report.lag_ms, status = ?report.status, "Lag");
    });
    let _dcc = runtime.dcc().subscribe(|event| {
        tracing::info!(?event, "DCC");
    });

    match &args.network {
        Some(id) => runtime.start_network(&NetworkId::from(id.as_str())).await?,
        None => runtime.start_all().await,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(&runtime, line.trim()).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn active(runtime: &Runtime) -> Result<NetworkId> {
    runtime
        .pool()
        .get_active_network_id()
        .context("no active network")
}

/// Returns `Ok(true)` when the user asked to quit.
async fn handle_line(runtime: &Runtime, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(false);
    }
    let Some(cmd) = line.strip_prefix('/') else {
        bail!("plain text needs a target: /msg <target> <text>");
    };
    let (verb, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
    let rest = rest.trim();

    match verb.to_ascii_lowercase().as_str() {
        "quit" => return Ok(true),
        "net" => {
            let id = NetworkId::from(rest);
            if !runtime.switch_active(&id) {
                bail!("network {id} is not connected");
            }
        }
        "connect" => runtime.start_network(&NetworkId::from(rest)).await?,
        "disconnect" => {
            let id = if rest.is_empty() { active(runtime)? } else { NetworkId::from(rest) };
            runtime.disconnect(&id, None).await?;
        }
        "join" => runtime.handle(&active(runtime)?)?.join(rest).await?,
        "part" => runtime.handle(&active(runtime)?)?.part(rest, None).await?,
        "msg" | "me" => {
            let (target, text) = rest.split_once(' ').context("usage: /msg <target> <text>")?;
            let handle = runtime.handle(&active(runtime)?)?;
            if verb.eq_ignore_ascii_case("me") {
                handle.action(target, text).await?;
            } else {
                handle.privmsg(target, text).await?;
            }
        }
        "raw" => runtime.handle(&active(runtime)?)?.raw(rest).await?,
        "stats" => {
            let stats = runtime.handle(&active(runtime)?)?.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "dcc" => dcc_command(runtime, rest).await?,
        other => bail!("unknown command /{other}"),
    }
    Ok(false)
}

async fn dcc_command(runtime: &Runtime, rest: &str) -> Result<()> {
    let (sub, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    match sub {
        "list" | "" => {
            println!("{}", serde_json::to_string_pretty(&runtime.dcc().sessions())?);
        }
        "accept" | "reject" => {
            let id: u32 = arg.trim().parse().context("usage: /dcc accept|reject <id>")?;
            if !runtime.dcc().decide(id, sub == "accept") {
                bail!("no undecided DCC session {id}");
            }
            if sub == "accept" {
                let dcc = runtime.dcc().clone();
                tokio::spawn(async move {
                    if let Err(e) = dcc.connect(id).await {
                        tracing::warn!(id, error = %e, "DCC connect failed");
                        dcc.close(id);
                    }
                });
            }
        }
        "close" => {
            let id: u32 = arg.trim().parse().context("usage: /dcc close <id>")?;
            if !runtime.dcc().close(id) {
                bail!("no DCC session {id}");
            }
        }
        "chat" => {
            let (nick, ip) = arg.trim().split_once(' ').context("usage: /dcc chat <nick> <local-ip>")?;
            let ip: Ipv4Addr = ip.trim().parse().context("local ip must be a dotted quad")?;
            let network = active(runtime)?;
            let handle = runtime.handle(&network)?;
            let (session, line) = runtime.dcc().offer_chat(&network, nick, ip).await?;
            handle.raw(&line).await?;
            println!("DCC #{} offered to {nick} on port {}", session.id, session.port);
        }
        other => bail!("unknown /dcc subcommand {other}"),
    }
    Ok(())
}
