//! ocsip — command-line OCS/LCS client.
//!
//! Signs a single account in, prints presence and message traffic, and
//! keeps the registration alive until Ctrl-C. Useful for interop testing
//! against a pool without a full IM frontend.

use clap::Parser;
use ocsip::sip::{spawn, NoSrvResolver, NullProvider};
use ocsip::{AccountConfig, ClientEvent, Command, TransportSetting};
use std::sync::Arc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ocsip", version, about = "SIP/SIMPLE client for OCS/LCS")]
struct Args {
    /// Sign-in name: user@domain[,domain\authuser]
    #[arg(short, long)]
    user: String,

    /// Password; prefer the OCSIP_PASSWORD environment variable
    #[arg(short, long, env = "OCSIP_PASSWORD", hide_env_values = true)]
    password: String,

    /// Transport: auto, tls, tcp, udp
    #[arg(short, long, default_value = "auto")]
    transport: TransportSetting,

    /// Connect to this server instead of SRV discovery
    #[arg(short, long)]
    server: Option<String>,

    /// Server port (with --server)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ocsip=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match AccountConfig::from_signin_name(&args.user, &args.password) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid sign-in name: {}", e);
            return;
        }
    };
    cfg.transport = args.transport;
    cfg.server = args.server;
    cfg.port = args.port;

    info!("ocsip v{} — signing in as {}", VERSION, cfg.username);

    // NTLM/Kerberos need an OS security package wired in through the
    // SecurityProvider trait; the stock binary authenticates with Digest.
    let handle = spawn(cfg, Arc::new(NullProvider), Arc::new(NoSrvResolver));
    let commands = handle.commands.clone();
    let watcher_commands = commands.clone();
    let mut events = handle.events;

    let mut printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connecting => info!("connecting..."),
                ClientEvent::Registered => info!("registered"),
                ClientEvent::Terminated { reason, fatal } => {
                    if fatal {
                        error!("signed off: {}", reason);
                    } else {
                        info!("signed off: {}", reason);
                    }
                    break;
                }
                ClientEvent::BuddyStatus { uri, activity, note, .. } => match note {
                    Some(note) => info!("{} is {} ({})", uri, activity, note),
                    None => info!("{} is {}", uri, activity),
                },
                ClientEvent::ImReceived { from, text, chat_id } => match chat_id {
                    Some(id) => info!("[chat {}] {}: {}", id, from, text),
                    None => info!("{}: {}", from, text),
                },
                ClientEvent::ImUndelivered { with, text } => {
                    warn!("could not deliver to {}: {}", with, text)
                }
                ClientEvent::Typing { from } => info!("{} is typing...", from),
                ClientEvent::AuthorizationRequested { uri, .. } => {
                    // Headless: allow everyone who asks.
                    info!("authorizing watcher {}", uri);
                    let _ = watcher_commands.send(Command::AuthorizeWatcher { uri, allow: true });
                }
                ClientEvent::ChatOpened { chat_id } => info!("chat {} opened", chat_id),
                ClientEvent::ChatUserJoined { chat_id, uri } => {
                    info!("chat {}: {} joined", chat_id, uri)
                }
                ClientEvent::ChatUserLeft { chat_id, uri } => {
                    info!("chat {}: {} left", chat_id, uri)
                }
                other => info!("{:?}", other),
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("signing out...");
            let _ = commands.send(Command::Quit);
            let _ = (&mut printer).await;
        }
        _ = &mut printer => {}
    }
}
