//! relay - multi-client text chat relay
//!
//! **Server mode** (`relay server`): listens for clients and reads operator
//! commands (`/list`, `/kick <index>`, `/msg <text>`, `/help`, `/close`)
//! from stdin.
//!
//! **Client mode** (`relay client`): joins a server under a unique name and
//! relays lines typed on stdin (`/msg <target> <text>`, `/list`, `/exit`).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::admin::Admin;
use relay::client::{Client, ClientError, Inbound};
use relay::config::ServerConfig;
use relay::server::{self, ServeOptions};
use relay::session::SessionRegistry;

/// relay - multi-client text chat relay
#[derive(ClapParser, Debug)]
#[command(name = "relay", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server with an operator console on stdin
    Server {
        /// Address to bind (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Path to a TOML config file
        #[arg(long, env = "RELAY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Connect to a relay server as a chat client
    Client {
        /// Server address (host:port)
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// Name to join with; prompted for if omitted
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Server { bind, config } => run_server(bind, config).await,
        Commands::Client { addr, name } => run_client(addr, name).await,
    }
}

/// Tracing goes to stderr so it does not mix with console output on stdout.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Read stdin lines on a plain thread; a blocked stdin read must not keep
/// the runtime from shutting down.
fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(bind: Option<SocketAddr>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => ServerConfig::load(path)?
            .with_context(|| format!("config file not found: {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let listener = server::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let registry = SessionRegistry::new();
    let cancel = CancellationToken::new();
    let options = ServeOptions::from_config(&config);
    let admin = Admin::new(registry.clone(), options.catalog.clone(), cancel.clone());

    println!("Server started on {}. Type /help for operator commands.", listener.local_addr()?);

    let mut serve_handle = tokio::spawn(server::serve(listener, registry, options, cancel.clone()));

    let console_admin = admin.clone();
    let console = tokio::spawn(async move {
        if let Err(e) = console_admin.run_console(spawn_stdin_lines(), tokio::io::stdout()).await {
            tracing::warn!(?e, "operator console failed");
        }
    });

    tokio::select! {
        result = &mut serve_handle => {
            result.context("accept loop panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
            admin.shutdown().await;
            serve_handle.await.context("accept loop panicked")??;
        }
    }

    console.abort();
    println!("Server closed.");
    Ok(())
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_client(addr: String, name: Option<String>) -> anyhow::Result<()> {
    let mut client = Client::connect(&addr)
        .await
        .with_context(|| format!("unable to connect to {addr}"))?;
    println!("Connection established!");

    let mut lines = spawn_stdin_lines();
    let mut candidate = name;
    loop {
        let name = match candidate.take() {
            Some(name) => name,
            None => {
                println!("Input your name, please note that names are UNIQUE:");
                match lines.recv().await {
                    Some(line) => line.trim().to_string(),
                    None => return Ok(()),
                }
            }
        };
        match client.join(&name).await {
            Ok(()) => break,
            Err(e @ (ClientError::NameTaken(_) | ClientError::InvalidName(_) | ClientError::Rejected(_))) => {
                println!("{e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!(
        "Access granted! Send messages with /msg <target client> <message>, \
         list clients with /list, leave with /exit."
    );

    loop {
        tokio::select! {
            event = client.next_event() => match event? {
                Some(Inbound::Message(text)) | Some(Inbound::Notice(text)) => println!("{text}"),
                Some(Inbound::Error(reason)) => println!("Server error: {reason}"),
                None => {
                    println!("Connection closed by server.");
                    return Ok(());
                }
            },
            line = lines.recv() => {
                let Some(line) = line else { break };
                let line = line.trim();
                if line == "/exit" {
                    break;
                } else if line == "/list" {
                    for name in client.list().await? {
                        println!("{name}");
                    }
                } else if let Some(rest) = line.strip_prefix("/msg ") {
                    let Some((target, text)) = rest.split_once(' ') else {
                        println!("Use: /msg <target client> <message>");
                        continue;
                    };
                    match client.send_to(target, text).await {
                        Err(e @ (ClientError::SelfTarget
                        | ClientError::InvalidName(_)
                        | ClientError::EmptyMessage
                        | ClientError::Rejected(_))) => println!("{e}"),
                        other => other?,
                    }
                } else if !line.is_empty() {
                    println!("Unknown command. Use /msg, /list or /exit.");
                }
            }
        }
    }

    println!("Closing connection...");
    client.exit().await?;
    Ok(())
}
