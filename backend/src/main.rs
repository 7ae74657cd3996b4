//! sigrelay - Signaling Relay
//!
//! Runs either the signal server or an interactive client shell.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use sigrelay::endpoint::{Endpoint, IceAgent, IceAgentFactory, IceEventSink, SessionKey};
use sigrelay::{ServerConfig, SignalClient, SignalServer, DEFAULT_SIGNAL_ADDR};

const SHELL_HELP: &str = "\
commands:
  status
  connect <addr>
  disconnect
  register <id> <pwd>
  login <id> <pwd> [force]
  logout
  services
  myservices
  show-service <name>
  create-service <name> <pwd> <description>
  remove-service <name> <pwd>
  enable-service <name> <pwd>
  disable-service <name> <pwd>
  join-service <name> <pwd>
  leave-service <name> [pwd]
  connect-service <name> <pwd>
  disconnect-service <name> <pwd>
  help
  exit | quit";

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "sigrelay")]
#[command(about = "Rendezvous and signaling relay for peers behind NAT")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the signal server.
    Server {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:9527")]
        listen: SocketAddr,

        /// Session database snapshot file.
        #[arg(long, default_value = "sigrelay.json")]
        db: PathBuf,

        /// Keep the database in memory only.
        #[arg(long)]
        no_persist: bool,

        /// Interval in seconds for retrying failed snapshot writes.
        #[arg(long, default_value = "10")]
        persist_interval: u64,
    },

    /// Run an interactive client shell.
    Client {
        /// Signal server address.
        #[arg(short, long, default_value = DEFAULT_SIGNAL_ADDR)]
        server: SocketAddr,

        /// Start without dialing the server.
        #[arg(long)]
        offline: bool,
    },
}

/// Stand-in ICE agent for the shell: logs what the remote sends.
struct LogAgent {
    key: SessionKey,
}

impl IceAgent for LogAgent {
    fn set_remote_credentials(&mut self, ufrag: &str, _pwd: &str) -> Result<()> {
        info!(service = %self.key.service, peer = %self.key.peer, %ufrag, "Remote ICE credentials");
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()> {
        info!(service = %self.key.service, peer = %self.key.peer, %candidate, "Remote ICE candidate");
        Ok(())
    }

    fn close(&mut self) {
        info!(service = %self.key.service, peer = %self.key.peer, "ICE session closed");
    }
}

struct LogAgentFactory;

impl IceAgentFactory for LogAgentFactory {
    fn create(
        &self,
        key: &SessionKey,
        controlling: bool,
        _events: IceEventSink,
    ) -> Result<Box<dyn IceAgent>> {
        info!(service = %key.service, peer = %key.peer, controlling, "ICE session requested");
        Ok(Box::new(LogAgent { key: key.clone() }))
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = SignalServer::bind(config).await?;

    info!("Signal server is running");
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
    }

    server.shutdown().await;
    info!("Server stopped");

    Ok(())
}

async fn run_client(server: SocketAddr, offline: bool) -> Result<()> {
    let client = Arc::new(SignalClient::new());
    if let Some(events) = client.take_events() {
        let endpoint = Endpoint::new(LogAgentFactory);
        tokio::spawn(endpoint.run(client.clone(), events));
    }

    if !offline {
        if let Err(e) = client.connect(server).await {
            warn!(%server, "Not connected yet: {}", e);
        }
    }

    println!("{}", SHELL_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let params: Vec<&str> = words.collect();
        match command {
            "exit" | "quit" => break,
            "help" => println!("{}", SHELL_HELP),
            _ => match client.execute(command, &params).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => println!("error: {}", e),
            },
        }
    }

    client.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sigrelay=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Server {
            listen,
            db,
            no_persist,
            persist_interval,
        } => {
            let config = ServerConfig {
                listen,
                db_path: (!no_persist).then_some(db),
                persist_interval: Duration::from_secs(persist_interval.max(1)),
                ..Default::default()
            };
            run_server(config).await
        }
        Command::Client { server, offline } => run_client(server, offline).await,
    }
}
