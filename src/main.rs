//! ztmesh CLI - zero-trust mesh tunnels through the relay
//!
//! Expose a local port to selected peers, or reach a peer's exposed port
//! through a local listener.

mod background;
mod config;
mod context;
mod device;
mod diagnose;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ztmesh_client::{ConnectOptions, ExposeOptions, Exposer, MeshPresence, TunnelConnector};
use ztmesh_proto::Capability;

use config::{ConfigManager, ZtmeshConfig};
use context::CommandContext;
use device::DeviceIdentity;

/// ztmesh - zero-trust mesh tunnels
#[derive(Parser, Debug)]
#[command(name = "ztmesh")]
#[command(about = "Zero-trust mesh tunnels through the relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Backend API URL
    #[arg(long, env = "ZTMESH_API_URL", global = true)]
    api_url: Option<String>,

    /// Relay WebSocket URL (derived from the API URL when unset)
    #[arg(long, env = "ZTMESH_RELAY_URL", global = true)]
    relay_url: Option<String>,

    /// Session token
    #[arg(long, env = "ZTMESH_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "ZTMESH_SESSION_ID", global = true)]
    session_id: Option<String>,

    #[arg(long, env = "ZTMESH_ORG_ID", global = true)]
    org_id: Option<String>,

    /// Skip TLS certificate verification (development only)
    #[arg(long, env = "ZTMESH_INSECURE", global = true)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl GlobalArgs {
    fn overrides(&self) -> ZtmeshConfig {
        ZtmeshConfig {
            api_url: self.api_url.clone(),
            relay_url: self.relay_url.clone(),
            session_token: self.token.clone(),
            session_id: self.session_id.clone(),
            org_id: self.org_id.clone(),
            tls_insecure: self.insecure,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expose, connect to and manage tunnels
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Inspect the device mesh
    Mesh {
        #[command(subcommand)]
        command: MeshCommands,
    },
    /// Manage the stored configuration (~/.ztmesh/config.json)
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelCommands {
    /// Expose a local port to the mesh
    #[command(long_about = r#"
Expose a local TCP port through the relay. Only the exposed port is
reachable, and with --to-peer only that peer may connect.

EXAMPLES:
  # Expose a local PostgreSQL to one peer
  ztmesh tunnel expose 5432 --to-peer db-client-laptop

  # Keep running after the terminal closes
  ztmesh tunnel expose 8080 --background
    "#)]
    Expose {
        /// Local port to expose (asked for when omitted)
        port: Option<u16>,

        /// Tunnel name (defaults to port-<PORT>)
        #[arg(long)]
        name: Option<String>,

        /// Only allow this peer (device id, hostname or name)
        #[arg(long)]
        to_peer: Option<String>,

        /// Port advertised to peers instead of the local port
        #[arg(long)]
        external_port: Option<u16>,

        /// Request a public URL for the tunnel
        #[arg(long)]
        public: bool,

        /// Run detached, logging to ~/.ztmesh/logs/tunnel-<PORT>.log
        #[arg(long)]
        background: bool,
    },
    /// Reach a peer's exposed port through a local listener
    Connect {
        /// Peer device id, hostname or name
        #[arg(long)]
        peer: String,

        /// Port the peer exposed
        #[arg(long)]
        port: u16,

        /// Local port to listen on (defaults to --port)
        #[arg(long)]
        local_port: Option<u16>,
    },
    /// List tunnels
    List {
        /// Only tunnels exposed by this device
        #[arg(long)]
        device: Option<String>,
    },
    /// Delete a tunnel record
    Delete {
        id: i64,
    },
    /// Check configuration, backend and relay connectivity
    Diagnose,
}

#[derive(Subcommand, Debug)]
enum MeshCommands {
    /// List mesh nodes
    Peers,
    /// Register this device with the mesh
    Register,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the stored configuration
    Show,
    /// Store values; flags left out keep their current value
    Set {
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        relay_url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        org_id: Option<String>,
        #[arg(long)]
        insecure: bool,
    },
    /// Remove the stored configuration
    Clear,
}

/// ~/.ztmesh
pub(crate) fn ztmesh_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".ztmesh"))
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on Ctrl-C, or SIGTERM on Unix
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await.ok();

        info!("Shutting down...");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level, cli.global.verbose);

    let manager = ConfigManager::new()?;
    match cli.command {
        Commands::Config { command } => handle_config(&manager, command),
        Commands::Tunnel { command } => {
            let ctx = command_context(&manager, &cli.global)?;
            handle_tunnel(&ctx, command).await
        }
        Commands::Mesh { command } => {
            let ctx = command_context(&manager, &cli.global)?;
            handle_mesh(&ctx, command).await
        }
    }
}

/// Stored config with flag and env overrides, plus this device's identity
fn command_context(manager: &ConfigManager, global: &GlobalArgs) -> Result<CommandContext> {
    let config = manager.load()?.merge(global.overrides());
    let device = DeviceIdentity::load_or_create(&ztmesh_dir()?.join("device_id"))?;
    Ok(CommandContext::new(config, device))
}

/// Ask for the port to expose until a valid one is entered
fn prompt_port(mut input: impl BufRead, mut output: impl Write) -> Result<u16> {
    loop {
        write!(output, "Local port to expose: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            anyhow::bail!("No port given");
        }
        match line.trim().parse::<u16>() {
            Ok(port) if port > 0 => return Ok(port),
            _ => writeln!(output, "Enter a port between 1 and 65535")?,
        }
    }
}

async fn handle_tunnel(ctx: &CommandContext, command: TunnelCommands) -> Result<()> {
    match command {
        TunnelCommands::Expose {
            port,
            name,
            to_peer,
            external_port,
            public,
            background,
        } => {
            let (port, prompted) = match port {
                Some(port) => (port, None),
                None => {
                    let port = prompt_port(io::stdin().lock(), io::stdout())?;
                    (port, Some(port))
                }
            };

            if background {
                let log_file = background::log_path(&ztmesh_dir()?.join("logs"), port);
                let pid = background::spawn_detached(&log_file, prompted)?;
                println!("✅ Tunnel for port {} running in background (PID {})", port, pid);
                println!("   Logs: {}", log_file.display());
                return Ok(());
            }

            let exposer = Exposer::new(
                ctx.tunnel_context()?,
                ExposeOptions {
                    port,
                    name,
                    to_peer,
                    external_port,
                    public,
                },
            );

            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let outcome = exposer
                .run(cancel)
                .await
                .map_err(|e| anyhow::anyhow!("Expose failed ({}): {}", e.kind(), e))?;
            if let Some(cleanup_error) = outcome.cleanup_error {
                error!(
                    "Tunnel {} may still be registered: {}",
                    outcome.record.id, cleanup_error
                );
            }
            Ok(())
        }
        TunnelCommands::Connect {
            peer,
            port,
            local_port,
        } => {
            let connector = TunnelConnector::new(
                ctx.tunnel_context()?,
                ConnectOptions {
                    peer,
                    port,
                    local_port,
                },
            );

            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());

            let outcome = connector
                .run(cancel)
                .await
                .map_err(|e| anyhow::anyhow!("Connect failed ({}): {}", e.kind(), e))?;
            info!(
                "Proxied {} connection(s) through {}",
                outcome.connections, outcome.local_addr
            );
            Ok(())
        }
        TunnelCommands::List { device } => {
            let api = ctx.api_client()?;
            let tunnels = api
                .list_tunnels(device.as_deref())
                .await
                .context("Failed to list tunnels")?;

            if tunnels.is_empty() {
                println!("No tunnels");
                return Ok(());
            }
            println!(
                "{:<8} {:<20} {:<38} {:<8} {:<10}",
                "ID", "NAME", "DEVICE", "PORT", "STATUS"
            );
            for tunnel in tunnels {
                println!(
                    "{:<8} {:<20} {:<38} {:<8} {:<10}",
                    tunnel.id,
                    tunnel.name,
                    tunnel.device_id,
                    tunnel.advertised_port(),
                    tunnel.status
                );
            }
            Ok(())
        }
        TunnelCommands::Delete { id } => {
            ctx.api_client()?
                .delete_tunnel(id)
                .await
                .context(format!("Failed to delete tunnel {}", id))?;
            println!("✅ Tunnel {} deleted", id);
            Ok(())
        }
        TunnelCommands::Diagnose => {
            let checks = diagnose::run_checks(ctx).await;
            for check in &checks {
                println!("{}", check);
            }

            let failed = checks.iter().filter(|c| !c.passed()).count();
            if failed > 0 {
                anyhow::bail!("{} diagnostic check(s) failed", failed);
            }
            println!("All checks passed");
            Ok(())
        }
    }
}

async fn handle_mesh(ctx: &CommandContext, command: MeshCommands) -> Result<()> {
    let api = ctx.api_client()?;
    match command {
        MeshCommands::Peers => {
            let nodes = api
                .list_mesh_nodes()
                .await
                .context("Failed to list mesh nodes")?;

            if nodes.is_empty() {
                println!("No mesh nodes");
                return Ok(());
            }
            for node in nodes {
                let marker = if node.device_id == ctx.device.device_id {
                    " (this device)"
                } else {
                    ""
                };
                println!(
                    "{:<38} {:<24} {}{}",
                    node.device_id,
                    node.display_name(),
                    node.status,
                    marker
                );
            }
            Ok(())
        }
        MeshCommands::Register => {
            MeshPresence::new(api, &ctx.device.device_id, &ctx.device.hostname)
                .register(&Capability::defaults())
                .await
                .context("Failed to register with the mesh")?;
            println!(
                "✅ Registered {} ({})",
                ctx.device.hostname, ctx.device.device_id
            );
            Ok(())
        }
    }
}

fn handle_config(manager: &ConfigManager, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = manager.load()?;
            println!("Config file: {}", manager.path().display());
            println!("  api_url:       {}", config.api_url());
            match config.relay_url() {
                Ok(relay) => println!("  relay_url:     {}", relay),
                Err(e) => println!("  relay_url:     invalid ({:#})", e),
            }
            println!(
                "  session_token: {}",
                if config.session_token.is_some() { "set" } else { "not set" }
            );
            println!(
                "  session_id:    {}",
                config.session_id.as_deref().unwrap_or("-")
            );
            println!("  org_id:        {}", config.org_id.as_deref().unwrap_or("-"));
            println!("  tls_insecure:  {}", config.tls_insecure);
            Ok(())
        }
        ConfigCommands::Set {
            api_url,
            relay_url,
            token,
            session_id,
            org_id,
            insecure,
        } => {
            manager.update(ZtmeshConfig {
                api_url,
                relay_url,
                session_token: token,
                session_id,
                org_id,
                tls_insecure: insecure,
            })?;
            println!("✅ Saved {}", manager.path().display());
            Ok(())
        }
        ConfigCommands::Clear => {
            manager.clear()?;
            println!("✅ Configuration cleared");
            Ok(())
        }
    }
}
