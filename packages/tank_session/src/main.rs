use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use peer_mesh::transport::tcp::{TcpAcceptor, TcpDialer};
use peer_mesh::{Client, Host, Network, PeerId};
use std::path::PathBuf;
use std::sync::Arc;
use tank_session::config::{Overrides, SessionConfig};
use tank_session::{Flow, Profile, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "tanks")]
#[command(about = "Multiplayer tank session over a host-relayed mesh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding tanks.toml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session and relay for everyone who joins
    Host(HostArgs),

    /// Join a session hosted elsewhere
    Join(JoinArgs),
}

#[derive(Args)]
struct PlayerArgs {
    /// Name shown to other players
    #[arg(short, long)]
    name: Option<String>,

    /// Vehicle variant
    #[arg(long)]
    vehicle: Option<String>,
}

#[derive(Args)]
struct HostArgs {
    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    #[command(flatten)]
    player: PlayerArgs,
}

#[derive(Args)]
struct JoinArgs {
    /// Host address, e.g. 192.168.1.10:4242
    addr: String,

    #[command(flatten)]
    player: PlayerArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let id = PeerId::random();
    let (host_addr, player, bind) = match cli.command {
        Commands::Host(args) => (None, args.player, args.bind),
        Commands::Join(args) => (Some(args.addr), args.player, None),
    };
    let config = SessionConfig::resolve(
        &config_dir,
        Overrides {
            pseudo: player.name,
            vehicle: player.vehicle,
            bind,
        },
    )?;

    let network = match host_addr {
        None => {
            let acceptor = TcpAcceptor::<Profile>::bind(&config.bind.to_string(), config.mesh.max_frame_bytes)
                .await
                .with_context(|| format!("Failed to listen on {}", config.bind))?;
            println!("Hosting on {}", acceptor.local_addr());
            Network::Host(Host::new(id, Box::new(acceptor), config.mesh.clone()))
        }
        Some(addr) => {
            let dialer = TcpDialer::new(config.mesh.max_frame_bytes, config.mesh.connect_timeout());
            Network::Client(Client::new(id, Arc::new(dialer), &addr, config.mesh.clone()))
        }
    };

    let (console, mut lines) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            println!("{line}");
        }
    });

    let session = Session::start(
        network,
        Profile::new(config.pseudo, config.vehicle),
        console,
    )
    .await?;
    println!("{}", tank_session::commands::HELP);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if session.handle_line(&line) == Flow::Quit {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = session.ended() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "tanks=debug,tank_session=debug,peer_mesh=debug,property_bag=debug,info"
    } else {
        "tank_session=info,peer_mesh=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
