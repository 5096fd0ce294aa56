mod server;
mod simulation;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use lockstep::{HostConfig, ModuleDescriptor, RespawnMode, ServerConfig};
use server::GameServer;

#[derive(Parser)]
#[command(name = "lockstep-server")]
#[command(about = "Hosts one module and relays player input")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = lockstep::SERVER_PORT)]
    port: u16,

    #[arg(short, long, default_value = "adventure.mod")]
    module: String,

    #[arg(long, default_value = "Adventure")]
    long_name: String,

    #[arg(long, default_value_t = 1)]
    min_players: u8,

    #[arg(long, default_value_t = 4)]
    max_players: u8,

    #[arg(long, default_value_t = 0)]
    seed: u32,

    #[arg(short, long, default_value_t = 50)]
    tick_rate: u32,

    #[arg(long, help = "Stop after this many seconds (runs until killed otherwise)")]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", args.bind))?;

    let mut module = ModuleDescriptor::new(&args.module, &args.long_name);
    module.min_players = args.min_players;
    module.max_players = args.max_players.max(args.min_players);
    module.respawn_mode = RespawnMode::Normal;

    let config = ServerConfig {
        port: args.port,
        tick_rate: args.tick_rate,
        ..Default::default()
    };

    let mut server = GameServer::new(bind_addr, HostConfig::default(), config, module, args.seed)?;
    if let Some(addr) = server.local_addr() {
        log::info!("Server started on {}", addr);
    }

    server.run(args.duration_secs.map(Duration::from_secs));

    log::info!("Server shutting down");
    server.shut_down()?;
    Ok(())
}
