mod play;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use lockstep::{ClientConfig, ClientSession, HostConfig, ModuleDescriptor, NetHost};

#[derive(Parser)]
#[command(name = "lockstep-client")]
#[command(about = "Lockstep game client")]
struct Args {
    #[arg(short, long, default_value = "player", global = true)]
    name: String,

    #[arg(short, long, default_value_t = lockstep::SERVER_PORT, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask hosts which module they are running
    Browse {
        #[arg(long = "host", required = true, help = "Host to query (repeatable)")]
        hosts: Vec<String>,

        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Log on to a host and report the outcome
    Join { host: String },
    /// Join a host and exchange input with it for a number of ticks
    Play {
        host: String,

        #[arg(long, default_value_t = 500)]
        ticks: u32,

        #[arg(long, default_value_t = 50)]
        tick_rate: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let host = NetHost::new(HostConfig::default());
    host.start_up(0)?;

    let mut config = ClientConfig {
        display_name: args.name,
        server_port: args.port,
        ..Default::default()
    };

    let result = match args.command {
        Command::Browse { hosts, timeout_ms } => {
            config.candidate_hosts = hosts;
            config.module_info_timeout_ms = timeout_ms;
            let session = ClientSession::new(host.clone(), config)?;
            let modules = discover(&session, Duration::from_millis(timeout_ms * 2));
            for module in &modules {
                print_module(module);
            }
            if modules.is_empty() {
                println!("No modules found");
            }
            session.shut_down();
            Ok(())
        }
        Command::Join { host: target } => {
            let session = ClientSession::new(host.clone(), config)?;
            let outcome = session.join_game(&target);
            println!("{}: {}", target, outcome.as_str());
            session.shut_down();
            if outcome.is_error() {
                bail!("join failed: {}", outcome.as_str());
            }
            Ok(())
        }
        Command::Play {
            host: target,
            ticks,
            tick_rate,
        } => {
            config.candidate_hosts = vec![target.clone()];
            let mut session = ClientSession::new(host.clone(), config)?;
            let result = play::run(&mut session, &target, ticks, tick_rate);
            session.shut_down();
            result
        }
    };

    host.shut_down()?;
    result
}

/// Runs module discovery until every candidate has answered or `limit`
/// passes.
fn discover(session: &ClientSession, limit: Duration) -> Vec<ModuleDescriptor> {
    let start = Instant::now();
    if session.begin_request_module() == 0 {
        return Vec::new();
    }
    loop {
        session.request_module_info();
        if !session.load_module_info() {
            break;
        }
        if start.elapsed() >= limit {
            log::warn!("Giving up on module discovery");
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    session.end_request_module();
    session.modules()
}

fn print_module(module: &ModuleDescriptor) {
    println!(
        "{:<24} {:<28} {:<20} players {}-{}  respawn {}{}{}",
        module.host,
        module.long_name,
        module.load_name,
        module.min_players,
        module.max_players,
        module.respawn_mode.as_str(),
        if module.rts_control { "  rts" } else { "" },
        if module.monsters_only { "  monsters only" } else { "" },
    );
}
