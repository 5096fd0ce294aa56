use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use glam::Vec2;

use lockstep::{Buttons, ClientSession, JoinOutcome, Latch};

use crate::discover;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Input a scripted player would produce at `tick`.
fn scripted_latch(tick: u32) -> Latch {
    let phase = tick as f32 * 0.05;
    let mut buttons = Buttons::empty();
    if tick % 60 == 0 {
        buttons |= Buttons::JUMP;
    }
    Latch::new(Vec2::new(phase.sin(), 0.0), buttons)
}

pub fn run(session: &mut ClientSession, target: &str, ticks: u32, tick_rate: u32) -> Result<()> {
    let modules = discover(session, HANDSHAKE_TIMEOUT);
    let Some(module) = modules.first() else {
        bail!("{} is not hosting a module", target);
    };
    log::info!("{} is hosting {}", target, module.long_name);

    // The logon rides on the game connection, so it goes up first.
    if !session.connect(target) {
        bail!("could not open the game connection to {}", target);
    }
    let session_id = match session.join_game(target) {
        JoinOutcome::Accepted { session_id } => session_id,
        outcome => bail!("could not join {}: {}", target, outcome.as_str()),
    };

    // The host offers its module as soon as we are logged on.
    if !wait_until(HANDSHAKE_TIMEOUT, || !session.is_waiting()) {
        bail!("host never offered a module we have");
    }
    log::info!("Loading {} (seed {})", module.load_name, session.seed());

    session.set_waiting(true);
    session
        .send_loaded()
        .context("failed to report the module as loaded")?;
    if !wait_until(HANDSHAKE_TIMEOUT, || !session.is_waiting()) {
        bail!("host never started the game");
    }

    let entity = u16::from(session_id);
    session.set_local_entities(vec![entity]);
    session.reset_latches();

    let tick_duration = Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64);
    let mut applied = 0usize;
    let mut next_tick = Instant::now();
    for tick in 0..ticks {
        session.buffer_local_latch(entity, tick, scripted_latch(tick));
        if let Err(e) = session.send_latches(tick) {
            log::warn!("Latch send failed at tick {}: {}", tick, e);
        }
        applied += session.unbuffer_latches(tick, |_, _| {});

        if session.take_out_of_sync() {
            log::warn!("Out of sync at tick {}", tick);
        }
        if !session.is_logged_on() {
            bail!("lost the game at tick {}", tick);
        }

        next_tick += tick_duration;
        thread::sleep(next_tick.saturating_duration_since(Instant::now()));
    }

    let counts = session.sync_counts();
    println!(
        "{} ticks as player {}: {} latches applied, {} out of order, {} late, {} missed",
        ticks, session_id, applied, counts.out_of_order, counts.late, counts.missed
    );
    session.unjoin_game();
    Ok(())
}
