use glam::Vec2;

use lockstep::{Buttons, Latch};

const WALK_SPEED: f32 = 5.0;
const JUMP_SPEED: f32 = 8.0;
const GRAVITY: f32 = 20.0;

/// Stand-in for a game character: just enough state to show latches
/// driving a deterministic simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Avatar {
    pub position: Vec2,
    pub velocity: Vec2,
    pub latch: Latch,
}

pub fn apply_latch(avatar: &mut Avatar, latch: Latch) {
    avatar.latch = latch;
}

pub fn simulate_avatar(avatar: &mut Avatar, dt: f32) {
    let motion = avatar.latch.motion.clamp_length_max(1.0);
    avatar.velocity.x = motion.x * WALK_SPEED;

    let grounded = avatar.position.y <= 0.0;
    if grounded && avatar.latch.buttons.contains(Buttons::JUMP) {
        avatar.velocity.y = JUMP_SPEED;
    }

    avatar.velocity.y -= GRAVITY * dt;
    avatar.position += avatar.velocity * dt;

    if avatar.position.y < 0.0 {
        avatar.position.y = 0.0;
        avatar.velocity.y = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_lands_again() {
        let mut avatar = Avatar::default();
        apply_latch(&mut avatar, Latch::new(Vec2::X, Buttons::JUMP));
        simulate_avatar(&mut avatar, 0.02);
        assert!(avatar.position.y > 0.0);
        assert!(avatar.position.x > 0.0);

        apply_latch(&mut avatar, Latch::default());
        for _ in 0..200 {
            simulate_avatar(&mut avatar, 0.02);
        }
        assert_eq!(avatar.position.y, 0.0);
    }
}
