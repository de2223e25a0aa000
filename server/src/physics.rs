use shared::{InputState, Vec3};

///Falling faster than this (blocks per second, z grows downwards) hurts on landing.
pub const SAFE_FALL_SPEED: f32 = 24.0;
///Damage per block per second above the safe speed.
pub const FALL_DAMAGE_SCALE: f32 = 4.0;

///Per-player world object the connection drives.
pub trait PlayerBody: Send {
    ///Moves the body. `reset` discards any motion history.
    fn set_position(&mut self, position: Vec3, reset: bool);
    fn set_orientation(&mut self, orientation: Vec3);
    fn set_walk(&mut self, up: bool, down: bool, left: bool, right: bool);
    fn set_animation(&mut self, jump: bool, crouch: bool, sneak: bool, sprint: bool);
    fn set_fire(&mut self, primary: bool, secondary: bool);
    fn set_weapon(&mut self, weapon_equipped: bool);
    fn set_dead(&mut self, dead: bool);

    ///Advances the body and returns fall damage taken during this step.
    fn update(&mut self, dt: f32, time: f64) -> i32;

    fn position(&self) -> Vec3;
    fn orientation(&self) -> Vec3;
    fn velocity(&self) -> Vec3;
    fn eye(&self) -> Vec3;
    fn is_dead(&self) -> bool;
}

///Body that trusts client-reported positions and infers velocity from them.
///Fall damage is taken when a fast descent stops abruptly.
#[derive(Debug, Clone)]
pub struct KinematicBody {
    position: Vec3,
    orientation: Vec3,
    velocity: Vec3,
    last_sample: Option<(Vec3, f64)>,
    pub input: InputState,
    pub primary: bool,
    pub secondary: bool,
    pub weapon_equipped: bool,
    dead: bool,
}

impl Default for KinematicBody {
    fn default() -> Self {
        KinematicBody {
            position: Vec3::ZERO,
            orientation: Vec3::new(1.0, 0.0, 0.0),
            velocity: Vec3::ZERO,
            last_sample: None,
            input: InputState::default(),
            primary: false,
            secondary: false,
            weapon_equipped: true,
            dead: true,
        }
    }
}

impl PlayerBody for KinematicBody {
    fn set_position(&mut self, position: Vec3, reset: bool) {
        self.position = position;
        if reset {
            self.velocity = Vec3::ZERO;
            self.last_sample = None;
        }
    }

    fn set_orientation(&mut self, orientation: Vec3) {
        self.orientation = orientation;
    }

    fn set_walk(&mut self, up: bool, down: bool, left: bool, right: bool) {
        self.input.up = up;
        self.input.down = down;
        self.input.left = left;
        self.input.right = right;
    }

    fn set_animation(&mut self, jump: bool, crouch: bool, sneak: bool, sprint: bool) {
        self.input.jump = jump;
        self.input.crouch = crouch;
        self.input.sneak = sneak;
        self.input.sprint = sprint;
    }

    fn set_fire(&mut self, primary: bool, secondary: bool) {
        self.primary = primary;
        self.secondary = secondary;
    }

    fn set_weapon(&mut self, weapon_equipped: bool) {
        self.weapon_equipped = weapon_equipped;
    }

    fn set_dead(&mut self, dead: bool) {
        self.dead = dead;
        if dead {
            self.primary = false;
            self.secondary = false;
        }
    }

    fn update(&mut self, _dt: f32, time: f64) -> i32 {
        if self.dead {
            self.last_sample = None;
            return 0;
        }

        let mut damage = 0;
        if let Some((last_position, last_time)) = self.last_sample {
            let elapsed = (time - last_time) as f32;
            if elapsed > 0.0 {
                let velocity = (self.position - last_position) * (1.0 / elapsed);
                // Landed: was falling fast, now not falling at all.
                if self.velocity.z > SAFE_FALL_SPEED && velocity.z <= 0.0 {
                    damage = ((self.velocity.z - SAFE_FALL_SPEED) * FALL_DAMAGE_SCALE) as i32;
                }
                self.velocity = velocity;
            }
        }
        self.last_sample = Some((self.position, time));
        damage
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn orientation(&self) -> Vec3 {
        self.orientation
    }

    fn velocity(&self) -> Vec3 {
        self.velocity
    }

    fn eye(&self) -> Vec3 {
        self.position
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn alive_at(position: Vec3) -> KinematicBody {
        let mut body = KinematicBody::default();
        body.set_dead(false);
        body.set_position(position, true);
        body
    }

    #[test]
    fn test_starts_dead() {
        let body = KinematicBody::default();
        assert!(body.is_dead());
    }

    #[test]
    fn test_velocity_from_samples() {
        let mut body = alive_at(Vec3::new(10.0, 10.0, 20.0));
        assert_eq!(body.update(0.1, 0.0), 0);

        body.set_position(Vec3::new(11.0, 10.0, 20.0), false);
        assert_eq!(body.update(0.5, 0.5), 0);
        assert_approx_eq!(body.velocity().x, 2.0);
        assert_approx_eq!(body.velocity().z, 0.0);
    }

    #[test]
    fn test_hard_landing_hurts() {
        let mut body = alive_at(Vec3::new(0.0, 0.0, 0.0));
        body.update(0.1, 0.0);

        body.set_position(Vec3::new(0.0, 0.0, 30.0), false);
        assert_eq!(body.update(1.0, 1.0), 0);

        // Stopped dead on the ground.
        assert_eq!(body.update(0.1, 1.1), 24);
        assert_eq!(body.update(0.1, 1.2), 0);
    }

    #[test]
    fn test_gentle_descent_is_free() {
        let mut body = alive_at(Vec3::new(0.0, 0.0, 0.0));
        body.update(0.1, 0.0);
        body.set_position(Vec3::new(0.0, 0.0, 2.0), false);
        body.update(0.1, 1.0);
        assert_eq!(body.update(0.1, 1.1), 0);
    }

    #[test]
    fn test_reset_discards_motion() {
        let mut body = alive_at(Vec3::new(0.0, 0.0, 0.0));
        body.update(0.1, 0.0);
        body.set_position(Vec3::new(0.0, 0.0, 40.0), true);
        assert_eq!(body.update(0.1, 0.1), 0);
        assert_eq!(body.velocity(), Vec3::ZERO);
    }

    #[test]
    fn test_dead_body_drops_fire() {
        let mut body = alive_at(Vec3::ZERO);
        body.set_fire(true, true);
        body.set_dead(true);
        assert!(!body.primary);
        assert!(!body.secondary);
        assert_eq!(body.update(0.1, 5.0), 0);
    }
}
