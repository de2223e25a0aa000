use crate::client_manager::PeerId;
use crate::world::VoxelMap;
use shared::{EntityData, EntityKind, ItemKind, SoundData, TeamId, Vec3};

// Blocks per second squared; z grows downwards.
const GRAVITY: f32 = 32.0;
const ROCKET_SPEED: f32 = 48.0;

/// Splash damage stops at this distance.
pub const BLAST_RADIUS: f32 = 16.0;

/// Seconds a rocket flies before it detonates in mid-air.
pub const ROCKET_LIFETIME: f32 = 10.0;

// Server-simulated world object (flags, bases, crates)
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: u8,
    pub kind: EntityKind,
    pub team: Option<TeamId>,
    pub position: Vec3,
    pub carrier: Option<u8>,
}

impl Entity {
    pub fn new(id: u8, kind: EntityKind, position: Vec3, team: Option<TeamId>) -> Self {
        Entity {
            id,
            kind,
            team,
            position,
            carrier: None,
        }
    }

    // Carried entities follow their carrier; everything else stays put
    pub fn update(&mut self, _dt: f32, carrier_position: Option<Vec3>) {
        if let Some(position) = carrier_position {
            self.position = position;
        }
    }

    pub fn to_wire(&self) -> EntityData {
        EntityData {
            entity_id: self.id,
            kind: self.kind,
            team: self.team,
            position: self.position,
            carrier: self.carrier,
        }
    }
}

// One-shot sounds have no id; looping sounds keep one until destroyed
#[derive(Debug, Clone, PartialEq)]
pub struct Sound {
    pub id: Option<u8>,
    pub name: String,
    pub position: Option<Vec3>,
}

impl Sound {
    pub fn new(id: Option<u8>, name: &str, position: Option<Vec3>) -> Self {
        Sound {
            id,
            name: name.to_string(),
            position,
        }
    }

    pub fn looping(&self) -> bool {
        self.id.is_some()
    }

    pub fn to_wire(&self) -> SoundData {
        SoundData {
            sound_id: self.id,
            name: self.name.clone(),
            position: self.position,
            looping: self.looping(),
        }
    }
}

/// Thrown grenade or fired rocket. Lives in the protocol's object list until
/// it detonates.
#[derive(Debug, Clone, PartialEq)]
pub struct Explosive {
    pub kind: ItemKind,
    pub owner: u8,
    /// Thrower's connection. Player ids are reused, peer ids are not.
    pub peer: PeerId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub fuse: f32,
}

impl Explosive {
    /// For rockets `velocity` is the launch orientation; the speed is fixed.
    pub fn new(
        kind: ItemKind,
        owner: u8,
        peer: PeerId,
        position: Vec3,
        velocity: Vec3,
        fuse: f32,
    ) -> Self {
        let velocity = match kind {
            ItemKind::Grenade => velocity,
            ItemKind::Rocket => velocity.normalized() * ROCKET_SPEED,
        };
        Explosive {
            kind,
            owner,
            peer,
            position,
            velocity,
            fuse,
        }
    }

    /// Advances the projectile. Returns true once it should detonate.
    pub fn update(&mut self, dt: f32, map: &dyn VoxelMap) -> bool {
        if self.kind == ItemKind::Grenade {
            self.velocity.z += GRAVITY * dt;
        }
        let next = self.position + self.velocity * dt;
        let ground = map.get_z(next.x.floor() as i32, next.y.floor() as i32) as f32;

        if next.z >= ground {
            match self.kind {
                ItemKind::Rocket => {
                    self.position = Vec3::new(next.x, next.y, ground - 0.5);
                    return true;
                }
                ItemKind::Grenade => {
                    // Grenades come to rest on the surface and wait for the fuse.
                    self.position = Vec3::new(next.x, next.y, ground - 0.5);
                    self.velocity = Vec3::ZERO;
                }
            }
        } else {
            self.position = next;
        }

        self.fuse -= dt;
        self.fuse <= 0.0
    }

    /// Splash damage at `target`, or `None` when out of range.
    pub fn damage_at(&self, target: Vec3) -> Option<i32> {
        let sq_distance = self.position.sq_distance(&target);
        if sq_distance >= BLAST_RADIUS * BLAST_RADIUS {
            return None;
        }
        let damage = if sq_distance < 1.0 {
            100.0
        } else {
            (4096.0 / sq_distance).min(100.0)
        };
        Some(damage as i32)
    }

    /// Voxel the blast is centred on.
    pub fn block(&self) -> (i32, i32, i32) {
        (
            self.position.x.floor() as i32,
            self.position.y.floor() as i32,
            self.position.z.floor() as i32,
        )
    }
}
