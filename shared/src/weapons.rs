//! Static tool and weapon tables. Clients use the same numbers to predict
//! ammo and fire rate, so they live next to the packet definitions.

use crate::packets::{Hit, WeaponKind};

/// Fixed characteristics of one kind of tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolStats {
    pub name: &'static str,
    pub max_primary: u16,
    pub max_secondary: u16,
    /// Seconds between primary shots; zero means the tool never auto-fires.
    pub primary_rate: f64,
    pub secondary_rate: f64,
    pub reload_time: f64,
    /// Reloads a single round per cycle and may be interrupted by firing.
    pub one_by_one: bool,
    /// Damage per hit location: torso, head, arms, legs.
    pub damage: [Option<u8>; 4],
}

impl ToolStats {
    const fn tool(name: &'static str, max_primary: u16) -> Self {
        Self {
            name,
            max_primary,
            max_secondary: 0,
            primary_rate: 0.0,
            secondary_rate: 0.0,
            reload_time: 0.0,
            one_by_one: false,
            damage: [None; 4],
        }
    }

    pub fn damage_for(&self, hit: Hit) -> Option<u8> {
        match hit {
            Hit::Torso => self.damage[0],
            Hit::Head => self.damage[1],
            Hit::Arms => self.damage[2],
            Hit::Legs => self.damage[3],
            Hit::Melee => None,
        }
    }
}

pub const SPADE: ToolStats = ToolStats::tool("Spade", 0);
pub const BLOCK: ToolStats = ToolStats::tool("Block", 50);
pub const GRENADE: ToolStats = ToolStats::tool("Grenade", 3);

pub const SEMI: ToolStats = ToolStats {
    name: "Rifle",
    max_primary: 10,
    max_secondary: 50,
    primary_rate: 0.5,
    secondary_rate: 0.0,
    reload_time: 2.5,
    one_by_one: false,
    damage: [Some(49), Some(100), Some(33), Some(33)],
};

pub const SMG: ToolStats = ToolStats {
    name: "SMG",
    max_primary: 30,
    max_secondary: 120,
    primary_rate: 0.11,
    secondary_rate: 0.0,
    reload_time: 2.5,
    one_by_one: false,
    damage: [Some(24), Some(75), Some(16), Some(16)],
};

pub const SHOTGUN: ToolStats = ToolStats {
    name: "Shotgun",
    max_primary: 6,
    max_secondary: 48,
    primary_rate: 1.0,
    secondary_rate: 0.0,
    reload_time: 0.5,
    one_by_one: true,
    damage: [Some(21), Some(24), Some(14), Some(14)],
};

pub const RPG: ToolStats = ToolStats {
    name: "RPG",
    max_primary: 1,
    max_secondary: 5,
    primary_rate: 1.0,
    secondary_rate: 0.0,
    reload_time: 4.0,
    one_by_one: false,
    damage: [None; 4],
};

impl WeaponKind {
    pub const ALL: [WeaponKind; 4] = [
        WeaponKind::Semi,
        WeaponKind::Smg,
        WeaponKind::Shotgun,
        WeaponKind::Rpg,
    ];

    pub fn stats(&self) -> &'static ToolStats {
        match self {
            WeaponKind::Semi => &SEMI,
            WeaponKind::Smg => &SMG,
            WeaponKind::Shotgun => &SHOTGUN,
            WeaponKind::Rpg => &RPG,
        }
    }
}
