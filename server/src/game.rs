//! Teams and the pluggable game mode.

use crate::world::VoxelMap;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Color, TeamId, TeamState, Vec3};

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub color: Color,
    pub score: u32,
}

impl Team {
    pub fn new(id: TeamId, name: &str, color: Color) -> Self {
        Self {
            id,
            name: name.to_string(),
            color,
            score: 0,
        }
    }

    pub fn to_state(&self) -> TeamState {
        TeamState {
            name: self.name.clone(),
            color: self.color,
            score: self.score,
        }
    }
}

/// Both playing teams, indexed by [`TeamId`]. Spectators have no entry.
#[derive(Debug, Clone)]
pub struct Teams([Team; 2]);

impl Teams {
    pub fn new(team1: Team, team2: Team) -> Self {
        Teams([team1, team2])
    }

    fn index(id: TeamId) -> Option<usize> {
        match id {
            TeamId::Team1 => Some(0),
            TeamId::Team2 => Some(1),
            TeamId::Spectator => None,
        }
    }

    pub fn get(&self, id: TeamId) -> Option<&Team> {
        Self::index(id).map(|i| &self.0[i])
    }

    pub fn get_mut(&mut self, id: TeamId) -> Option<&mut Team> {
        Self::index(id).map(move |i| &mut self.0[i])
    }

    /// The opposing team of `id`.
    pub fn other(&self, id: TeamId) -> Option<&Team> {
        id.other().and_then(|other| self.get(other))
    }

    pub fn team1(&self) -> &Team {
        &self.0[0]
    }

    pub fn team2(&self) -> &Team {
        &self.0[1]
    }
}

impl Default for Teams {
    fn default() -> Self {
        Teams::new(
            Team::new(TeamId::Team1, "Blue", Color::new(44, 117, 179)),
            Team::new(TeamId::Team2, "Green", Color::new(137, 179, 44)),
        )
    }
}

/// Rule engine plugged into the protocol. Scoring and objectives live here;
/// the protocol only asks it where to put people.
pub trait GameMode: Send {
    fn name(&self) -> &str;
    fn score_limit(&self) -> u32;

    fn init(&mut self, _map: &dyn VoxelMap) {}

    fn update(&mut self, _dt: f32) {}

    fn get_spawn_point(&mut self, team: TeamId, map: &dyn VoxelMap) -> Vec3 {
        self.get_random_pos(team, map)
    }

    fn get_random_pos(&mut self, team: TeamId, map: &dyn VoxelMap) -> Vec3;
}

/// Everyone spawns somewhere in their own half of the map.
pub struct FreeForAll {
    rng: StdRng,
    score_limit: u32,
}

impl FreeForAll {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            score_limit: 10,
        }
    }

    /// Deterministic spawn positions, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            score_limit: 10,
        }
    }
}

impl Default for FreeForAll {
    fn default() -> Self {
        Self::new()
    }
}

impl GameMode for FreeForAll {
    fn name(&self) -> &str {
        "Free For All"
    }

    fn score_limit(&self) -> u32 {
        self.score_limit
    }

    fn init(&mut self, map: &dyn VoxelMap) {
        info!(
            "Game mode '{}' on a {}x{}x{} map",
            self.name(),
            map.width(),
            map.length(),
            map.depth()
        );
    }

    fn get_random_pos(&mut self, team: TeamId, map: &dyn VoxelMap) -> Vec3 {
        let half = (map.width() / 2).max(1);
        let (min_x, max_x) = match team {
            TeamId::Team1 => (0, half),
            TeamId::Team2 => (half, map.width().max(half + 1)),
            TeamId::Spectator => (0, map.width().max(1)),
        };
        let x = self.rng.gen_range(min_x..max_x);
        let y = self.rng.gen_range(0..map.length().max(1));
        let z = map.get_z(x, y) - 2;
        Vec3::new(x as f32 + 0.5, y as f32 + 0.5, z as f32)
    }
}
