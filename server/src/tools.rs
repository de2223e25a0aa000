//! Per-player equipment state machines.
//!
//! Every tool shares the same core: two ammo counters bounded by the tool's
//! [`ToolStats`], two trigger flags and two cooldown deadlines measured in
//! server time. Firearms add a reload sub-state. All timing is driven by
//! [`Equipment::update`] from the server tick, so nothing here owns a timer
//! task and cancelling a reload is just clearing its deadline.

use shared::weapons::{BLOCK, GRENADE, SPADE};
use shared::{Color, Hit, Tool, ToolStats, WeaponKind};

pub const DEFAULT_BLOCK_COLOR: Color = Color::new(112, 112, 112);

/// Something the tick produced that the owning connection has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEvent {
    Fired,
    Reloaded { clip: u16, reserve: u16 },
}

/// State common to every tool.
#[derive(Debug, Clone)]
pub struct ToolState {
    pub stats: &'static ToolStats,
    pub primary: bool,
    pub secondary: bool,
    pub primary_ammo: u16,
    pub secondary_ammo: u16,
    next_primary: f64,
    next_secondary: f64,
}

impl ToolState {
    pub fn new(stats: &'static ToolStats, now: f64) -> Self {
        Self {
            stats,
            primary: false,
            secondary: false,
            primary_ammo: stats.max_primary,
            secondary_ammo: stats.max_secondary,
            next_primary: now,
            next_secondary: now,
        }
    }

    /// Checks both triggers against their cooldowns. Returns which ones are
    /// due to fire this tick and advances their deadlines.
    fn due(&mut self, now: f64) -> (bool, bool) {
        let stats = self.stats;
        let mut fire_primary = false;
        let mut fire_secondary = false;

        if stats.primary_rate > 0.0
            && self.primary
            && self.primary_ammo > 0
            && now >= self.next_primary
        {
            self.next_primary = now + stats.primary_rate;
            fire_primary = true;
        }
        if stats.secondary_rate > 0.0
            && self.secondary
            && self.secondary_ammo > 0
            && now >= self.next_secondary
        {
            self.next_secondary = now + stats.secondary_rate;
            fire_secondary = true;
        }
        (fire_primary, fire_secondary)
    }

    /// Takes one unit of primary ammo if there is any.
    fn consume(&mut self) -> bool {
        if self.primary_ammo == 0 {
            return false;
        }
        self.primary_ammo -= 1;
        true
    }

    /// Refills both counters. This skips the clip/reserve accounting a real
    /// reload would do.
    fn restock(&mut self) {
        self.primary_ammo = self.stats.max_primary;
        self.secondary_ammo = self.stats.max_secondary;
    }
}

/// Behaviour shared by every equippable tool.
pub trait Equipment {
    fn state(&self) -> &ToolState;
    fn state_mut(&mut self) -> &mut ToolState;

    /// Records trigger intent and returns the value that was accepted.
    fn set_primary(&mut self, held: bool) -> bool {
        self.state_mut().primary = held;
        held
    }

    fn set_secondary(&mut self, held: bool) -> bool {
        self.state_mut().secondary = held;
        held
    }

    fn on_primary(&mut self) -> bool {
        true
    }

    fn on_secondary(&mut self) -> bool {
        true
    }

    fn update(&mut self, now: f64) -> Option<ToolEvent> {
        let (primary, secondary) = self.state_mut().due(now);
        let mut event = None;
        if primary && self.on_primary() {
            event = Some(ToolEvent::Fired);
        }
        if secondary {
            self.on_secondary();
        }
        event
    }

    fn restock(&mut self) {
        self.state_mut().restock();
    }

    fn reset(&mut self) {}

    fn release(&mut self) {
        self.set_primary(false);
        self.set_secondary(false);
    }
}

#[derive(Debug, Clone)]
pub struct SpadeTool {
    state: ToolState,
}

impl SpadeTool {
    pub fn new(now: f64) -> Self {
        Self {
            state: ToolState::new(&SPADE, now),
        }
    }
}

impl Equipment for SpadeTool {
    fn state(&self) -> &ToolState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ToolState {
        &mut self.state
    }
}

/// Placeable blocks. Building and destroying draw from the same pool.
#[derive(Debug, Clone)]
pub struct BlockTool {
    state: ToolState,
    pub color: Color,
}

impl BlockTool {
    pub fn new(now: f64) -> Self {
        Self {
            state: ToolState::new(&BLOCK, now),
            color: DEFAULT_BLOCK_COLOR,
        }
    }

    pub fn build(&mut self) -> bool {
        self.state.consume()
    }

    pub fn destroy(&mut self) {
        self.state.primary_ammo = (self.state.primary_ammo + 1).min(self.state.stats.max_primary);
    }

    pub fn blocks(&self) -> u16 {
        self.state.primary_ammo
    }
}

impl Equipment for BlockTool {
    fn state(&self) -> &ToolState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ToolState {
        &mut self.state
    }

    fn reset(&mut self) {
        self.color = DEFAULT_BLOCK_COLOR;
    }
}

#[derive(Debug, Clone)]
pub struct GrenadeTool {
    state: ToolState,
}

impl GrenadeTool {
    pub fn new(now: f64) -> Self {
        Self {
            state: ToolState::new(&GRENADE, now),
        }
    }
}

impl Equipment for GrenadeTool {
    fn state(&self) -> &ToolState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ToolState {
        &mut self.state
    }

    fn on_primary(&mut self) -> bool {
        self.state.consume()
    }
}

/// A firearm. The clip is `primary_ammo`, the reserve is `secondary_ammo`.
#[derive(Debug, Clone)]
pub struct Weapon {
    state: ToolState,
    pub kind: WeaponKind,
    reloading: bool,
    reload_at: Option<f64>,
}

impl Weapon {
    pub fn new(kind: WeaponKind, now: f64) -> Self {
        Self {
            state: ToolState::new(kind.stats(), now),
            kind,
            reloading: false,
            reload_at: None,
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    pub fn clip(&self) -> u16 {
        self.state.primary_ammo
    }

    pub fn reserve(&self) -> u16 {
        self.state.secondary_ammo
    }

    /// Starts a reload finishing at `now + reload_time`. Returns false when
    /// already reloading, when the reserve is empty or when the clip is full.
    pub fn reload(&mut self, now: f64) -> bool {
        if self.reloading {
            return false;
        }
        if self.state.secondary_ammo == 0 || self.state.primary_ammo >= self.state.stats.max_primary
        {
            return false;
        }

        self.reloading = true;
        self.state.primary = false;
        self.reload_at = Some(now + self.state.stats.reload_time);
        true
    }

    pub fn cancel_reload(&mut self) {
        self.reloading = false;
        self.reload_at = None;
    }

    fn finish_reload(&mut self, now: f64) -> ToolEvent {
        self.cancel_reload();
        let stats = self.state.stats;

        if stats.one_by_one {
            if self.state.primary_ammo < stats.max_primary && self.state.secondary_ammo > 0 {
                self.state.primary_ammo += 1;
                self.state.secondary_ammo -= 1;
            }
            // Keeps loading single rounds until full or out of reserve.
            self.reload(now);
        } else {
            let deficit = stats.max_primary.saturating_sub(self.state.primary_ammo);
            let moved = deficit.min(self.state.secondary_ammo);
            self.state.primary_ammo += moved;
            self.state.secondary_ammo -= moved;
        }

        ToolEvent::Reloaded {
            clip: self.state.primary_ammo,
            reserve: self.state.secondary_ammo,
        }
    }

    /// Completes a reload whose deadline has passed. Runs even while another
    /// tool is equipped, so a reload started before switching still lands.
    pub fn poll_reload(&mut self, now: f64) -> Option<ToolEvent> {
        match self.reload_at {
            Some(deadline) if now >= deadline => Some(self.finish_reload(now)),
            _ => None,
        }
    }

    /// Damage for a reported hit, or `None` if this weapon could not have
    /// scored it right now.
    pub fn get_damage(&self, hit: Hit) -> Option<u8> {
        if !self.state.primary || self.reloading {
            return None;
        }
        let tolerance = (self.state.stats.max_primary as f32 * 0.3) as i32;
        if self.state.primary_ammo as i32 + tolerance <= 0 {
            return None;
        }
        self.state.stats.damage_for(hit)
    }
}

impl Equipment for Weapon {
    fn state(&self) -> &ToolState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ToolState {
        &mut self.state
    }

    fn set_primary(&mut self, held: bool) -> bool {
        let one_by_one = self.state.stats.one_by_one;
        if (self.state.primary_ammo == 0 || self.reloading) && !one_by_one {
            self.state.primary = false;
            return false;
        }
        if held && one_by_one && self.reloading {
            self.cancel_reload();
        }
        self.state.primary = held;
        held
    }

    /// Secondary fire is not simulated for firearms, but the input is echoed.
    fn set_secondary(&mut self, held: bool) -> bool {
        self.state.secondary = false;
        held
    }

    fn on_primary(&mut self) -> bool {
        self.state.consume()
    }

    fn update(&mut self, now: f64) -> Option<ToolEvent> {
        if let Some(event) = self.poll_reload(now) {
            return Some(event);
        }
        let (primary, _) = self.state.due(now);
        if primary && self.on_primary() {
            return Some(ToolEvent::Fired);
        }
        None
    }
}

/// The four tools every player carries.
#[derive(Debug, Clone)]
pub struct Loadout {
    pub spade: SpadeTool,
    pub block: BlockTool,
    pub weapon: Weapon,
    pub grenade: GrenadeTool,
}

impl Loadout {
    pub fn new(weapon: WeaponKind, now: f64) -> Self {
        Self {
            spade: SpadeTool::new(now),
            block: BlockTool::new(now),
            weapon: Weapon::new(weapon, now),
            grenade: GrenadeTool::new(now),
        }
    }

    pub fn get(&self, tool: Tool) -> &dyn Equipment {
        match tool {
            Tool::Spade => &self.spade,
            Tool::Block => &self.block,
            Tool::Weapon => &self.weapon,
            Tool::Grenade => &self.grenade,
        }
    }

    pub fn get_mut(&mut self, tool: Tool) -> &mut dyn Equipment {
        match tool {
            Tool::Spade => &mut self.spade,
            Tool::Block => &mut self.block,
            Tool::Weapon => &mut self.weapon,
            Tool::Grenade => &mut self.grenade,
        }
    }

    pub fn restock(&mut self) {
        self.spade.restock();
        self.block.restock();
        self.weapon.restock();
        self.grenade.restock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bounded(tool: &dyn Equipment) {
        let state = tool.state();
        assert!(state.primary_ammo <= state.stats.max_primary);
        assert!(state.secondary_ammo <= state.stats.max_secondary);
    }

    #[test]
    fn test_semi_fire_and_reload() {
        let mut semi = Weapon::new(WeaponKind::Semi, 0.0);
        assert!(semi.set_primary(true));

        assert_eq!(semi.update(0.0), Some(ToolEvent::Fired));
        assert_eq!(semi.clip(), 9);

        // Cooldown of 0.5s holds the next shot back.
        assert_eq!(semi.update(0.2), None);
        assert_eq!(semi.clip(), 9);

        assert!(semi.reload(0.3));
        assert!(semi.is_reloading());
        assert!(!semi.state().primary);

        assert_eq!(semi.update(2.0), None);
        assert_eq!(
            semi.update(3.0),
            Some(ToolEvent::Reloaded {
                clip: 10,
                reserve: 49
            })
        );
        assert!(!semi.is_reloading());
        assert_eq!(semi.clip(), 10);
        assert_eq!(semi.reserve(), 49);
    }

    #[test]
    fn test_reload_rejected() {
        let mut smg = Weapon::new(WeaponKind::Smg, 0.0);
        assert!(!smg.reload(0.0), "full clip");

        smg.state_mut().primary_ammo = 5;
        smg.state_mut().secondary_ammo = 0;
        assert!(!smg.reload(0.0), "empty reserve");

        smg.state_mut().secondary_ammo = 10;
        assert!(smg.reload(0.0));
        assert!(!smg.reload(0.1), "already reloading");
    }

    #[test]
    fn test_trigger_refused_while_reloading_or_empty() {
        let mut semi = Weapon::new(WeaponKind::Semi, 0.0);
        semi.state_mut().primary_ammo = 3;
        semi.reload(0.0);
        assert!(!semi.set_primary(true));
        assert!(!semi.state().primary);

        let mut empty = Weapon::new(WeaponKind::Rpg, 0.0);
        empty.state_mut().primary_ammo = 0;
        assert!(!empty.set_primary(true));
    }

    #[test]
    fn test_shotgun_reloads_one_by_one() {
        let mut shotgun = Weapon::new(WeaponKind::Shotgun, 0.0);
        shotgun.state_mut().primary_ammo = 4;
        assert!(shotgun.reload(0.0));

        assert_eq!(
            shotgun.update(0.5),
            Some(ToolEvent::Reloaded {
                clip: 5,
                reserve: 47
            })
        );
        assert!(shotgun.is_reloading(), "chains into the next round");

        assert_eq!(
            shotgun.update(1.0),
            Some(ToolEvent::Reloaded {
                clip: 6,
                reserve: 46
            })
        );
        assert!(!shotgun.is_reloading());
    }

    #[test]
    fn test_shotgun_trigger_cancels_reload() {
        let mut shotgun = Weapon::new(WeaponKind::Shotgun, 0.0);
        shotgun.state_mut().primary_ammo = 2;
        shotgun.reload(0.0);

        assert!(shotgun.set_primary(true));
        assert!(!shotgun.is_reloading());
        assert_eq!(shotgun.update(1.0), Some(ToolEvent::Fired));
        assert_eq!(shotgun.clip(), 1);
        assert_eq!(shotgun.reserve(), 48);
    }

    #[test]
    fn test_damage_requires_trigger() {
        let mut semi = Weapon::new(WeaponKind::Semi, 0.0);
        assert_eq!(semi.get_damage(Hit::Head), None);

        semi.set_primary(true);
        assert_eq!(semi.get_damage(Hit::Head), Some(100));
        assert_eq!(semi.get_damage(Hit::Melee), None);

        let mut rpg = Weapon::new(WeaponKind::Rpg, 0.0);
        rpg.set_primary(true);
        assert_eq!(rpg.get_damage(Hit::Torso), None);
    }

    #[test]
    fn test_block_pool_recycles() {
        let mut block = BlockTool::new(0.0);
        for _ in 0..50 {
            assert!(block.build());
        }
        assert!(!block.build());
        block.destroy();
        assert_eq!(block.blocks(), 1);

        block.restock();
        block.destroy();
        assert_eq!(block.blocks(), 50);
    }

    #[test]
    fn test_grenade_charges() {
        let mut grenade = GrenadeTool::new(0.0);
        assert!(grenade.on_primary());
        assert!(grenade.on_primary());
        assert!(grenade.on_primary());
        assert!(!grenade.on_primary());
        assert_eq!(grenade.state().primary_ammo, 0);
    }

    #[test]
    fn test_block_reset_restores_color() {
        let mut block = BlockTool::new(0.0);
        block.color = Color::new(1, 2, 3);
        block.reset();
        assert_eq!(block.color, DEFAULT_BLOCK_COLOR);
    }

    #[test]
    fn test_ammo_stays_bounded() {
        let mut loadout = Loadout::new(WeaponKind::Smg, 0.0);
        let mut now = 0.0;

        for step in 0..2_000u32 {
            now += 0.05;
            match step % 7 {
                0 => {
                    loadout.weapon.set_primary(true);
                }
                1 => {
                    loadout.weapon.reload(now);
                }
                2 => {
                    loadout.block.build();
                }
                3 => loadout.block.destroy(),
                4 if step % 91 == 4 => loadout.restock(),
                5 => {
                    loadout.grenade.on_primary();
                }
                _ => {}
            }
            loadout.weapon.update(now);

            for tool in [Tool::Spade, Tool::Block, Tool::Weapon, Tool::Grenade] {
                assert_bounded(loadout.get(tool));
            }
            if loadout.weapon.is_reloading() {
                assert!(!loadout.weapon.state().primary);
            }
        }
    }

    #[test]
    fn test_reload_completes_while_holstered() {
        let mut loadout = Loadout::new(WeaponKind::Semi, 0.0);
        loadout.weapon.state_mut().primary_ammo = 0;
        assert!(loadout.weapon.reload(0.0));

        assert_eq!(loadout.weapon.poll_reload(1.0), None);
        assert_eq!(
            loadout.weapon.poll_reload(2.5),
            Some(ToolEvent::Reloaded {
                clip: 10,
                reserve: 40
            })
        );
        assert_eq!(loadout.weapon.poll_reload(5.0), None);
    }

    #[test]
    fn test_release_clears_triggers() {
        let mut loadout = Loadout::new(WeaponKind::Semi, 0.0);
        let tool = loadout.get_mut(Tool::Weapon);
        tool.set_primary(true);
        tool.release();
        assert!(!tool.state().primary);
        assert!(!tool.state().secondary);
    }
}
