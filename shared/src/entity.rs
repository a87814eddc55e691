//! Player entity state and the field-group bitmask used to merge partial updates
//!
//! The game streams each avatar as a series of sparse updates: every update
//! carries only the logical field groups that changed, flagged by a bitmask.
//! This module owns the authoritative [`EntityRecord`] that those updates are
//! folded into, and the [`FieldMask`] bitset that records which groups a merge
//! touched.
//!
//! Field groups are independent: merging one group never reads or writes
//! another. The record's `dirty_mask` accumulates every group touched since the
//! last server tick and is cleared by the tick, never by a merge, so every
//! consumer within one tick sees the same mask.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Numeric entity identifier, assigned by the backend server.
pub type EntityId = u64;

/// World units per chunk along each horizontal axis.
pub const CHUNK_SCALE: i64 = 0x100_0000;

/// Health ceiling applied by heals.
pub const MAX_HP: f32 = 1000.0;

pub const EQUIPMENT_SLOTS: usize = 13;
pub const SKILL_SLOTS: usize = 11;

/// Position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Vector3 {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Coarse 2-D grid cell used for distance and world-border checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub x: i64,
    pub y: i64,
}

impl Chunk {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Coordinate of the chunk's origin corner in world units.
    pub fn origin(&self) -> Vector3 {
        Vector3::new(self.x * CHUNK_SCALE, self.y * CHUNK_SCALE, 0)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Buckets the horizontal coordinates of a position into chunk-grid cells.
///
/// Uses floor division so that the cell boundaries are uniform across zero.
pub fn chunk_of(pos: &Vector3) -> Chunk {
    Chunk {
        x: pos.x.div_euclid(CHUNK_SCALE),
        y: pos.y.div_euclid(CHUNK_SCALE),
    }
}

/// Bitset with one bit per logical field group of an entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldMask(u64);

impl FieldMask {
    pub const EMPTY: Self = Self(0);
    pub const POSITION: Self = Self(1 << 0);
    pub const NAME: Self = Self(1 << 1);
    pub const HEALTH: Self = Self(1 << 2);
    pub const LEVEL: Self = Self(1 << 3);
    pub const CLASS: Self = Self(1 << 4);
    pub const EQUIPMENT: Self = Self(1 << 5);
    pub const SKILLS: Self = Self(1 << 6);
    pub const FLAGS: Self = Self(1 << 7);
    pub const APPEARANCE: Self = Self(1 << 8);
    pub const CONSUMABLE: Self = Self(1 << 9);
    pub const CHARGED_MP: Self = Self(1 << 10);
    pub const MODE: Self = Self(1 << 11);
    pub const MULTIPLIER: Self = Self(1 << 12);
    pub const ALL: Self = Self((1 << 13) - 1);

    /// Returns `None` if `bits` names a group that does not exist.
    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits & !Self::ALL.0 != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Iterates the groups set in this mask in ascending bit order.
    pub fn groups(self) -> impl Iterator<Item = FieldGroup> {
        FieldGroup::ALL
            .into_iter()
            .filter(move |group| self.contains(group.mask()))
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FieldMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({self})")
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty");
        }
        let names: Vec<&str> = self.groups().map(FieldGroup::name).collect();
        f.write_str(&names.join("|"))
    }
}

/// A named, independently updatable subset of an entity's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    Position,
    Name,
    Health,
    Level,
    Class,
    Equipment,
    Skills,
    Flags,
    Appearance,
    Consumable,
    ChargedMp,
    Mode,
    Multiplier,
}

impl FieldGroup {
    /// Every group, in bit order.
    pub const ALL: [FieldGroup; 13] = [
        FieldGroup::Position,
        FieldGroup::Name,
        FieldGroup::Health,
        FieldGroup::Level,
        FieldGroup::Class,
        FieldGroup::Equipment,
        FieldGroup::Skills,
        FieldGroup::Flags,
        FieldGroup::Appearance,
        FieldGroup::Consumable,
        FieldGroup::ChargedMp,
        FieldGroup::Mode,
        FieldGroup::Multiplier,
    ];

    pub const fn mask(self) -> FieldMask {
        FieldMask(1 << self as u64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            FieldGroup::Position => "pos",
            FieldGroup::Name => "name",
            FieldGroup::Health => "hp",
            FieldGroup::Level => "level",
            FieldGroup::Class => "class",
            FieldGroup::Equipment => "equipment",
            FieldGroup::Skills => "skill",
            FieldGroup::Flags => "flags",
            FieldGroup::Appearance => "appearance",
            FieldGroup::Consumable => "consumable",
            FieldGroup::ChargedMp => "charged_mp",
            FieldGroup::Mode => "mode",
            FieldGroup::Multiplier => "multiplier",
        }
    }

    /// Name of the hook event fired when this group changes.
    pub const fn event_name(self) -> &'static str {
        match self {
            FieldGroup::Position => "on_pos_update",
            FieldGroup::Name => "on_name_update",
            FieldGroup::Health => "on_hp_update",
            FieldGroup::Level => "on_level_update",
            FieldGroup::Class => "on_class_update",
            FieldGroup::Equipment => "on_equipment_update",
            FieldGroup::Skills => "on_skill_update",
            FieldGroup::Flags => "on_flags_update",
            FieldGroup::Appearance => "on_appearance_update",
            FieldGroup::Consumable => "on_consumable_update",
            FieldGroup::ChargedMp => "on_charged_mp_update",
            FieldGroup::Mode => "on_mode_update",
            FieldGroup::Multiplier => "on_multiplier_update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Item {
    pub item_type: u8,
    pub sub_type: u8,
    pub modifier: u32,
    pub rarity: u8,
    pub material: u8,
    pub level: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Appearance {
    pub hair_color: [u8; 3],
    pub body_scale: f32,
    pub head_model: u16,
    pub hair_model: u16,
    pub hand_model: u16,
    pub feet_model: u16,
    pub body_model: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Multipliers {
    pub max_hp: f32,
    pub shoot_speed: f32,
    pub damage: f32,
    pub armor: f32,
    pub resistance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LevelInfo {
    pub level: u32,
    pub xp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassInfo {
    pub class_type: u8,
    pub specialization: u8,
}

/// Sparse set of field-group values carried by one entity update.
///
/// Each `Some` field is one present group; the presence bitmask is derived
/// from which fields are set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityPatch {
    pub pos: Option<Vector3>,
    pub name: Option<String>,
    pub hp: Option<f32>,
    pub level: Option<LevelInfo>,
    pub class: Option<ClassInfo>,
    pub equipment: Option<[Item; EQUIPMENT_SLOTS]>,
    pub skills: Option<[u32; SKILL_SLOTS]>,
    pub flags: Option<u32>,
    pub appearance: Option<Appearance>,
    pub consumable: Option<Item>,
    pub charged_mp: Option<f32>,
    pub mode: Option<u8>,
    pub multipliers: Option<Multipliers>,
}

impl EntityPatch {
    /// Mask of the groups present in this patch.
    pub fn mask(&self) -> FieldMask {
        let mut mask = FieldMask::EMPTY;
        let present = [
            (self.pos.is_some(), FieldMask::POSITION),
            (self.name.is_some(), FieldMask::NAME),
            (self.hp.is_some(), FieldMask::HEALTH),
            (self.level.is_some(), FieldMask::LEVEL),
            (self.class.is_some(), FieldMask::CLASS),
            (self.equipment.is_some(), FieldMask::EQUIPMENT),
            (self.skills.is_some(), FieldMask::SKILLS),
            (self.flags.is_some(), FieldMask::FLAGS),
            (self.appearance.is_some(), FieldMask::APPEARANCE),
            (self.consumable.is_some(), FieldMask::CONSUMABLE),
            (self.charged_mp.is_some(), FieldMask::CHARGED_MP),
            (self.mode.is_some(), FieldMask::MODE),
            (self.multipliers.is_some(), FieldMask::MULTIPLIER),
        ];
        for (is_set, bit) in present {
            if is_set {
                mask |= bit;
            }
        }
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask().is_empty()
    }
}

/// Authoritative state of one player's avatar.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub pos: Vector3,
    pub name: String,
    pub hp: f32,
    pub level: LevelInfo,
    pub class: ClassInfo,
    pub equipment: [Item; EQUIPMENT_SLOTS],
    pub skills: [u32; SKILL_SLOTS],
    pub flags: u32,
    pub appearance: Appearance,
    pub consumable: Item,
    pub charged_mp: f32,
    pub mode: u8,
    pub multipliers: Multipliers,
    /// Groups touched since the last server tick.
    pub dirty_mask: FieldMask,
}

impl EntityRecord {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            pos: Vector3::default(),
            name: String::new(),
            hp: MAX_HP,
            level: LevelInfo::default(),
            class: ClassInfo::default(),
            equipment: [Item::default(); EQUIPMENT_SLOTS],
            skills: [0; SKILL_SLOTS],
            flags: 0,
            appearance: Appearance::default(),
            consumable: Item::default(),
            charged_mp: 0.0,
            mode: 0,
            multipliers: Multipliers::default(),
            dirty_mask: FieldMask::EMPTY,
        }
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn chunk(&self) -> Chunk {
        chunk_of(&self.pos)
    }

    /// Overwrites exactly the groups present in `patch`.
    ///
    /// The touched groups are OR-ed into `dirty_mask`; the return value is the
    /// mask of groups touched by this call alone.
    pub fn merge(&mut self, patch: &EntityPatch) -> FieldMask {
        if let Some(pos) = patch.pos {
            self.pos = pos;
        }
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(hp) = patch.hp {
            self.hp = hp;
        }
        if let Some(level) = patch.level {
            self.level = level;
        }
        if let Some(class) = patch.class {
            self.class = class;
        }
        if let Some(equipment) = patch.equipment {
            self.equipment = equipment;
        }
        if let Some(skills) = patch.skills {
            self.skills = skills;
        }
        if let Some(flags) = patch.flags {
            self.flags = flags;
        }
        if let Some(appearance) = patch.appearance {
            self.appearance = appearance;
        }
        if let Some(consumable) = patch.consumable {
            self.consumable = consumable;
        }
        if let Some(charged_mp) = patch.charged_mp {
            self.charged_mp = charged_mp;
        }
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(multipliers) = patch.multipliers {
            self.multipliers = multipliers;
        }

        let touched = patch.mask();
        self.dirty_mask |= touched;
        touched
    }

    /// Builds a sparse patch holding the current values of the groups in `mask`.
    pub fn to_patch(&self, mask: FieldMask) -> EntityPatch {
        let has = |group: FieldMask| mask.contains(group);
        EntityPatch {
            pos: has(FieldMask::POSITION).then_some(self.pos),
            name: has(FieldMask::NAME).then(|| self.name.clone()),
            hp: has(FieldMask::HEALTH).then_some(self.hp),
            level: has(FieldMask::LEVEL).then_some(self.level),
            class: has(FieldMask::CLASS).then_some(self.class),
            equipment: has(FieldMask::EQUIPMENT).then_some(self.equipment),
            skills: has(FieldMask::SKILLS).then_some(self.skills),
            flags: has(FieldMask::FLAGS).then_some(self.flags),
            appearance: has(FieldMask::APPEARANCE).then_some(self.appearance),
            consumable: has(FieldMask::CONSUMABLE).then_some(self.consumable),
            charged_mp: has(FieldMask::CHARGED_MP).then_some(self.charged_mp),
            mode: has(FieldMask::MODE).then_some(self.mode),
            multipliers: has(FieldMask::MULTIPLIER).then_some(self.multipliers),
        }
    }

    /// Called once per server tick after every consumer has seen the mask.
    pub fn clear_dirty(&mut self) {
        self.dirty_mask.clear();
    }
}
