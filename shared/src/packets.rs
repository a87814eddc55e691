//! Packet types exchanged between game client, relay and backend server.
//!
//! Each packet body is a plain serde struct encoded with `bincode`, except
//! [`EntityUpdate`] whose body is a presence bitmask followed by only the
//! field groups the mask names.

use crate::codec::{body_options, CodecError};
use crate::entity::{
    Appearance, ClassInfo, EntityId, EntityPatch, FieldGroup, FieldMask, Item, LevelInfo,
    Multipliers, Vector3,
};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const INTERACT_NORMAL: u8 = 3;
pub const INTERACT_DROP: u8 = 4;
pub const INTERACT_PICKUP: u8 = 5;

/// Identifies a packet type independently of the numeric id either direction
/// assigns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    EntityUpdate,
    Interact,
    Hit,
    Shoot,
    ClientChat,
    ChunkDiscovered,
    SectorDiscovered,
    ClientVersion,
    UpdateFinished,
    CurrentTime,
    ServerChat,
    SeedData,
    Join,
    ServerMismatch,
    ServerFull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    EntityUpdate(EntityUpdate),
    Interact(InteractPacket),
    Hit(HitPacket),
    Shoot(ShootPacket),
    ClientChat(ClientChatMessage),
    ChunkDiscovered(ChunkDiscovered),
    SectorDiscovered(SectorDiscovered),
    ClientVersion(ClientVersion),
    UpdateFinished(UpdateFinished),
    CurrentTime(CurrentTime),
    ServerChat(ServerChatMessage),
    SeedData(SeedData),
    Join(JoinPacket),
    ServerMismatch(ServerMismatch),
    ServerFull(ServerFull),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::EntityUpdate(_) => PacketKind::EntityUpdate,
            Packet::Interact(_) => PacketKind::Interact,
            Packet::Hit(_) => PacketKind::Hit,
            Packet::Shoot(_) => PacketKind::Shoot,
            Packet::ClientChat(_) => PacketKind::ClientChat,
            Packet::ChunkDiscovered(_) => PacketKind::ChunkDiscovered,
            Packet::SectorDiscovered(_) => PacketKind::SectorDiscovered,
            Packet::ClientVersion(_) => PacketKind::ClientVersion,
            Packet::UpdateFinished(_) => PacketKind::UpdateFinished,
            Packet::CurrentTime(_) => PacketKind::CurrentTime,
            Packet::ServerChat(_) => PacketKind::ServerChat,
            Packet::SeedData(_) => PacketKind::SeedData,
            Packet::Join(_) => PacketKind::Join,
            Packet::ServerMismatch(_) => PacketKind::ServerMismatch,
            Packet::ServerFull(_) => PacketKind::ServerFull,
        }
    }

    /// Server chat line with no speaking entity.
    pub fn server_chat(value: impl Into<String>) -> Self {
        Packet::ServerChat(ServerChatMessage {
            entity_id: 0,
            value: value.into(),
        })
    }
}

/// A packet body with a fixed binary layout.
///
/// Implementations are registered with a [`crate::codec::Schema`] under the
/// numeric id their direction uses.
pub trait PacketBody: Sized {
    const KIND: PacketKind;

    fn read(body: &[u8]) -> Result<Self, CodecError>;

    fn write(&self, out: &mut Vec<u8>) -> Result<(), CodecError>;

    fn into_packet(self) -> Packet;

    fn from_packet(packet: &Packet) -> Option<&Self>;
}

macro_rules! bincode_body {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl PacketBody for $ty {
                const KIND: PacketKind = PacketKind::$variant;

                fn read(body: &[u8]) -> Result<Self, CodecError> {
                    body_options()
                        .deserialize(body)
                        .map_err(|e| CodecError::malformed(Self::KIND, e))
                }

                fn write(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
                    body_options()
                        .serialize_into(out, self)
                        .map_err(|e| CodecError::Encode(e.to_string()))
                }

                fn into_packet(self) -> Packet {
                    Packet::$variant(self)
                }

                fn from_packet(packet: &Packet) -> Option<&Self> {
                    match packet {
                        Packet::$variant(body) => Some(body),
                        _ => None,
                    }
                }
            }
        )*
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractPacket {
    pub entity_id: EntityId,
    pub item: Item,
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub item_index: i32,
    pub interact_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitPacket {
    pub entity_id: EntityId,
    pub target_id: EntityId,
    pub damage: f32,
    pub critical: bool,
    pub stun_duration: u32,
    pub pos: Vector3,
    pub hit_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShootPacket {
    pub entity_id: EntityId,
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub pos: Vector3,
    pub velocity: [f32; 3],
    pub projectile: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientChatMessage {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDiscovered {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorDiscovered {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFinished;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTime {
    pub day: u32,
    pub time: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerChatMessage {
    pub entity_id: EntityId,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedData {
    pub seed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPacket {
    pub entity_id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMismatch {
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFull;

bincode_body! {
    InteractPacket => Interact,
    HitPacket => Hit,
    ShootPacket => Shoot,
    ClientChatMessage => ClientChat,
    ChunkDiscovered => ChunkDiscovered,
    SectorDiscovered => SectorDiscovered,
    ClientVersion => ClientVersion,
    UpdateFinished => UpdateFinished,
    CurrentTime => CurrentTime,
    ServerChatMessage => ServerChat,
    SeedData => SeedData,
    JoinPacket => Join,
    ServerMismatch => ServerMismatch,
    ServerFull => ServerFull,
}

/// Partial entity state for one entity.
///
/// Wire layout: `entity_id: u64le`, `mask: u64le`, then one bincode value per
/// set bit in ascending bit order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityUpdate {
    pub entity_id: EntityId,
    pub patch: EntityPatch,
}

impl EntityUpdate {
    pub fn new(entity_id: EntityId, patch: EntityPatch) -> Self {
        Self { entity_id, patch }
    }

    pub fn mask(&self) -> FieldMask {
        self.patch.mask()
    }
}

fn read_group<T: DeserializeOwned>(rest: &mut &[u8]) -> Result<Option<T>, CodecError> {
    body_options()
        .deserialize_from(rest)
        .map(Some)
        .map_err(|e| CodecError::malformed(PacketKind::EntityUpdate, e))
}

fn write_group<T: Serialize>(out: &mut Vec<u8>, value: &Option<T>) -> Result<(), CodecError> {
    match value {
        Some(value) => body_options()
            .serialize_into(out, value)
            .map_err(|e| CodecError::Encode(e.to_string())),
        None => Ok(()),
    }
}

impl PacketBody for EntityUpdate {
    const KIND: PacketKind = PacketKind::EntityUpdate;

    fn read(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < 16 {
            return Err(CodecError::Malformed {
                kind: Self::KIND,
                reason: format!("header needs 16 bytes, got {}", body.len()),
            });
        }
        let (header, mut rest) = body.split_at(16);
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&header[..8]);
        let mut mask_bytes = [0u8; 8];
        mask_bytes.copy_from_slice(&header[8..]);

        let entity_id = u64::from_le_bytes(id_bytes);
        let bits = u64::from_le_bytes(mask_bytes);
        let mask = FieldMask::from_bits(bits).ok_or_else(|| CodecError::Malformed {
            kind: Self::KIND,
            reason: format!("unknown field group bits {bits:#x}"),
        })?;

        let mut patch = EntityPatch::default();
        for group in mask.groups() {
            let rest = &mut rest;
            match group {
                FieldGroup::Position => patch.pos = read_group::<Vector3>(rest)?,
                FieldGroup::Name => patch.name = read_group::<String>(rest)?,
                FieldGroup::Health => patch.hp = read_group::<f32>(rest)?,
                FieldGroup::Level => patch.level = read_group::<LevelInfo>(rest)?,
                FieldGroup::Class => patch.class = read_group::<ClassInfo>(rest)?,
                FieldGroup::Equipment => patch.equipment = read_group(rest)?,
                FieldGroup::Skills => patch.skills = read_group(rest)?,
                FieldGroup::Flags => patch.flags = read_group::<u32>(rest)?,
                FieldGroup::Appearance => patch.appearance = read_group::<Appearance>(rest)?,
                FieldGroup::Consumable => patch.consumable = read_group::<Item>(rest)?,
                FieldGroup::ChargedMp => patch.charged_mp = read_group::<f32>(rest)?,
                FieldGroup::Mode => patch.mode = read_group::<u8>(rest)?,
                FieldGroup::Multiplier => patch.multipliers = read_group::<Multipliers>(rest)?,
            }
        }

        if !rest.is_empty() {
            return Err(CodecError::Malformed {
                kind: Self::KIND,
                reason: format!("{} trailing bytes after field groups", rest.len()),
            });
        }

        Ok(EntityUpdate { entity_id, patch })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let patch = &self.patch;
        out.extend_from_slice(&self.entity_id.to_le_bytes());
        out.extend_from_slice(&patch.mask().bits().to_le_bytes());
        write_group(out, &patch.pos)?;
        write_group(out, &patch.name)?;
        write_group(out, &patch.hp)?;
        write_group(out, &patch.level)?;
        write_group(out, &patch.class)?;
        write_group(out, &patch.equipment)?;
        write_group(out, &patch.skills)?;
        write_group(out, &patch.flags)?;
        write_group(out, &patch.appearance)?;
        write_group(out, &patch.consumable)?;
        write_group(out, &patch.charged_mp)?;
        write_group(out, &patch.mode)?;
        write_group(out, &patch.multipliers)?;
        Ok(())
    }

    fn into_packet(self) -> Packet {
        Packet::EntityUpdate(self)
    }

    fn from_packet(packet: &Packet) -> Option<&Self> {
        match packet {
            Packet::EntityUpdate(update) => Some(update),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EQUIPMENT_SLOTS, SKILL_SLOTS};

    #[test]
    fn test_entity_update_body_only_carries_present_groups() {
        let update = EntityUpdate::new(
            42,
            EntityPatch {
                name: Some("Nyx".to_string()),
                ..Default::default()
            },
        );

        let mut body = Vec::new();
        update.write(&mut body).unwrap();

        // id + mask + (u64 length prefix + 3 bytes of name)
        assert_eq!(body.len(), 8 + 8 + 8 + 3);
        assert_eq!(EntityUpdate::read(&body).unwrap(), update);
    }

    #[test]
    fn test_entity_update_full_patch() {
        let update = EntityUpdate::new(
            3,
            EntityPatch {
                pos: Some(Vector3::new(-5, 6, 7)),
                name: Some("Full".to_string()),
                hp: Some(500.0),
                level: Some(LevelInfo { level: 4, xp: 99 }),
                class: Some(ClassInfo {
                    class_type: 2,
                    specialization: 1,
                }),
                equipment: Some([Item::default(); EQUIPMENT_SLOTS]),
                skills: Some([1; SKILL_SLOTS]),
                flags: Some(0x40),
                appearance: Some(Appearance::default()),
                consumable: Some(Item {
                    item_type: 1,
                    ..Default::default()
                }),
                charged_mp: Some(0.25),
                mode: Some(9),
                multipliers: Some(Multipliers::default()),
            },
        );
        assert_eq!(update.mask(), FieldMask::ALL);

        let mut body = Vec::new();
        update.write(&mut body).unwrap();
        assert_eq!(EntityUpdate::read(&body).unwrap(), update);
    }

    #[test]
    fn test_entity_update_rejects_unknown_mask_bit() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u64.to_le_bytes());
        body.extend_from_slice(&(1u64 << 40).to_le_bytes());

        let err = EntityUpdate::read(&body).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_entity_update_rejects_trailing_bytes() {
        let update = EntityUpdate::new(
            1,
            EntityPatch {
                mode: Some(1),
                ..Default::default()
            },
        );
        let mut body = Vec::new();
        update.write(&mut body).unwrap();
        body.push(0xAA);

        assert!(EntityUpdate::read(&body).is_err());
    }

    #[test]
    fn test_entity_update_rejects_truncated_group() {
        let update = EntityUpdate::new(
            1,
            EntityPatch {
                pos: Some(Vector3::new(1, 2, 3)),
                ..Default::default()
            },
        );
        let mut body = Vec::new();
        update.write(&mut body).unwrap();
        body.truncate(body.len() - 4);

        assert!(EntityUpdate::read(&body).is_err());
    }

    #[test]
    fn test_bincode_body_accessors() {
        let packet = ClientChatMessage {
            value: "hi".to_string(),
        }
        .into_packet();
        assert_eq!(packet.kind(), PacketKind::ClientChat);
        assert!(ClientChatMessage::from_packet(&packet).is_some());
        assert!(HitPacket::from_packet(&packet).is_none());
    }
}
