use log::{debug, info};
use rand::Rng;
use shared::packets::{ClientChatMessage, EntityUpdate};
use shared::{EntityId, EntityPatch, EntityRecord, FieldMask, Packet, Vector3, CHUNK_SCALE};

/// Where a fresh bot appears; the middle of the default world.
pub const START_POSITION: Vector3 = Vector3 {
    x: 550_301_073_408,
    y: 550_301_073_408,
    z: 1_000_000,
};

/// Largest per-axis distance covered by one random step.
pub const MAX_STEP: i64 = CHUNK_SCALE / 8;

/// The bot's own avatar, kept in step with what the server reports.
#[derive(Debug, Clone)]
pub struct LocalPlayer {
    pub record: EntityRecord,
    pub chat_log: Vec<String>,
    joined: bool,
}

impl LocalPlayer {
    pub fn new(entity_id: EntityId, name: &str) -> Self {
        let mut record = EntityRecord::new(entity_id);
        record.name = name.to_string();
        record.pos = START_POSITION;
        Self {
            record,
            chat_log: Vec::new(),
            joined: false,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.record.id
    }

    /// True once the server has assigned us an entity id.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Full state update announcing the player, the way a game client does
    /// right after connecting.
    pub fn join_packet(&self) -> Packet {
        let patch = self
            .record
            .to_patch(FieldMask::POSITION | FieldMask::NAME | FieldMask::HEALTH);
        Packet::EntityUpdate(EntityUpdate::new(self.record.id, patch))
    }

    pub fn chat(text: &str) -> Packet {
        Packet::ClientChat(ClientChatMessage {
            value: text.to_string(),
        })
    }

    /// Moves a short random distance and returns the matching update.
    pub fn wander<R: Rng>(&mut self, rng: &mut R) -> Packet {
        self.record.pos.x += rng.gen_range(-MAX_STEP..=MAX_STEP);
        self.record.pos.y += rng.gen_range(-MAX_STEP..=MAX_STEP);
        let patch = EntityPatch {
            pos: Some(self.record.pos),
            ..Default::default()
        };
        Packet::EntityUpdate(EntityUpdate::new(self.record.id, patch))
    }

    /// Applies a packet from the server.
    ///
    /// Returns the chat line to show, if the packet carried one.
    pub fn apply(&mut self, packet: &Packet) -> Option<String> {
        match packet {
            Packet::Join(join) => {
                if join.entity_id != self.record.id {
                    debug!("Server moved us from #{} to #{}", self.record.id, join.entity_id);
                    self.record.id = join.entity_id;
                }
                self.joined = true;
                None
            }
            Packet::EntityUpdate(update) if update.entity_id == self.record.id => {
                let touched = self.record.merge(&update.patch);
                if touched.contains(FieldMask::POSITION) {
                    info!("Server placed us at {}", self.record.pos);
                }
                None
            }
            Packet::ServerChat(chat) => {
                let line = if chat.entity_id == 0 {
                    chat.value.clone()
                } else {
                    format!("#{}: {}", chat.entity_id, chat.value)
                };
                self.chat_log.push(line.clone());
                Some(line)
            }
            _ => None,
        }
    }
}
