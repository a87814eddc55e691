//! Packet framing over a TCP byte stream.
//!
//! Every packet on the wire is framed as:
//!
//! ```text
//! +------------------+------------------+---------------------+
//! | type id (u32 LE) | body len (u32 LE)| body (len bytes)    |
//! +------------------+------------------+---------------------+
//! ```
//!
//! The type id is looked up in a [`Schema`], one per direction; the two
//! directions do not share an id space. [`PacketCodec`] is fed arbitrary
//! chunks of the stream, keeps a partial trailing packet across calls and
//! yields complete packets in order. Decode failures are returned to the
//! caller rather than raised, so the caller decides what a bad packet costs.

use crate::packets::{
    ChunkDiscovered, ClientChatMessage, ClientVersion, CurrentTime, EntityUpdate, HitPacket,
    InteractPacket, JoinPacket, Packet, PacketBody, PacketKind, SectorDiscovered, SeedData,
    ServerChatMessage, ServerFull, ServerMismatch, ShootPacket, UpdateFinished,
};
use bincode::Options;
use std::collections::HashMap;
use std::fmt;

/// Largest body accepted or produced, in bytes.
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Size of the type id + body length prefix.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown packet type {type_id}")]
    UnknownPacket { type_id: u32 },

    #[error("packet type {type_id} declares {size} byte body (max {max})")]
    PayloadTooLarge { type_id: u32, size: u32, max: u32 },

    #[error("malformed {kind:?} packet: {reason}")]
    Malformed { kind: PacketKind, reason: String },

    #[error("{kind:?} is not part of the {schema} schema")]
    NotInSchema { kind: PacketKind, schema: &'static str },

    #[error("failed to encode packet: {0}")]
    Encode(String),
}

impl CodecError {
    pub(crate) fn malformed(kind: PacketKind, reason: impl fmt::Display) -> Self {
        CodecError::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

pub(crate) fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PACKET_SIZE as u64)
}

type DecodeFn = fn(&[u8]) -> Result<Packet, CodecError>;
type EncodeFn = fn(&Packet, &mut Vec<u8>) -> Result<(), CodecError>;

fn decode_as<T: PacketBody>(body: &[u8]) -> Result<Packet, CodecError> {
    T::read(body).map(T::into_packet)
}

fn encode_as<T: PacketBody>(packet: &Packet, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match T::from_packet(packet) {
        Some(body) => body.write(out),
        None => Err(CodecError::Encode(format!(
            "{:?} registered for {:?}",
            packet.kind(),
            T::KIND
        ))),
    }
}

#[derive(Clone, Copy)]
struct SchemaEntry {
    kind: PacketKind,
    decode: DecodeFn,
    encode: EncodeFn,
}

/// Registry of the packet types one direction of the protocol may carry.
#[derive(Clone)]
pub struct Schema {
    name: &'static str,
    by_id: HashMap<u32, SchemaEntry>,
    ids: HashMap<PacketKind, u32>,
}

impl Schema {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            by_id: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    /// Registers `T` under `type_id`, replacing any previous registration.
    pub fn register<T: PacketBody>(&mut self, type_id: u32) -> &mut Self {
        self.by_id.insert(
            type_id,
            SchemaEntry {
                kind: T::KIND,
                decode: decode_as::<T>,
                encode: encode_as::<T>,
            },
        );
        self.ids.insert(T::KIND, type_id);
        self
    }

    /// Packets the game client sends.
    pub fn client_to_server() -> Self {
        let mut schema = Schema::new("client->server");
        schema
            .register::<EntityUpdate>(0)
            .register::<InteractPacket>(6)
            .register::<HitPacket>(7)
            .register::<ShootPacket>(9)
            .register::<ClientChatMessage>(10)
            .register::<ChunkDiscovered>(11)
            .register::<SectorDiscovered>(12)
            .register::<ClientVersion>(17);
        schema
    }

    /// Packets the game server sends.
    pub fn server_to_client() -> Self {
        let mut schema = Schema::new("server->client");
        schema
            .register::<EntityUpdate>(0)
            .register::<UpdateFinished>(2)
            .register::<CurrentTime>(5)
            .register::<ServerChatMessage>(10)
            .register::<SeedData>(15)
            .register::<JoinPacket>(16)
            .register::<ServerMismatch>(17)
            .register::<ServerFull>(18);
        schema
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind_of(&self, type_id: u32) -> Option<PacketKind> {
        self.by_id.get(&type_id).map(|entry| entry.kind)
    }

    pub fn type_id_of(&self, kind: PacketKind) -> Option<u32> {
        self.ids.get(&kind).copied()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("packets", &self.by_id.len())
            .finish()
    }
}

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Packet(Packet),
    NeedMore,
}

/// Frames and unframes packets for one direction of one connection.
#[derive(Debug)]
pub struct PacketCodec {
    schema: Schema,
    buffer: Vec<u8>,
    /// Start of the first unconsumed byte in `buffer`.
    read_pos: usize,
}

impl PacketCodec {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            buffer: Vec::new(),
            read_pos: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decodes at most one packet from the front of `bytes`.
    ///
    /// Returns the outcome and the number of bytes it consumed; `NeedMore`
    /// always consumes zero bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Decoded, usize), CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Ok((Decoded::NeedMore, 0));
        }

        let type_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let entry = self
            .schema
            .by_id
            .get(&type_id)
            .ok_or(CodecError::UnknownPacket { type_id })?;

        if body_len > MAX_PACKET_SIZE {
            return Err(CodecError::PayloadTooLarge {
                type_id,
                size: body_len,
                max: MAX_PACKET_SIZE,
            });
        }

        let total = HEADER_SIZE + body_len as usize;
        if bytes.len() < total {
            return Ok((Decoded::NeedMore, 0));
        }

        let packet = (entry.decode)(&bytes[HEADER_SIZE..total])?;
        Ok((Decoded::Packet(packet), total))
    }

    /// Appends received bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        if self.read_pos > 0 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete packet from the buffer, if there is one.
    ///
    /// After an error the buffer position is undefined; the caller is expected
    /// to drop the connection.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        let (decoded, consumed) = self.decode(&self.buffer[self.read_pos..])?;
        self.read_pos += consumed;
        match decoded {
            Decoded::Packet(packet) => Ok(Some(packet)),
            Decoded::NeedMore => Ok(None),
        }
    }

    /// Feeds `data` and decodes every complete packet now available.
    pub fn decode_all(&mut self, data: &[u8]) -> Result<Vec<Packet>, CodecError> {
        self.feed(data);
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Bytes received but not yet consumed by a complete packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let kind = packet.kind();
        let type_id = self
            .schema
            .type_id_of(kind)
            .ok_or(CodecError::NotInSchema {
                kind,
                schema: self.schema.name,
            })?;
        let entry = self.schema.by_id[&type_id];

        let mut out = vec![0u8; HEADER_SIZE];
        (entry.encode)(packet, &mut out)?;

        let body_len = out.len() - HEADER_SIZE;
        if body_len > MAX_PACKET_SIZE as usize {
            return Err(CodecError::Encode(format!(
                "{body_len} byte body exceeds maximum {MAX_PACKET_SIZE}"
            )));
        }
        out[..4].copy_from_slice(&type_id.to_le_bytes());
        out[4..HEADER_SIZE].copy_from_slice(&(body_len as u32).to_le_bytes());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityPatch, Vector3};
    use proptest::prelude::*;

    fn sample_stream() -> (Vec<Packet>, Vec<u8>) {
        let codec = PacketCodec::new(Schema::client_to_server());
        let packets = vec![
            Packet::ClientVersion(ClientVersion { version: 3 }),
            Packet::EntityUpdate(EntityUpdate::new(
                7,
                EntityPatch {
                    pos: Some(Vector3::new(100, -200, 300)),
                    name: Some("Splitter".to_string()),
                    ..Default::default()
                },
            )),
            Packet::ClientChat(ClientChatMessage {
                value: "hello there".to_string(),
            }),
            Packet::ChunkDiscovered(ChunkDiscovered { x: 1, y: -1 }),
            Packet::Hit(HitPacket {
                entity_id: 7,
                target_id: 8,
                damage: 12.5,
                critical: true,
                stun_duration: 0,
                pos: Vector3::default(),
                hit_type: 0,
            }),
        ];
        let mut bytes = Vec::new();
        for packet in &packets {
            bytes.extend(codec.encode(packet).unwrap());
        }
        (packets, bytes)
    }

    #[test]
    fn test_decode_whole_stream() {
        let (packets, bytes) = sample_stream();
        let mut codec = PacketCodec::new(Schema::client_to_server());

        let decoded = codec.decode_all(&bytes).unwrap();

        assert_eq!(decoded, packets);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let (packets, bytes) = sample_stream();
        let mut codec = PacketCodec::new(Schema::client_to_server());

        let mut decoded = Vec::new();
        for byte in &bytes {
            decoded.extend(codec.decode_all(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_partial_header_needs_more() {
        let codec = PacketCodec::new(Schema::client_to_server());
        let (decoded, consumed) = codec.decode(&[0, 0, 0]).unwrap();
        assert_eq!(decoded, Decoded::NeedMore);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_partial_body_is_retained() {
        let (_, bytes) = sample_stream();
        let mut codec = PacketCodec::new(Schema::client_to_server());

        let first = codec.decode_all(&bytes[..HEADER_SIZE + 2]).unwrap();
        assert!(first.is_empty());
        assert_eq!(codec.buffered(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let mut codec = PacketCodec::new(Schema::client_to_server());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let err = codec.decode_all(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnknownPacket { type_id: 99 }));
    }

    #[test]
    fn test_oversized_length_is_reported_before_body_arrives() {
        let codec = PacketCodec::new(Schema::client_to_server());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&(MAX_PACKET_SIZE + 1).to_le_bytes());

        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_directions_have_separate_id_spaces() {
        let client = Schema::client_to_server();
        let server = Schema::server_to_client();

        assert_eq!(client.kind_of(17), Some(PacketKind::ClientVersion));
        assert_eq!(server.kind_of(17), Some(PacketKind::ServerMismatch));
        assert_eq!(client.kind_of(16), None);
        assert_eq!(server.type_id_of(PacketKind::Join), Some(16));
    }

    #[test]
    fn test_encode_rejects_packet_from_other_direction() {
        let codec = PacketCodec::new(Schema::client_to_server());
        let err = codec
            .encode(&Packet::Join(JoinPacket { entity_id: 1 }))
            .unwrap_err();
        assert!(matches!(err, CodecError::NotInSchema { .. }));
    }

    #[test]
    fn test_malformed_body_is_reported() {
        let mut codec = PacketCodec::new(Schema::client_to_server());
        let mut bytes = Vec::new();
        // ClientVersion body should be 4 bytes
        bytes.extend_from_slice(&17u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2]);

        let err = codec.decode_all(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Malformed {
                kind: PacketKind::ClientVersion,
                ..
            }
        ));
    }

    #[test]
    fn test_string_length_over_limit_is_malformed() {
        let mut codec = PacketCodec::new(Schema::client_to_server());
        let mut body = Vec::new();
        body.extend_from_slice(&u64::MAX.to_le_bytes());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend(body);

        assert!(codec.decode_all(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_split_decodes_identically(cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12)) {
            let (packets, bytes) = sample_stream();

            let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut codec = PacketCodec::new(Schema::client_to_server());
            let mut decoded = Vec::new();
            for window in points.windows(2) {
                decoded.extend(codec.decode_all(&bytes[window[0]..window[1]]).unwrap());
            }

            prop_assert_eq!(decoded, packets);
            prop_assert_eq!(codec.buffered(), 0);
        }
    }
}
