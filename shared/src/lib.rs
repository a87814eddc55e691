//! # Shared Protocol Library
//!
//! Wire types and state-merge machinery used by both the relay server and the
//! headless client.
//!
//! ## Layout
//!
//! - [`codec`]: length-prefixed framing and the two direction schemas
//! - [`packets`]: packet bodies and the [`Packet`] enum
//! - [`entity`]: [`EntityRecord`], [`FieldMask`] and chunk math
//!
//! Nothing in this crate performs I/O; callers feed bytes in and take bytes
//! out.

pub mod codec;
pub mod entity;
pub mod packets;

pub use codec::{CodecError, Decoded, PacketCodec, Schema, MAX_PACKET_SIZE};
pub use entity::{
    chunk_of, Chunk, EntityId, EntityPatch, EntityRecord, FieldGroup, FieldMask, Vector3,
    CHUNK_SCALE, MAX_HP,
};
pub use packets::{Packet, PacketKind};
