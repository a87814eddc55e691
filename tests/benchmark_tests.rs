//! Performance benchmarks for the relay's hot paths

use shared::packets::{ChunkDiscovered, ClientChatMessage, EntityUpdate, HitPacket};
use shared::{
    chunk_of, EntityPatch, EntityRecord, FieldMask, Packet, PacketCodec, Schema, Vector3,
    CHUNK_SCALE,
};
use std::time::Instant;

fn full_update(id: u64, i: i64) -> Packet {
    let mut record = EntityRecord::new(id);
    record.name = format!("Player{i}");
    record.pos = Vector3::new(i * 1000, -i * 1000, 5);
    record.level.level = 40;
    Packet::EntityUpdate(EntityUpdate::new(id, record.to_patch(FieldMask::ALL)))
}

/// Benchmarks decoding a mixed client stream fed in small reads
#[test]
fn benchmark_stream_decoding() {
    let encoder = PacketCodec::new(Schema::client_to_server());
    let mut stream = Vec::new();
    for i in 0..2_000i64 {
        let packets = [
            full_update(1, i),
            Packet::ChunkDiscovered(ChunkDiscovered {
                x: i as i32,
                y: 3,
            }),
            Packet::ClientChat(ClientChatMessage {
                value: "hello world".to_string(),
            }),
            Packet::Hit(HitPacket {
                entity_id: 1,
                target_id: 2,
                damage: 12.5,
                critical: i % 2 == 0,
                stun_duration: 0,
                pos: Vector3::new(i, i, i),
                hit_type: 1,
            }),
        ];
        for packet in &packets {
            stream.extend(encoder.encode(packet).unwrap());
        }
    }

    let start = Instant::now();
    let mut decoder = PacketCodec::new(Schema::client_to_server());
    let mut decoded = 0;
    for chunk in stream.chunks(1460) {
        decoded += decoder.decode_all(chunk).unwrap().len();
    }
    let duration = start.elapsed();

    println!(
        "Stream decoding: {} packets ({} bytes) in {:?} ({:.2} MB/s)",
        decoded,
        stream.len(),
        duration,
        stream.len() as f64 / duration.as_secs_f64() / 1_000_000.0
    );

    assert_eq!(decoded, 8_000);
    assert_eq!(decoder.buffered(), 0);
    // Should complete in under 1 second for 8k packets
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks encoding full entity updates for broadcast
#[test]
fn benchmark_update_encoding() {
    let codec = PacketCodec::new(Schema::server_to_client());
    let packets: Vec<Packet> = (0..1_000).map(|i| full_update(i as u64, i)).collect();

    let iterations = 10;
    let start = Instant::now();
    let mut bytes = 0;
    for _ in 0..iterations {
        for packet in &packets {
            bytes += codec.encode(packet).unwrap().len();
        }
    }
    let duration = start.elapsed();

    println!(
        "Update encoding: {} updates ({} bytes) in {:?}",
        iterations * packets.len(),
        bytes,
        duration
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks merging sparse patches into an entity record
#[test]
fn benchmark_patch_merging() {
    let mut record = EntityRecord::new(1);
    let patches: Vec<EntityPatch> = (0..100i64)
        .map(|i| EntityPatch {
            pos: Some(Vector3::new(i * CHUNK_SCALE / 10, 0, 0)),
            hp: (i % 3 == 0).then_some(500.0),
            flags: (i % 5 == 0).then_some(i as u32),
            ..Default::default()
        })
        .collect();

    let iterations = 100_000;
    let start = Instant::now();
    for i in 0..iterations {
        record.merge(&patches[i % patches.len()]);
        if i % 20 == 0 {
            record.clear_dirty();
        }
    }
    let duration = start.elapsed();

    println!(
        "Patch merging: {} merges in {:?} ({:.2} ns/merge)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(record.pos, patches[(iterations - 1) % patches.len()].pos.unwrap());
    // Should complete in under 200ms for 100k merges
    assert!(duration.as_millis() < 200);
}

/// Benchmarks chunk bucketing used by every position check
#[test]
fn benchmark_chunk_bucketing() {
    let positions: Vec<Vector3> = (-500..500i64)
        .map(|i| Vector3::new(i * 7_919_113, -i * 3_331_977, 0))
        .collect();

    let iterations = 1_000;
    let start = Instant::now();
    let mut checksum = 0i64;
    for _ in 0..iterations {
        for pos in &positions {
            let chunk = chunk_of(pos);
            checksum = checksum.wrapping_add(chunk.x ^ chunk.y);
        }
    }
    let duration = start.elapsed();

    println!(
        "Chunk bucketing: {} positions in {:?} (checksum {})",
        iterations * positions.len(),
        duration,
        checksum
    );

    assert!(duration.as_millis() < 200);
}
