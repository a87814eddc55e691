//! Integration tests for the relay
//!
//! These tests run a real relay on loopback TCP between scripted clients and a
//! fake backend, and check what each side observes.

use client::game::{LocalPlayer, START_POSITION};
use client::network::Connection;
use server::config::RelayConfig;
use server::hooks::{Hook, HookError, HookEvent, HookOutcome};
use server::network::Server;
use server::storage::{MemoryStorage, StorageHandle};
use shared::packets::{ChunkDiscovered, EntityUpdate, HitPacket, JoinPacket, SeedData};
use shared::{EntityId, EntityPatch, Packet, PacketCodec, Schema, Vector3, CHUNK_SCALE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// The far end of one relayed connection, playing the game server.
struct BackendPeer {
    stream: TcpStream,
    incoming: PacketCodec,
    outgoing: PacketCodec,
}

impl BackendPeer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("relay never dialed the backend")
            .unwrap();
        Self {
            stream,
            incoming: PacketCodec::new(Schema::client_to_server()),
            outgoing: PacketCodec::new(Schema::server_to_client()),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = self.outgoing.encode(packet).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next packet from the relay, or `None` once it hangs up.
    async fn recv(&mut self) -> Option<Packet> {
        let mut buffer = [0u8; 4096];
        loop {
            if let Some(packet) = self.incoming.next_packet().unwrap() {
                return Some(packet);
            }
            let n = timeout(WAIT, self.stream.read(&mut buffer))
                .await
                .expect("backend read timed out")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.incoming.feed(&buffer[..n]);
        }
    }
}

/// Forwards kills seen by the relay to the test.
struct KillRecorder(mpsc::UnboundedSender<(EntityId, EntityId)>);

impl Hook for KillRecorder {
    fn name(&self) -> &str {
        "kill-recorder"
    }

    fn handle(&mut self, event: &HookEvent) -> Result<HookOutcome, HookError> {
        if let HookEvent::Kill { killer, target } = event {
            let _ = self.0.send((*killer, *target));
        }
        Ok(HookOutcome::Continue)
    }
}

fn test_config(backend: SocketAddr) -> RelayConfig {
    let mut config = RelayConfig {
        welcome: Vec::new(),
        data_path: None,
        ..Default::default()
    };
    config.set_backend(&backend.to_string()).unwrap();
    config
}

async fn start_relay(hooks: Vec<Box<dyn Hook>>) -> (SocketAddr, TcpListener) {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let storage = StorageHandle::spawn(MemoryStorage::new());
    let mut server = Server::with_listener(
        listener,
        test_config(backend.local_addr().unwrap()),
        storage,
    );
    for hook in hooks {
        server.hooks_mut().register(hook);
    }
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    (addr, backend)
}

/// Connects a client and accepts the backend leg the relay opens for it.
async fn connect(relay: SocketAddr, backend: &TcpListener) -> (Connection, BackendPeer) {
    let connection = Connection::connect(relay).await.unwrap();
    let peer = BackendPeer::accept(backend).await;
    (connection, peer)
}

/// Reads until a chat line containing `needle` arrives.
async fn wait_for_line(connection: &mut Connection, player: &mut LocalPlayer, needle: &str) {
    loop {
        let packet = timeout(WAIT, connection.recv())
            .await
            .unwrap_or_else(|_| panic!("never saw {needle:?}"))
            .unwrap()
            .unwrap_or_else(|| panic!("connection closed before {needle:?}"));
        if player.apply(&packet).is_some_and(|line| line.contains(needle)) {
            return;
        }
    }
}

/// Reads until the relay hangs up, returning the chat lines seen on the way.
async fn drain_until_closed(connection: &mut Connection, player: &mut LocalPlayer) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(packet) = timeout(WAIT, connection.recv())
        .await
        .expect("relay never closed the connection")
        .unwrap()
    {
        lines.extend(player.apply(&packet));
    }
    lines
}

async fn next_entity_update(peer: &mut BackendPeer) -> EntityUpdate {
    loop {
        match peer.recv().await {
            Some(Packet::EntityUpdate(update)) => return update,
            Some(_) => continue,
            None => panic!("backend closed before an entity update arrived"),
        }
    }
}

fn move_to(entity_id: EntityId, pos: Vector3) -> Packet {
    Packet::EntityUpdate(EntityUpdate::new(
        entity_id,
        EntityPatch {
            pos: Some(pos),
            ..Default::default()
        },
    ))
}

/// RELAY BEHAVIOUR TESTS
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn join_is_announced_and_forwarded() {
        let (relay, backend) = start_relay(Vec::new()).await;
        let (mut connection, mut peer) = connect(relay, &backend).await;
        let mut player = LocalPlayer::new(5, "Aria");

        connection.send(&player.join_packet()).await.unwrap();

        wait_for_line(&mut connection, &mut player, ">>> Aria #5 joined the game").await;
        let update = next_entity_update(&mut peer).await;
        assert_eq!(update.entity_id, 5);
        assert_eq!(update.patch.name.as_deref(), Some("Aria"));
        assert_eq!(update.patch.pos, Some(START_POSITION));
    }

    #[tokio::test]
    async fn packets_reach_the_backend_in_order() {
        let (relay, backend) = start_relay(Vec::new()).await;
        let mut connection = Connection::connect(relay).await.unwrap();

        // Sent before the backend leg is accepted, so some may be queued.
        for x in 0..20 {
            connection
                .send(&Packet::ChunkDiscovered(ChunkDiscovered { x, y: -x }))
                .await
                .unwrap();
        }

        let mut peer = BackendPeer::accept(&backend).await;
        for x in 0..20 {
            assert_eq!(
                peer.recv().await,
                Some(Packet::ChunkDiscovered(ChunkDiscovered { x, y: -x }))
            );
        }
    }

    #[tokio::test]
    async fn backend_packets_reach_the_client() {
        let (relay, backend) = start_relay(Vec::new()).await;
        let (mut connection, mut peer) = connect(relay, &backend).await;
        let mut player = LocalPlayer::new(5, "Aria");

        peer.send(&Packet::Join(JoinPacket { entity_id: 77 })).await;
        peer.send(&Packet::SeedData(SeedData { seed: 1234 })).await;

        let join = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
        assert_eq!(join, Some(Packet::Join(JoinPacket { entity_id: 77 })));
        player.apply(&join.unwrap());
        assert_eq!(player.entity_id(), 77);

        let seed = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
        assert_eq!(seed, Some(Packet::SeedData(SeedData { seed: 1234 })));
    }

    #[tokio::test]
    async fn chat_is_broadcast_by_the_relay() {
        let (relay, backend) = start_relay(Vec::new()).await;
        let (mut first, _first_peer) = connect(relay, &backend).await;
        let mut aria = LocalPlayer::new(1, "Aria");
        first.send(&aria.join_packet()).await.unwrap();
        wait_for_line(&mut first, &mut aria, "Aria #1 joined").await;

        let (mut second, mut second_peer) = connect(relay, &backend).await;
        let mut bram = LocalPlayer::new(2, "Bram");
        second.send(&bram.join_packet()).await.unwrap();
        wait_for_line(&mut first, &mut aria, "Bram #2 joined").await;

        second.send(&LocalPlayer::chat("hello there")).await.unwrap();
        second.send(&move_to(2, START_POSITION)).await.unwrap();
        wait_for_line(&mut first, &mut aria, "#2: hello there").await;

        // The chat line never reaches Bram's backend; the move right after it does.
        let joined = next_entity_update(&mut second_peer).await;
        assert_eq!(joined.patch.name.as_deref(), Some("Bram"));
        let next = second_peer.recv().await;
        assert!(matches!(next, Some(Packet::EntityUpdate(_))), "got {next:?}");
    }
}

/// ANTICHEAT AND COMBAT TESTS
mod gameplay_tests {
    use super::*;

    #[tokio::test]
    async fn teleporting_player_is_disconnected() {
        let (relay, backend) = start_relay(Vec::new()).await;
        let (mut connection, mut peer) = connect(relay, &backend).await;
        let mut player = LocalPlayer::new(5, "Aria");
        connection.send(&player.join_packet()).await.unwrap();
        wait_for_line(&mut connection, &mut player, "Aria #5 joined").await;

        let far = Vector3::new(
            START_POSITION.x + 5 * CHUNK_SCALE,
            START_POSITION.y,
            START_POSITION.z,
        );
        connection.send(&move_to(5, far)).await.unwrap();

        let lines = drain_until_closed(&mut connection, &mut player).await;
        assert!(
            lines.iter().any(|l| l == "[ANTICHEAT] Traveled distance too large"),
            "got {lines:?}"
        );

        // The join update was relayed; the teleport never was.
        let update = next_entity_update(&mut peer).await;
        assert_eq!(update.patch.pos, Some(START_POSITION));
        while let Some(packet) = peer.recv().await {
            if let Packet::EntityUpdate(update) = packet {
                assert_ne!(update.patch.pos, Some(far));
            }
        }
    }

    #[tokio::test]
    async fn lethal_hit_is_relayed_and_kills_once() {
        let (kills_tx, mut kills) = mpsc::unbounded_channel();
        let recorder: Box<dyn Hook> = Box::new(KillRecorder(kills_tx));
        let (relay, backend) = start_relay(vec![recorder]).await;

        let (mut first, mut first_peer) = connect(relay, &backend).await;
        let mut aria = LocalPlayer::new(1, "Aria");
        first.send(&aria.join_packet()).await.unwrap();
        wait_for_line(&mut first, &mut aria, "Aria #1 joined").await;

        let (mut second, _second_peer) = connect(relay, &backend).await;
        let mut bram = LocalPlayer::new(2, "Bram");
        second.send(&bram.join_packet()).await.unwrap();
        wait_for_line(&mut first, &mut aria, "Bram #2 joined").await;

        let hit = HitPacket {
            entity_id: 1,
            target_id: 2,
            damage: 1000.0,
            critical: false,
            stun_duration: 0,
            pos: START_POSITION,
            hit_type: 0,
        };
        first.send(&Packet::Hit(hit)).await.unwrap();
        first.send(&Packet::Hit(hit)).await.unwrap();

        let kill = timeout(WAIT, kills.recv()).await.unwrap();
        assert_eq!(kill, Some((1, 2)));

        next_entity_update(&mut first_peer).await;
        assert_eq!(first_peer.recv().await, Some(Packet::Hit(hit)));
        assert_eq!(first_peer.recv().await, Some(Packet::Hit(hit)));
        assert!(kills.try_recv().is_err());
    }
}
