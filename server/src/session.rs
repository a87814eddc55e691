//! Per-connection relay state machine.
//!
//! A [`RelaySession`] owns both legs of one player's connection, decodes every
//! packet that crosses it, keeps the player's [`EntityRecord`] current and
//! decides what gets forwarded. It never touches other sessions: anything that
//! reaches beyond this connection is pushed onto [`RelayState::effects`] and
//! carried out by the registry once the session call returns.

use crate::anticheat::{self, Verdict};
use crate::hooks::HookEvent;
use crate::registry::{Effect, RelayState};
use crate::storage::AccountId;
use log::{debug, error, info, warn};
use shared::packets::{
    EntityUpdate, HitPacket, InteractPacket, JoinPacket, ServerChatMessage, INTERACT_DROP,
    INTERACT_PICKUP,
};
use shared::{
    Chunk, EntityId, EntityPatch, EntityRecord, FieldMask, Packet, PacketCodec, Schema, Vector3,
    MAX_HP,
};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type SessionId = u64;

/// Delay between consecutive lines of [`RelaySession::send_lines`].
pub const LINE_INTERVAL: Duration = Duration::from_secs(2);

/// How long a rejected client sees the fake join before the message arrives.
pub const REJECT_DELAY: Duration = Duration::from_millis(100);

pub const MAX_CHAT_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client accepted, backend dial in flight.
    Connecting,
    Relaying,
    /// Relaying, and the player is in the player index.
    Joined,
    Closed,
}

#[derive(Debug)]
pub enum LegCommand {
    Write(Vec<u8>),
    Close,
}

/// Write side of one transport, served by its connection task.
#[derive(Debug, Clone)]
pub struct Leg {
    tx: mpsc::UnboundedSender<LegCommand>,
}

impl Leg {
    pub fn new(tx: mpsc::UnboundedSender<LegCommand>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LegCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn write(&self, bytes: Vec<u8>) {
        if self.tx.send(LegCommand::Write(bytes)).is_err() {
            debug!("Write to a finished connection dropped");
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(LegCommand::Close);
    }
}

/// Strips control characters, trims and bounds a chat line.
pub fn sanitize_chat(raw: &str) -> String {
    let filtered: String = raw.chars().filter(|c| !c.is_control()).collect();
    filtered.trim().chars().take(MAX_CHAT_LEN).collect()
}

pub struct RelaySession {
    id: SessionId,
    addr: SocketAddr,
    client: Leg,
    backend: Option<Leg>,
    /// Encoded packets waiting for the backend leg, in send order.
    pending: Vec<Vec<u8>>,
    /// Decodes client input; encodes toward the backend.
    client_codec: PacketCodec,
    /// Decodes backend input; encodes toward the client.
    server_codec: PacketCodec,
    entity_id: Option<EntityId>,
    entity: Option<EntityRecord>,
    joined: bool,
    closed: bool,
    last_chunk: Option<Chunk>,
    timers: Vec<JoinHandle<()>>,
    pub login_id: Option<AccountId>,
    pub rank: Option<String>,
    pub rights: HashSet<String>,
    login_at: Option<Instant>,
    connected_at: Instant,
}

impl RelaySession {
    pub fn new(id: SessionId, addr: SocketAddr, client: Leg, rights: HashSet<String>) -> Self {
        Self {
            id,
            addr,
            client,
            backend: None,
            pending: Vec::new(),
            client_codec: PacketCodec::new(Schema::client_to_server()),
            server_codec: PacketCodec::new(Schema::server_to_client()),
            entity_id: None,
            entity: None,
            joined: false,
            closed: false,
            last_chunk: None,
            timers: Vec::new(),
            login_id: None,
            rank: None,
            rights,
            login_at: None,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.backend.is_none() {
            SessionState::Connecting
        } else if self.joined {
            SessionState::Joined
        } else {
            SessionState::Relaying
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.entity_id
    }

    pub fn entity(&self) -> Option<&EntityRecord> {
        self.entity.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.entity
            .as_ref()
            .filter(|e| e.has_name())
            .map(|e| e.name.as_str())
    }

    /// Name for log lines, falling back to the session id.
    pub fn display_name(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => format!("session {}", self.id),
        }
    }

    pub fn position(&self) -> Option<Vector3> {
        self.entity.as_ref().map(|e| e.pos)
    }

    pub fn last_chunk(&self) -> Option<Chunk> {
        self.last_chunk
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_right(&self, right: &str) -> bool {
        self.rights.contains(right)
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn set_login(&mut self, account: AccountId, rank: String, rights: HashSet<String>) {
        self.login_id = Some(account);
        self.rank = Some(rank);
        self.rights.extend(rights);
        self.login_at = Some(Instant::now());
    }

    /// Forgets the login and returns seconds spent logged in.
    pub fn clear_login(&mut self, default_rights: HashSet<String>) -> Option<(AccountId, u64)> {
        let account = self.login_id.take()?;
        let seconds = self
            .login_at
            .take()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        self.rank = None;
        self.rights = default_rights;
        Some((account, seconds))
    }

    // outbound

    fn encode_for_client(&self, packet: &Packet) -> Option<Vec<u8>> {
        match self.server_codec.encode(packet) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Session {}: cannot encode {:?} for client: {}", self.id, packet.kind(), e);
                None
            }
        }
    }

    pub fn write_client(&self, bytes: Vec<u8>) {
        if !self.closed {
            self.client.write(bytes);
        }
    }

    pub fn send_to_client(&self, packet: &Packet) {
        if let Some(bytes) = self.encode_for_client(packet) {
            self.write_client(bytes);
        }
    }

    /// Writes to the backend, or queues until the backend leg exists.
    fn send_to_backend(&mut self, bytes: Vec<u8>) {
        if self.closed {
            return;
        }
        match &self.backend {
            Some(backend) => backend.write(bytes),
            None => self.pending.push(bytes),
        }
    }

    pub fn relay(&mut self, packet: &Packet) {
        match self.client_codec.encode(packet) {
            Ok(bytes) => self.send_to_backend(bytes),
            Err(e) => error!(
                "Session {}: cannot encode {:?} for backend: {}",
                self.id,
                packet.kind(),
                e
            ),
        }
    }

    pub fn send_chat(&self, text: &str) {
        self.send_to_client(&Packet::server_chat(text));
    }

    /// Sends one chat line now and each following line [`LINE_INTERVAL`] later.
    pub fn send_lines(&mut self, lines: Vec<String>) {
        self.timers.retain(|timer| !timer.is_finished());
        let mut delay = Duration::ZERO;
        for line in lines {
            let Some(bytes) = self.encode_for_client(&Packet::server_chat(line)) else {
                continue;
            };
            let leg = self.client.clone();
            self.timers.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                leg.write(bytes);
            }));
            delay += LINE_INTERVAL;
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.iter().filter(|t| !t.is_finished()).count()
    }

    fn push_update(&mut self, mask: FieldMask) {
        let Some(record) = self.entity.as_ref() else {
            return;
        };
        let packet = Packet::EntityUpdate(EntityUpdate::new(record.id, record.to_patch(mask)));
        self.send_to_client(&packet);
        self.relay(&packet);
    }

    /// Moves the player and tells both sides.
    pub fn teleport(&mut self, pos: Vector3) {
        let Some(record) = self.entity.as_mut() else {
            return;
        };
        record.merge(&EntityPatch {
            pos: Some(pos),
            ..Default::default()
        });
        self.last_chunk = Some(record.chunk());
        self.push_update(FieldMask::POSITION);
    }

    /// Restores `amount` health, or all of it with `None`, capped at [`MAX_HP`].
    pub fn heal(&mut self, amount: Option<f32>) -> bool {
        if matches!(amount, Some(amount) if amount <= 0.0) {
            return false;
        }
        let Some(record) = self.entity.as_mut() else {
            return false;
        };
        let hp = match amount {
            Some(amount) => (record.hp + amount).min(MAX_HP),
            None => MAX_HP,
        };
        record.merge(&EntityPatch {
            hp: Some(hp),
            ..Default::default()
        });
        self.push_update(FieldMask::HEALTH);
        true
    }

    /// Subtracts damage; true if this hit took health from above zero to zero or below.
    pub fn apply_damage(&mut self, damage: f32) -> bool {
        let Some(record) = self.entity.as_mut() else {
            return false;
        };
        if record.hp <= 0.0 {
            return false;
        }
        record.hp -= damage;
        record.hp <= 0.0
    }

    pub fn clear_dirty(&mut self) {
        if let Some(record) = self.entity.as_mut() {
            record.clear_dirty();
        }
    }

    // lifecycle

    pub fn backend_connected(&mut self, backend: Leg) {
        if self.closed {
            backend.close();
            return;
        }
        debug!(
            "Session {} relaying, flushing {} queued packets",
            self.id,
            self.pending.len()
        );
        for bytes in self.pending.drain(..) {
            backend.write(bytes);
        }
        self.backend = Some(backend);
    }

    pub fn backend_failed(&mut self, reason: &str, state: &mut RelayState) {
        error!("Session {}: backend unreachable: {}", self.id, reason);
        self.close("backend unreachable", state);
    }

    pub fn kick(&mut self, state: &mut RelayState) {
        let name = self.display_name();
        self.send_chat("You have been kicked");
        self.close("kicked", state);
        state
            .effects
            .push_back(Effect::Broadcast(Packet::server_chat(format!(
                "[INFO] {name} has been kicked"
            ))));
    }

    /// Tears the session down. Safe to call any number of times.
    pub fn close(&mut self, reason: &str, state: &mut RelayState) {
        if self.closed {
            return;
        }
        self.closed = true;

        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.client.close();
        if let Some(backend) = self.backend.take() {
            backend.close();
        }
        self.pending.clear();

        if let Some(account) = self.login_id {
            let seconds = self.login_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
            state.flush_online_time(account, seconds);
        }

        if let Some(entity_id) = self.entity_id {
            if self.joined {
                if state.players.get(&entity_id) == Some(&self.id) {
                    state.players.remove(&entity_id);
                }
                let name = self.display_name();
                info!("Player {} #{} left the game", name, entity_id);
                state.hooks.fire(&HookEvent::Leave {
                    entity_id,
                    name: name.clone(),
                });
                state
                    .effects
                    .push_back(Effect::Broadcast(Packet::server_chat(format!(
                        "<<< {name} #{entity_id} left the game"
                    ))));
            }
            if state.entities.get(&entity_id) == Some(&self.id) {
                state.entities.remove(&entity_id);
            }
        }

        info!("Session {} from {} closed: {}", self.id, self.addr, reason);
        state.closed.push(self.id);
    }

    /// Kicks with a reason the player gets to read.
    fn disconnect(&mut self, reason: &str, state: &mut RelayState) {
        self.send_chat(reason);
        self.close(reason, state);
    }

    // inbound

    pub fn on_client_data(&mut self, data: &[u8], state: &mut RelayState) {
        if self.closed {
            return;
        }
        self.client_codec.feed(data);
        while !self.closed {
            match self.client_codec.next_packet() {
                Ok(Some(packet)) => self.handle_client_packet(packet, state),
                Ok(None) => break,
                Err(e) => {
                    warn!("Session {} sent an invalid packet: {}", self.id, e);
                    self.close("protocol error", state);
                }
            }
        }
    }

    pub fn on_backend_data(&mut self, data: &[u8], state: &mut RelayState) {
        if self.closed {
            return;
        }
        self.server_codec.feed(data);
        while !self.closed {
            match self.server_codec.next_packet() {
                Ok(Some(packet)) => self.handle_backend_packet(packet, state),
                Ok(None) => break,
                Err(e) => {
                    error!("Session {}: backend sent an invalid packet: {}", self.id, e);
                    self.close("backend protocol error", state);
                }
            }
        }
    }

    pub fn handle_client_packet(&mut self, packet: Packet, state: &mut RelayState) {
        match packet {
            Packet::EntityUpdate(update) => self.on_entity_update(update, state),
            Packet::ClientChat(chat) => self.on_chat(&chat.value, state),
            Packet::Interact(interact) => self.on_interact(interact, state),
            Packet::Hit(hit) => self.on_hit(hit, state),
            other => self.relay(&other),
        }
    }

    pub fn handle_backend_packet(&mut self, packet: Packet, state: &mut RelayState) {
        match &packet {
            Packet::Join(JoinPacket { entity_id }) => self.assign_entity_id(*entity_id, state),
            Packet::EntityUpdate(update) if Some(update.entity_id) == self.entity_id => {
                self.apply_correction(update, state);
            }
            _ => {}
        }
        self.send_to_client(&packet);
    }

    fn assign_entity_id(&mut self, entity_id: EntityId, state: &mut RelayState) {
        let previous = self.entity_id.replace(entity_id);
        let Some(previous) = previous.filter(|p| *p != entity_id) else {
            return;
        };
        debug!(
            "Session {} entity id changed #{} -> #{}",
            self.id, previous, entity_id
        );
        if let Some(record) = self.entity.as_mut() {
            record.id = entity_id;
            if state.entities.get(&previous) == Some(&self.id) {
                state.entities.remove(&previous);
            }
            state.entities.insert(entity_id, self.id);
        }
        if self.joined && state.players.get(&previous) == Some(&self.id) {
            state.players.remove(&previous);
            state.players.insert(entity_id, self.id);
        }
    }

    fn ensure_entity(&mut self, entity_id: EntityId, state: &mut RelayState) -> &mut EntityRecord {
        let id = self.id;
        self.entity.get_or_insert_with(|| {
            state.entities.insert(entity_id, id);
            EntityRecord::new(entity_id)
        })
    }

    /// Backend corrections are authoritative: merged without validation.
    fn apply_correction(&mut self, update: &EntityUpdate, state: &mut RelayState) {
        let record = self.ensure_entity(update.entity_id, state);
        let mask = record.merge(&update.patch);
        let chunk = record.chunk();
        if mask.contains(FieldMask::POSITION) {
            self.last_chunk = Some(chunk);
        }
    }

    fn on_entity_update(&mut self, update: EntityUpdate, state: &mut RelayState) {
        match self.entity_id {
            Some(known) if known != update.entity_id => {
                warn!(
                    "Session {} sent an update for #{} but owns #{}",
                    self.id, update.entity_id, known
                );
                return;
            }
            Some(_) => {}
            None => {
                let owner = state
                    .entities
                    .get(&update.entity_id)
                    .or_else(|| state.players.get(&update.entity_id));
                if let Some(&owner) = owner.filter(|&&owner| owner != self.id) {
                    warn!(
                        "Session {} claimed #{} which session {} owns",
                        self.id, update.entity_id, owner
                    );
                    return;
                }
                self.entity_id = Some(update.entity_id);
            }
        }
        let entity_id = update.entity_id;

        let record = self.ensure_entity(entity_id, state);
        let mask = record.merge(&update.patch);
        let chunk = record.chunk();
        let has_name = record.has_name();

        state
            .hooks
            .fire(&HookEvent::EntityUpdate { entity_id, mask });

        if mask.contains(FieldMask::POSITION) && !self.check_position(chunk, state) {
            return;
        }
        for group in mask.groups() {
            state
                .hooks
                .fire(&HookEvent::FieldUpdate { entity_id, group });
        }

        if !self.joined && has_name {
            self.join(entity_id, state);
        }
        if self.joined {
            self.relay(&Packet::EntityUpdate(update));
        }
    }

    /// Returns false if the move closed the session.
    fn check_position(&mut self, chunk: Chunk, state: &mut RelayState) -> bool {
        let verdict = anticheat::classify(self.last_chunk, chunk);
        match verdict {
            Verdict::Ok => {
                self.last_chunk = Some(chunk);
                return true;
            }
            Verdict::JumpViolation => warn!(
                "[ANTICHEAT] {} traveled from chunk {:?} to {}",
                self.display_name(),
                self.last_chunk,
                chunk
            ),
            Verdict::BorderViolation => {
                warn!(
                    "[ANTICHEAT] {} was out of world border at {}",
                    self.display_name(),
                    chunk
                );
                self.teleport(state.config.spawn_point());
            }
        }
        if let Some(reason) = verdict.reason() {
            self.disconnect(reason, state);
        }
        false
    }

    fn join(&mut self, entity_id: EntityId, state: &mut RelayState) {
        self.joined = true;
        state.players.insert(entity_id, self.id);

        let name = self.display_name();
        let pos = self.position().unwrap_or_default();
        info!("Player {} #{} joined the game at {}", name, entity_id, pos);

        state.hooks.fire(&HookEvent::Join {
            entity_id,
            name: name.clone(),
        });
        state
            .effects
            .push_back(Effect::Broadcast(Packet::server_chat(format!(
                ">>> {name} #{entity_id} joined the game"
            ))));
        self.send_lines(state.config.welcome_lines());
    }

    fn on_chat(&mut self, raw: &str, state: &mut RelayState) {
        let message = sanitize_chat(raw);
        if message.is_empty() {
            return;
        }

        if let Some(line) = message.strip_prefix('/') {
            let mut parts = line.split_whitespace();
            let Some(command) = parts.next() else {
                return;
            };
            let command = command.to_lowercase();
            let args: Vec<String> = parts.map(str::to_string).collect();

            if args.is_empty() || command == "register" || command == "login" {
                info!("[COMMAND] {}: /{}", self.display_name(), command);
            } else {
                info!(
                    "[COMMAND] {}: /{} {}",
                    self.display_name(),
                    command,
                    args.join(" ")
                );
            }

            let result = state.hooks.fire(&HookEvent::Command {
                entity_id: self.entity_id,
                command: command.clone(),
                args: args.clone(),
            });
            if !result.vetoed {
                state.effects.push_back(Effect::Command {
                    session: self.id,
                    command,
                    args,
                });
            }
            return;
        }

        let Some(entity_id) = self.entity_id.filter(|_| self.joined) else {
            debug!("Session {}: chat before join dropped", self.id);
            return;
        };
        let result = state.hooks.fire(&HookEvent::Chat {
            entity_id,
            message: message.clone(),
        });
        if result.vetoed {
            return;
        }
        let message = result.value.unwrap_or(message);
        if message.is_empty() {
            return;
        }

        info!("[CHAT] {}: {}", self.display_name(), message);
        state
            .effects
            .push_back(Effect::Broadcast(Packet::ServerChat(ServerChatMessage {
                entity_id,
                value: message,
            })));
    }

    fn on_interact(&mut self, interact: InteractPacket, state: &mut RelayState) {
        let entity_id = self.entity_id.unwrap_or(interact.entity_id);
        let pos = self.position().unwrap_or_default();
        let event = match interact.interact_type {
            INTERACT_DROP => Some(HookEvent::Drop {
                entity_id,
                item: interact.item,
                pos,
            }),
            INTERACT_PICKUP => Some(HookEvent::Pickup {
                entity_id,
                item: interact.item,
                pos,
            }),
            _ => None,
        };
        if let Some(event) = event {
            if state.hooks.fire(&event).vetoed {
                debug!("Session {}: {} vetoed", self.id, event.name());
                return;
            }
        }
        self.relay(&Packet::Interact(interact));
    }

    fn on_hit(&mut self, hit: HitPacket, state: &mut RelayState) {
        self.relay(&Packet::Hit(hit));
        state.effects.push_back(Effect::Hit {
            attacker: self.entity_id.unwrap_or(hit.entity_id),
            hit,
        });
    }
}

/// Serves a connection that will not be relayed: a fake join, a pause, one
/// chat line with `message`, then disconnect. Client input is read and ignored;
/// if the client leaves during the pause nothing else is sent.
pub async fn reject<S>(stream: S, message: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = PacketCodec::new(Schema::server_to_client());
    let encode = |packet: &Packet| {
        codec
            .encode(packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    };
    let join = encode(&Packet::Join(JoinPacket { entity_id: 1 }))?;
    let chat = encode(&Packet::server_chat(message))?;

    let (mut reader, mut writer) = tokio::io::split(stream);
    writer.write_all(&join).await?;

    let deadline = tokio::time::sleep(REJECT_DELAY);
    tokio::pin!(deadline);
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = &mut deadline => {
                writer.write_all(&chat).await?;
                writer.shutdown().await?;
                return Ok(());
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    debug!("Rejected client left before the message");
                    return Ok(());
                }
                Ok(_) => {}
            },
        }
    }
}
