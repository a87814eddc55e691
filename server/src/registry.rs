//! Process-wide relay state: every live session plus the indexes, hooks and
//! services they share.
//!
//! Sessions only see [`RelayState`]. Anything a session wants done to other
//! sessions goes through [`Effect`]s, which [`SessionRegistry`] drains after
//! each event so two sessions are never borrowed at once.

use crate::commands::{self, CommandRegistry, Deferred};
use crate::config::RelayConfig;
use crate::hooks::{ChatFilter, HookBus, HookEvent};
use crate::network::ServerMessage;
use crate::session::{Leg, RelaySession, SessionId};
use crate::storage::{AccountId, StorageHandle};
use log::{debug, info, warn};
use shared::packets::HitPacket;
use shared::{EntityId, FieldMask, Packet, PacketCodec, Schema};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_RANK: &str = "default";

/// Cross-session work queued by a session.
#[derive(Debug)]
pub enum Effect {
    /// Chat or announcement for every joined player.
    Broadcast(Packet),
    Hit {
        attacker: EntityId,
        hit: HitPacket,
    },
    Command {
        session: SessionId,
        command: String,
        args: Vec<String>,
    },
}

/// Rank label to the capabilities it grants.
#[derive(Debug, Clone, Default)]
pub struct RankTable {
    ranks: HashMap<String, HashSet<String>>,
}

impl RankTable {
    pub fn from_config(ranks: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            ranks: ranks
                .iter()
                .map(|(rank, rights)| (rank.to_lowercase(), rights.iter().cloned().collect()))
                .collect(),
        }
    }

    pub fn contains(&self, rank: &str) -> bool {
        self.ranks.contains_key(&rank.to_lowercase())
    }

    /// Unknown ranks grant nothing.
    pub fn rights(&self, rank: &str) -> HashSet<String> {
        self.ranks
            .get(&rank.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ranks.keys().cloned().collect();
        names.sort();
        names
    }
}

/// What every session may read and write while handling its own traffic.
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    /// Joined players by entity id.
    pub players: HashMap<EntityId, SessionId>,
    /// Every session with an entity record, joined or not.
    pub entities: HashMap<EntityId, SessionId>,
    pub hooks: HookBus,
    pub ranks: RankTable,
    pub storage: StorageHandle,
    /// Loop back into the server task for results of async work.
    pub events: mpsc::UnboundedSender<ServerMessage>,
    pub effects: VecDeque<Effect>,
    /// Sessions closed since the last reap.
    pub closed: Vec<SessionId>,
}

impl RelayState {
    pub fn new(
        config: Arc<RelayConfig>,
        storage: StorageHandle,
        events: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let mut hooks = HookBus::new();
        if !config.banned_words.is_empty() {
            hooks.register(Box::new(ChatFilter::new(config.banned_words.clone())));
        }
        Self {
            ranks: RankTable::from_config(&config.ranks),
            config,
            players: HashMap::new(),
            entities: HashMap::new(),
            hooks,
            storage,
            events,
            effects: VecDeque::new(),
            closed: Vec::new(),
        }
    }

    pub fn default_rights(&self) -> HashSet<String> {
        self.ranks.rights(DEFAULT_RANK)
    }

    /// Adds logged-in time to the account in the background.
    pub fn flush_online_time(&self, account: AccountId, seconds: u64) {
        let storage = self.storage.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.add_online_seconds(account, seconds).await {
                warn!("Could not record online time for account {}: {}", account, e);
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Drop the socket without a word.
    Refused,
    /// Serve a reject session with this message.
    Rejected(String),
    /// A per-address slot is reserved; check bans next.
    Accepted,
}

pub struct SessionRegistry {
    sessions: HashMap<SessionId, RelaySession>,
    state: RelayState,
    commands: CommandRegistry,
    /// Encodes broadcasts once for all recipients.
    broadcast_codec: PacketCodec,
    per_ip: HashMap<IpAddr, usize>,
    next_id: SessionId,
    tick: u64,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<RelayConfig>,
        storage: StorageHandle,
        events: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            state: RelayState::new(config, storage, events),
            commands: CommandRegistry::with_builtins(),
            broadcast_codec: PacketCodec::new(Schema::server_to_client()),
            per_ip: HashMap::new(),
            next_id: 1,
            tick: 0,
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RelayState {
        &mut self.state
    }

    pub fn hooks_mut(&mut self) -> &mut HookBus {
        &mut self.state.hooks
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn config(&self) -> &RelayConfig {
        &self.state.config
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, id: SessionId) -> Option<&RelaySession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut RelaySession> {
        self.sessions.get_mut(&id)
    }

    /// Joined, still open sessions.
    pub fn players(&self) -> impl Iterator<Item = &RelaySession> {
        self.sessions.values().filter(|s| s.is_joined())
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }

    /// Runs the connection hook and the per-address limit.
    pub fn check_admission(&mut self, addr: SocketAddr) -> Admission {
        let result = self
            .state
            .hooks
            .fire(&HookEvent::ConnectionAttempt { addr });
        if result.vetoed {
            info!("Connection from {} refused by hook", addr);
            return Admission::Refused;
        }
        if let Some(message) = result.value {
            info!("Connection from {} rejected by hook: {}", addr, message);
            return Admission::Rejected(message);
        }

        let ip = addr.ip();
        let count = self.per_ip.entry(ip).or_insert(0);
        if *count >= self.state.config.max_connections_per_ip {
            warn!("Too many connections from {}, refusing", ip);
            return Admission::Refused;
        }
        *count += 1;
        Admission::Accepted
    }

    /// Returns a slot reserved by [`check_admission`](Self::check_admission).
    pub fn release(&mut self, ip: IpAddr) {
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }

    pub fn open_session(&mut self, addr: SocketAddr, client: Leg) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let session = RelaySession::new(id, addr, client, self.state.default_rights());
        self.sessions.insert(id, session);
        info!("Session {} opened for {}", id, addr);
        id
    }

    // network events

    pub fn on_client_data(&mut self, id: SessionId, data: &[u8]) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.on_client_data(data, &mut self.state);
        }
        self.settle();
    }

    pub fn on_client_closed(&mut self, id: SessionId) {
        self.close_session(id, "client disconnected");
    }

    pub fn on_backend_connected(&mut self, id: SessionId, backend: Leg) {
        match self.sessions.get_mut(&id) {
            Some(session) => session.backend_connected(backend),
            None => backend.close(),
        }
    }

    pub fn on_backend_failed(&mut self, id: SessionId, reason: &str) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.backend_failed(reason, &mut self.state);
        }
        self.settle();
    }

    pub fn on_backend_data(&mut self, id: SessionId, data: &[u8]) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.on_backend_data(data, &mut self.state);
        }
        self.settle();
    }

    pub fn on_backend_closed(&mut self, id: SessionId) {
        self.close_session(id, "backend disconnected");
    }

    pub fn on_deferred(&mut self, id: SessionId, action: Deferred) {
        commands::apply_deferred(self, id, action);
        self.settle();
    }

    /// One server tick.
    pub fn tick(&mut self) {
        self.tick += 1;
        let mut dirty: Vec<(EntityId, FieldMask)> = self
            .sessions
            .values()
            .filter_map(|s| s.entity())
            .filter(|e| !e.dirty_mask.is_empty())
            .map(|e| (e.id, e.dirty_mask))
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        self.state.hooks.fire(&HookEvent::Tick {
            tick: self.tick,
            dirty,
        });
        for session in self.sessions.values_mut() {
            session.clear_dirty();
        }
        self.settle();

        let per_minute = u64::from(self.state.config.update_fps.max(1)) * 60;
        if self.tick % per_minute == 0 {
            debug!(
                "Tick {}: {} sessions, {} players",
                self.tick,
                self.sessions.len(),
                self.state.players.len()
            );
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    // actions

    pub fn close_session(&mut self, id: SessionId, reason: &str) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.close(reason, &mut self.state);
        }
        self.settle();
    }

    pub fn kick(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.kick(&mut self.state);
        }
        self.settle();
    }

    pub fn close_all(&mut self, reason: &str) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.close(reason, &mut self.state);
            }
        }
        self.settle();
    }

    /// Finds a joined player by `#entity_id` or case-insensitive name.
    pub fn find_player(&self, query: &str) -> Option<SessionId> {
        if let Some(id) = query.strip_prefix('#') {
            let entity_id: EntityId = id.parse().ok()?;
            return self.state.players.get(&entity_id).copied();
        }
        let wanted = query.to_lowercase();
        self.players()
            .find(|s| s.name().map(str::to_lowercase).as_deref() == Some(wanted.as_str()))
            .map(|s| s.id())
    }

    /// Sessions logged into `account`.
    pub fn sessions_for_account(&self, account: AccountId) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| !s.is_closed() && s.login_id == Some(account))
            .map(|s| s.id())
            .collect()
    }

    pub fn broadcast(&mut self, packet: &Packet) {
        let bytes = match self.broadcast_codec.encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot broadcast {:?}: {}", packet.kind(), e);
                return;
            }
        };
        for session in self.sessions.values().filter(|s| s.is_joined()) {
            session.write_client(bytes.clone());
        }
    }

    pub fn broadcast_chat(&mut self, text: &str) {
        self.broadcast(&Packet::server_chat(text));
    }

    pub fn send_chat(&self, id: SessionId, text: &str) {
        if let Some(session) = self.sessions.get(&id) {
            session.send_chat(text);
        }
    }

    /// Drains queued effects, then forgets closed sessions.
    pub fn settle(&mut self) {
        while let Some(effect) = self.state.effects.pop_front() {
            match effect {
                Effect::Broadcast(packet) => self.broadcast(&packet),
                Effect::Hit { attacker, hit } => self.apply_hit(attacker, hit),
                Effect::Command {
                    session,
                    command,
                    args,
                } => self.run_command(session, &command, &args),
            }
        }

        for id in std::mem::take(&mut self.state.closed) {
            if let Some(session) = self.sessions.remove(&id) {
                self.release(session.addr().ip());
                debug!(
                    "Session {} removed after {:?}",
                    id,
                    session.connected_for()
                );
            }
        }
    }

    fn apply_hit(&mut self, attacker: EntityId, hit: HitPacket) {
        let Some(&target_session) = self.state.entities.get(&hit.target_id) else {
            return;
        };
        let event = HookEvent::Hit {
            attacker,
            target: hit.target_id,
            damage: hit.damage,
        };
        if self.state.hooks.fire(&event).vetoed {
            return;
        }
        let Some(target) = self.sessions.get_mut(&target_session) else {
            return;
        };
        if target.apply_damage(hit.damage) {
            info!(
                "#{} killed {} #{}",
                attacker,
                target.display_name(),
                hit.target_id
            );
            self.state.hooks.fire(&HookEvent::Kill {
                killer: attacker,
                target: hit.target_id,
            });
        }
    }

    fn run_command(&mut self, caller: SessionId, name: &str, args: &[String]) {
        let Some(command) = self.commands.get(name) else {
            self.send_chat(caller, &format!("Unknown command /{name}. Type /help for a list."));
            return;
        };
        if let Some(right) = command.capability {
            let allowed = self
                .sessions
                .get(&caller)
                .is_some_and(|s| s.has_right(right));
            if !allowed {
                self.send_chat(caller, "You are not allowed to use this command.");
                return;
            }
        }
        if !command.accepts(args.len()) {
            self.send_chat(caller, &format!("Usage: {}", command.usage));
            return;
        }
        let result = (command.run)(self, caller, args);
        match result {
            Ok(Some(reply)) => self.send_chat(caller, &reply),
            Ok(None) => {}
            Err(e) => self.send_chat(caller, &e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Hook, HookError, HookOutcome};
    use crate::session::LegCommand;
    use crate::storage::MemoryStorage;
    use shared::packets::{ClientChatMessage, EntityUpdate};
    use shared::{EntityPatch, Vector3, CHUNK_SCALE};
    use std::sync::Mutex;

    struct Client {
        id: SessionId,
        rx: mpsc::UnboundedReceiver<LegCommand>,
        backend_rx: mpsc::UnboundedReceiver<LegCommand>,
    }

    fn registry_with(config: RelayConfig) -> SessionRegistry {
        let (events, _) = mpsc::unbounded_channel();
        SessionRegistry::new(
            Arc::new(config),
            StorageHandle::spawn(MemoryStorage::new()),
            events,
        )
    }

    fn registry() -> SessionRegistry {
        registry_with(RelayConfig {
            welcome: Vec::new(),
            ..Default::default()
        })
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn join(registry: &mut SessionRegistry, port: u16, entity_id: EntityId, name: &str) -> Client {
        let (leg, rx) = Leg::channel();
        let id = registry.open_session(addr(port), leg);
        let (backend, backend_rx) = Leg::channel();
        registry.on_backend_connected(id, backend);

        let update = Packet::EntityUpdate(EntityUpdate::new(
            entity_id,
            EntityPatch {
                pos: Some(Vector3::new(10 * CHUNK_SCALE, 10 * CHUNK_SCALE, 0)),
                name: Some(name.to_string()),
                ..Default::default()
            },
        ));
        let bytes = PacketCodec::new(Schema::client_to_server())
            .encode(&update)
            .unwrap();
        registry.on_client_data(id, &bytes);
        Client { id, rx, backend_rx }
    }

    fn say(registry: &mut SessionRegistry, client: &Client, text: &str) {
        let chat = Packet::ClientChat(ClientChatMessage {
            value: text.to_string(),
        });
        let bytes = PacketCodec::new(Schema::client_to_server())
            .encode(&chat)
            .unwrap();
        registry.on_client_data(client.id, &bytes);
    }

    fn received(client: &mut Client) -> Vec<Packet> {
        let mut codec = PacketCodec::new(Schema::server_to_client());
        let mut packets = Vec::new();
        while let Ok(command) = client.rx.try_recv() {
            if let LegCommand::Write(bytes) = command {
                packets.extend(codec.decode_all(&bytes).unwrap());
            }
        }
        packets
    }

    fn chat_lines(client: &mut Client) -> Vec<String> {
        received(client)
            .into_iter()
            .filter_map(|p| match p {
                Packet::ServerChat(chat) => Some(chat.value),
                _ => None,
            })
            .collect()
    }

    fn send_update(
        registry: &mut SessionRegistry,
        client: &Client,
        entity_id: EntityId,
        patch: EntityPatch,
    ) {
        let update = Packet::EntityUpdate(EntityUpdate::new(entity_id, patch));
        let bytes = PacketCodec::new(Schema::client_to_server())
            .encode(&update)
            .unwrap();
        registry.on_client_data(client.id, &bytes);
    }

    /// Records the dirty list carried by each tick event.
    struct TickRecorder(Arc<Mutex<Vec<Vec<(EntityId, FieldMask)>>>>);

    impl Hook for TickRecorder {
        fn name(&self) -> &str {
            "tick_recorder"
        }

        fn handle(&mut self, event: &HookEvent) -> Result<HookOutcome, HookError> {
            if let HookEvent::Tick { dirty, .. } = event {
                self.0.lock().unwrap().push(dirty.clone());
            }
            Ok(HookOutcome::Continue)
        }
    }

    struct KillCounter(Arc<Mutex<Vec<(EntityId, EntityId)>>>);

    impl Hook for KillCounter {
        fn name(&self) -> &str {
            "kill_counter"
        }

        fn handle(&mut self, event: &HookEvent) -> Result<HookOutcome, HookError> {
            if let HookEvent::Kill { killer, target } = event {
                self.0.lock().unwrap().push((*killer, *target));
            }
            Ok(HookOutcome::Continue)
        }
    }

    #[tokio::test]
    async fn test_join_is_announced_to_players() {
        let mut registry = registry();
        let mut first = join(&mut registry, 1, 10, "Aria");
        received(&mut first);

        let _second = join(&mut registry, 2, 11, "Bram");

        assert_eq!(chat_lines(&mut first), vec![">>> Bram #11 joined the game"]);
        assert_eq!(registry.players().count(), 2);
    }

    #[tokio::test]
    async fn test_chat_reaches_every_player_but_not_backend() {
        let mut registry = registry();
        let mut first = join(&mut registry, 1, 10, "Aria");
        let mut second = join(&mut registry, 2, 11, "Bram");
        received(&mut first);
        received(&mut second);
        while first.backend_rx.try_recv().is_ok() {}

        say(&mut registry, &first, "hello all");

        for client in [&mut first, &mut second] {
            let packets = received(client);
            assert_eq!(
                packets,
                vec![Packet::ServerChat(shared::packets::ServerChatMessage {
                    entity_id: 10,
                    value: "hello all".to_string()
                })]
            );
        }
        assert!(first.backend_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lethal_hit_fires_kill_once() {
        let mut registry = registry();
        let kills = Arc::new(Mutex::new(Vec::new()));
        registry
            .hooks_mut()
            .register(Box::new(KillCounter(Arc::clone(&kills))));
        let attacker = join(&mut registry, 1, 10, "Aria");
        let target = join(&mut registry, 2, 11, "Bram");

        let hit = HitPacket {
            entity_id: 10,
            target_id: 11,
            damage: 1500.0,
            critical: true,
            stun_duration: 0,
            pos: Vector3::default(),
            hit_type: 0,
        };
        let bytes = PacketCodec::new(Schema::client_to_server())
            .encode(&Packet::Hit(hit))
            .unwrap();
        registry.on_client_data(attacker.id, &bytes);
        registry.on_client_data(attacker.id, &bytes);

        assert_eq!(*kills.lock().unwrap(), vec![(10, 11)]);
        assert!(registry.session(target.id).unwrap().entity().unwrap().hp <= 0.0);
    }

    #[tokio::test]
    async fn test_per_ip_limit() {
        let mut registry = registry_with(RelayConfig {
            max_connections_per_ip: 2,
            ..Default::default()
        });
        assert_eq!(registry.check_admission(addr(1)), Admission::Accepted);
        assert_eq!(registry.check_admission(addr(2)), Admission::Accepted);
        assert_eq!(registry.check_admission(addr(3)), Admission::Refused);

        registry.release(addr(1).ip());
        assert_eq!(registry.connections_from(addr(1).ip()), 1);
        assert_eq!(registry.check_admission(addr(4)), Admission::Accepted);
    }

    #[tokio::test]
    async fn test_closed_session_releases_slot() {
        let mut registry = registry();
        assert_eq!(registry.check_admission(addr(1)), Admission::Accepted);
        let client = join(&mut registry, 1, 10, "Aria");

        registry.on_client_closed(client.id);

        assert!(registry.is_empty());
        assert_eq!(registry.connections_from(addr(1).ip()), 0);
        assert!(registry.state().players.is_empty());
        assert!(registry.state().entities.is_empty());
    }

    #[tokio::test]
    async fn test_leave_is_announced() {
        let mut registry = registry();
        let mut first = join(&mut registry, 1, 10, "Aria");
        let second = join(&mut registry, 2, 11, "Bram");
        received(&mut first);

        registry.on_backend_closed(second.id);

        assert_eq!(chat_lines(&mut first), vec!["<<< Bram #11 left the game"]);
    }

    #[tokio::test]
    async fn test_find_player() {
        let mut registry = registry();
        let first = join(&mut registry, 1, 10, "Aria");
        let _second = join(&mut registry, 2, 11, "Bram");

        assert_eq!(registry.find_player("aria"), Some(first.id));
        assert_eq!(registry.find_player("#10"), Some(first.id));
        assert_eq!(registry.find_player("#99"), None);
        assert_eq!(registry.find_player("nobody"), None);
    }

    #[tokio::test]
    async fn test_unknown_command_replies() {
        let mut registry = registry();
        let mut client = join(&mut registry, 1, 10, "Aria");
        received(&mut client);

        say(&mut registry, &client, "/frobnicate");

        assert_eq!(
            chat_lines(&mut client),
            vec!["Unknown command /frobnicate. Type /help for a list."]
        );
    }

    #[tokio::test]
    async fn test_claimed_entity_id_is_refused() {
        let mut registry = registry();
        let owner = join(&mut registry, 1, 10, "Aria");
        let intruder = join(&mut registry, 2, 10, "Mallory");

        assert_eq!(registry.state().players.get(&10), Some(&owner.id));
        assert_eq!(registry.state().entities.get(&10), Some(&owner.id));
        let session = registry.session(intruder.id).unwrap();
        assert!(!session.is_joined());
        assert_eq!(session.entity_id(), None);

        registry.on_client_closed(intruder.id);

        assert_eq!(registry.state().players.get(&10), Some(&owner.id));
        assert_eq!(registry.state().entities.get(&10), Some(&owner.id));
        assert_eq!(registry.find_player("#10"), Some(owner.id));
        assert_eq!(registry.find_player("aria"), Some(owner.id));
    }

    #[tokio::test]
    async fn test_tick_hook_sees_dirty_masks_before_reset() {
        let mut registry = registry();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        registry
            .hooks_mut()
            .register(Box::new(TickRecorder(Arc::clone(&ticks))));
        let client = join(&mut registry, 1, 10, "Aria");
        registry.tick();

        send_update(
            &mut registry,
            &client,
            10,
            EntityPatch {
                hp: Some(321.0),
                ..Default::default()
            },
        );
        send_update(
            &mut registry,
            &client,
            10,
            EntityPatch {
                flags: Some(4),
                ..Default::default()
            },
        );
        let touched = FieldMask::HEALTH | FieldMask::FLAGS;
        assert_eq!(
            registry.session(client.id).unwrap().entity().unwrap().dirty_mask,
            touched
        );

        registry.tick();

        let seen = ticks.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec![(10, FieldMask::POSITION | FieldMask::NAME)]);
        assert_eq!(seen[1], vec![(10, touched)]);

        let record = registry.session(client.id).unwrap().entity().unwrap();
        assert!(record.dirty_mask.is_empty());
        assert_approx_eq::assert_approx_eq!(record.hp, 321.0);
        assert_eq!(record.flags, 4);
        assert_eq!(record.name, "Aria");
        assert_eq!(registry.current_tick(), 2);
    }

    #[test]
    fn test_rank_table() {
        let config = RelayConfig::default();
        let ranks = RankTable::from_config(&config.ranks);
        assert!(ranks.rights("ADMIN").contains("admin"));
        assert!(ranks.rights("nobody").is_empty());
        assert_eq!(ranks.names(), vec!["admin", "default"]);
    }
}
