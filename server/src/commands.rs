//! Slash commands typed into chat.
//!
//! Each [`Command`] is a plain function over the registry. Commands that need
//! storage never wait on it in place: they spawn a task that talks to the
//! storage actor and posts a [`Deferred`] back to the server loop, which
//! applies it through [`apply_deferred`].

use crate::network::ServerMessage;
use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::storage::{AccountId, AccountInfo};
use log::{info, warn};
use shared::{EntityId, Vector3};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;

/// Storage key of the global spawn point.
pub const SPAWN_KEY: &str = "globalspawnpoint";

pub type CommandResult = Result<Option<String>, CommandError>;
pub type CommandFn = fn(&mut SessionRegistry, SessionId, &[String]) -> CommandResult;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("[ERROR] Could not find player {0}!")]
    PlayerNotFound(String),

    #[error("[ERROR] You have to be in the world to do that.")]
    NotInWorld,

    #[error("[ERROR] {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
    pub min_args: usize,
    /// `None` takes the rest of the line.
    pub max_args: Option<usize>,
    /// Right the caller must hold.
    pub capability: Option<&'static str>,
    pub run: CommandFn,
}

impl Command {
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map_or(true, |max| count <= max)
    }
}

/// Result of a command's storage work, applied on the server loop.
#[derive(Debug)]
pub enum Deferred {
    Reply(String),
    LoggedIn(AccountInfo),
    Teleport {
        pos: Vector3,
        reply: String,
    },
    RankChanged {
        account: AccountId,
        rank: String,
        reply: String,
    },
}

pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for command in BUILTINS {
            registry.register(*command);
        }
        registry
    }

    pub fn register(&mut self, command: Command) {
        self.commands.insert(command.name, command);
    }

    pub fn get(&self, name: &str) -> Option<Command> {
        self.commands.get(name).copied()
    }

    /// Sorted command names.
    pub fn names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const ADMIN: Option<&str> = Some("admin");

const BUILTINS: &[Command] = &[
    Command {
        name: "help",
        usage: "/help [command]",
        help: "Lists commands or describes one.",
        min_args: 0,
        max_args: Some(1),
        capability: None,
        run: help,
    },
    Command {
        name: "who",
        usage: "/who",
        help: "Lists players.",
        min_args: 0,
        max_args: Some(0),
        capability: None,
        run: who,
    },
    Command {
        name: "whowhere",
        usage: "/whowhere",
        help: "Lists players and their locations.",
        min_args: 0,
        max_args: Some(0),
        capability: None,
        run: whowhere,
    },
    Command {
        name: "whereis",
        usage: "/whereis [player]",
        help: "Shows where a player is in the world.",
        min_args: 0,
        max_args: Some(1),
        capability: None,
        run: whereis,
    },
    Command {
        name: "pm",
        usage: "/pm <player> <message>",
        help: "Sends a private message to a player.",
        min_args: 2,
        max_args: None,
        capability: None,
        run: pm,
    },
    Command {
        name: "tell",
        usage: "/tell <player> <message>",
        help: "Tells something to a specific player.",
        min_args: 2,
        max_args: None,
        capability: None,
        run: tell,
    },
    Command {
        name: "player",
        usage: "/player <player>",
        help: "Returns information about a player.",
        min_args: 1,
        max_args: Some(1),
        capability: None,
        run: player,
    },
    Command {
        name: "register",
        usage: "/register <password> <password repeated>",
        help: "Registers a numeric account id for your name.",
        min_args: 2,
        max_args: Some(2),
        capability: None,
        run: register,
    },
    Command {
        name: "login",
        usage: "/login <id> <password>",
        help: "Logs into a registered account.",
        min_args: 2,
        max_args: Some(2),
        capability: None,
        run: login,
    },
    Command {
        name: "logout",
        usage: "/logout",
        help: "Logs out of your account.",
        min_args: 0,
        max_args: Some(0),
        capability: None,
        run: logout,
    },
    Command {
        name: "spawn",
        usage: "/spawn",
        help: "Sends you to the global spawn point.",
        min_args: 0,
        max_args: Some(0),
        capability: None,
        run: spawn,
    },
    Command {
        name: "setspawn",
        usage: "/setspawn",
        help: "Sets the global spawn point to your position.",
        min_args: 0,
        max_args: Some(0),
        capability: ADMIN,
        run: setspawn,
    },
    Command {
        name: "warp",
        usage: "/warp [name]",
        help: "Lists warp points or sends you to one.",
        min_args: 0,
        max_args: Some(1),
        capability: None,
        run: warp,
    },
    Command {
        name: "setwarp",
        usage: "/setwarp <name>",
        help: "Sets a warp point at your position.",
        min_args: 1,
        max_args: Some(1),
        capability: ADMIN,
        run: setwarp,
    },
    Command {
        name: "delwarp",
        usage: "/delwarp <name>",
        help: "Deletes a warp point.",
        min_args: 1,
        max_args: Some(1),
        capability: ADMIN,
        run: delwarp,
    },
    Command {
        name: "heal",
        usage: "/heal [player] [hp]",
        help: "Heals a player by an amount, or fully.",
        min_args: 0,
        max_args: Some(2),
        capability: ADMIN,
        run: heal,
    },
    Command {
        name: "kick",
        usage: "/kick <player>",
        help: "Kicks the specified player.",
        min_args: 1,
        max_args: Some(1),
        capability: ADMIN,
        run: kick,
    },
    Command {
        name: "setrank",
        usage: "/setrank <id> <rank>",
        help: "Sets the rank of an account.",
        min_args: 2,
        max_args: Some(2),
        capability: ADMIN,
        run: setrank,
    },
    Command {
        name: "ban",
        usage: "/ban <player> [reason]",
        help: "Bans the address of a player.",
        min_args: 1,
        max_args: None,
        capability: ADMIN,
        run: ban,
    },
    Command {
        name: "unban",
        usage: "/unban <ip>",
        help: "Lifts a ban on an address.",
        min_args: 1,
        max_args: Some(1),
        capability: ADMIN,
        run: unban,
    },
];

const CLASS_NAMES: [&str; 5] = ["Unknown", "Warrior", "Ranger", "Mage", "Rogue"];
const SPECIALIZATIONS: [[&str; 2]; 5] = [
    ["Unknown", "Unknown"],
    ["Berserker", "Guardian"],
    ["Sniper", "Scout"],
    ["Fire", "Water"],
    ["Assassin", "Ninja"],
];

/// Runs `work` off the loop and posts its result back to `caller`.
fn defer<F>(registry: &SessionRegistry, caller: SessionId, work: F)
where
    F: Future<Output = Deferred> + Send + 'static,
{
    let events = registry.state().events.clone();
    tokio::spawn(async move {
        let action = work.await;
        if events
            .send(ServerMessage::Deferred {
                session: caller,
                action,
            })
            .is_err()
        {
            warn!("Server stopped before a command result for session {} arrived", caller);
        }
    });
}

/// Resolves a player argument, or the caller when absent.
fn target(
    registry: &SessionRegistry,
    caller: SessionId,
    name: Option<&String>,
) -> Result<SessionId, CommandError> {
    match name {
        None => Ok(caller),
        Some(name) => registry
            .find_player(name)
            .ok_or_else(|| CommandError::PlayerNotFound(name.clone())),
    }
}

fn name_of(registry: &SessionRegistry, session: SessionId) -> Result<String, CommandError> {
    registry
        .session(session)
        .and_then(|s| s.name())
        .map(str::to_string)
        .ok_or(CommandError::NotInWorld)
}

fn position_of(registry: &SessionRegistry, session: SessionId) -> Result<Vector3, CommandError> {
    registry
        .session(session)
        .and_then(|s| s.position())
        .ok_or(CommandError::NotInWorld)
}

fn help(registry: &mut SessionRegistry, _caller: SessionId, args: &[String]) -> CommandResult {
    let Some(name) = args.first() else {
        return Ok(Some(format!(
            "Commands: {}",
            registry.commands().names().join(", ")
        )));
    };
    match registry.commands().get(&name.to_lowercase()) {
        Some(command) => Ok(Some(format!("{}: {}", command.usage, command.help))),
        None => Ok(Some("No such command".to_string())),
    }
}

fn who_where(registry: &SessionRegistry, include_where: bool) -> String {
    let mut players: Vec<(EntityId, String)> = registry
        .players()
        .map(|p| {
            let id = p.entity_id().unwrap_or_default();
            let mut label = format!("{} #{}", p.display_name(), id);
            if include_where {
                if let Some(record) = p.entity() {
                    label.push_str(&format!(" {}", record.chunk()));
                }
            }
            (id, label)
        })
        .collect();
    if players.is_empty() {
        return "No players connected".to_string();
    }
    players.sort();
    let noun = if players.len() == 1 { "player" } else { "players" };
    let names: Vec<String> = players.into_iter().map(|(_, label)| label).collect();
    format!("{} {} connected: {}", names.len(), noun, names.join(", "))
}

fn who(registry: &mut SessionRegistry, _caller: SessionId, _args: &[String]) -> CommandResult {
    Ok(Some(who_where(registry, false)))
}

fn whowhere(registry: &mut SessionRegistry, _caller: SessionId, _args: &[String]) -> CommandResult {
    Ok(Some(who_where(registry, true)))
}

fn whereis(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    let chunk = registry
        .session(player)
        .and_then(|s| s.entity())
        .map(|e| e.chunk())
        .ok_or(CommandError::NotInWorld)?;
    if player == caller {
        return Ok(Some(format!("You are at {chunk}")));
    }
    Ok(Some(format!("{} is at {}", name_of(registry, player)?, chunk)))
}

fn pm(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    let from = name_of(registry, caller)?;
    registry.send_chat(player, &format!("{} (PM): {}", from, args[1..].join(" ")));
    Ok(Some("PM sent".to_string()))
}

fn tell(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    if player == caller {
        return Err(CommandError::Invalid(
            "You can not tell messages back to yourself!".to_string(),
        ));
    }
    let message = format!(
        "{} -> {}: {}",
        name_of(registry, caller)?,
        name_of(registry, player)?,
        args[1..].join(" ")
    );
    registry.send_chat(player, &message);
    Ok(Some(message))
}

fn player(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    let record = registry
        .session(player)
        .and_then(|s| s.entity())
        .ok_or(CommandError::NotInWorld)?;
    let class = usize::from(record.class.class_type);
    let class_name = CLASS_NAMES.get(class).copied().unwrap_or("Unknown");
    let specialization = SPECIALIZATIONS
        .get(class)
        .and_then(|specs| specs.get(usize::from(record.class.specialization)))
        .copied()
        .unwrap_or("Unknown");
    Ok(Some(format!(
        "'{}' is a lvl {} {} ({})",
        record.name, record.level.level, class_name, specialization
    )))
}

fn register(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    if args[0] != args[1] {
        return Ok(Some(
            "[REGISTRATION] Your password does not equal its repeating.".to_string(),
        ));
    }
    let name = name_of(registry, caller)?;
    let ip = registry
        .session(caller)
        .map(|s| s.addr().ip().to_string())
        .unwrap_or_default();
    let password = args[0].clone();
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.register_account(name.clone(), password, ip.clone()).await {
            Ok(id) => {
                if let Err(e) = storage.record_login(id, name, ip).await {
                    warn!("Could not record login for account {}: {}", id, e);
                }
                Deferred::Reply(format!(
                    "[REGISTRATION] You can use /login {id} <password> now everytime you want to login."
                ))
            }
            Err(e) => {
                warn!("Registration failed: {}", e);
                Deferred::Reply("[ERROR] Registration failed.".to_string())
            }
        }
    });
    Ok(None)
}

fn login(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let id: AccountId = args[0]
        .parse()
        .map_err(|_| CommandError::Invalid("Invalid ID given.".to_string()))?;
    let session = registry.session(caller).ok_or(CommandError::NotInWorld)?;
    if session.login_id.is_some() {
        return Ok(Some("[INFO] You are already logged in!".to_string()));
    }
    let name = session.display_name();
    let ip = session.addr().ip().to_string();
    let password = args[1].clone();
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.get_account(id, password).await {
            Ok(Some(account)) => {
                if let Err(e) = storage.record_login(id, name, ip).await {
                    warn!("Could not record login for account {}: {}", id, e);
                }
                Deferred::LoggedIn(account)
            }
            Ok(None) => Deferred::Reply("[ERROR] Wrong ID or password.".to_string()),
            Err(e) => {
                warn!("Login for account {} failed: {}", id, e);
                Deferred::Reply("[ERROR] Login failed.".to_string())
            }
        }
    });
    Ok(None)
}

fn logout(registry: &mut SessionRegistry, caller: SessionId, _args: &[String]) -> CommandResult {
    let default_rights = registry.state().default_rights();
    let session = registry
        .session_mut(caller)
        .ok_or(CommandError::NotInWorld)?;
    let Some((account, seconds)) = session.clear_login(default_rights) else {
        return Ok(Some("[INFO] You are not logged in!".to_string()));
    };
    registry.state().flush_online_time(account, seconds);
    Ok(Some("Successfully logged out.".to_string()))
}

fn spawn(registry: &mut SessionRegistry, caller: SessionId, _args: &[String]) -> CommandResult {
    position_of(registry, caller)?;
    let fallback = registry.config().spawn_point();
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        let pos = storage
            .load_value(SPAWN_KEY)
            .await
            .and_then(|bytes| serde_json::from_slice::<[i64; 3]>(&bytes).ok())
            .map(|[x, y, z]| Vector3::new(x, y, z))
            .unwrap_or(fallback);
        Deferred::Teleport {
            pos,
            reply: "Sent to spawn.".to_string(),
        }
    });
    Ok(None)
}

fn setspawn(registry: &mut SessionRegistry, caller: SessionId, _args: &[String]) -> CommandResult {
    let pos = position_of(registry, caller)?;
    let bytes = serde_json::to_vec(&[pos.x, pos.y, pos.z])
        .map_err(|e| CommandError::Invalid(e.to_string()))?;
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.save_value(SPAWN_KEY.to_string(), bytes).await {
            Ok(()) => Deferred::Reply("Global spawn point set.".to_string()),
            Err(e) => {
                warn!("Saving spawn point failed: {}", e);
                Deferred::Reply("Could not set global spawn point!".to_string())
            }
        }
    });
    Ok(None)
}

fn warp(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let storage = registry.state().storage.clone();
    let Some(name) = args.first().cloned() else {
        defer(registry, caller, async move {
            match storage.list_warps().await {
                Ok(warps) if warps.is_empty() => Deferred::Reply("No warps defined.".to_string()),
                Ok(warps) => Deferred::Reply(format!("Warps: {}", warps.join(", "))),
                Err(e) => Deferred::Reply(format!("[ERROR] {e}")),
            }
        });
        return Ok(None);
    };
    position_of(registry, caller)?;
    defer(registry, caller, async move {
        match storage.get_warp(name.clone()).await {
            Ok(Some(pos)) => Deferred::Teleport {
                pos,
                reply: format!("Sent to warp point \"{name}\"."),
            },
            Ok(None) => Deferred::Reply("Could not get a warp point with such name.".to_string()),
            Err(e) => Deferred::Reply(format!("[ERROR] {e}")),
        }
    });
    Ok(None)
}

fn setwarp(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let pos = position_of(registry, caller)?;
    let name = args[0].clone();
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.set_warp(name.clone(), pos).await {
            Ok(()) => Deferred::Reply(format!("Warp point \"{name}\" defined.")),
            Err(e) => {
                warn!("Saving warp {} failed: {}", name, e);
                Deferred::Reply("Could not define warp point!".to_string())
            }
        }
    });
    Ok(None)
}

fn delwarp(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let name = args[0].clone();
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.delete_warp(name.clone()).await {
            Ok(true) => Deferred::Reply(format!("Warp point \"{name}\" deleted.")),
            Ok(false) | Err(_) => Deferred::Reply("Could not delete warp point!".to_string()),
        }
    });
    Ok(None)
}

fn heal(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    let amount = match args.get(1) {
        Some(hp) => Some(
            hp.parse::<f32>()
                .map_err(|_| CommandError::Invalid(format!("{hp} is not an amount.")))?,
        ),
        None => None,
    };
    let name = name_of(registry, player)?;
    let session = registry
        .session_mut(player)
        .ok_or(CommandError::NotInWorld)?;
    if !session.heal(amount) {
        return Err(CommandError::Invalid("Invalid amount.".to_string()));
    }
    if player == caller {
        Ok(Some("You healed yourself.".to_string()))
    } else {
        Ok(Some(format!("You healed {name}")))
    }
}

fn kick(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    registry.kick(player);
    Ok(None)
}

fn setrank(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let account: AccountId = args[0]
        .parse()
        .map_err(|_| CommandError::Invalid("Invalid ID given.".to_string()))?;
    let rank = args[1].to_lowercase();
    if !registry.state().ranks.contains(&rank) {
        return Err(CommandError::Invalid("Invalid rank!".to_string()));
    }
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.set_rank(account, rank.clone()).await {
            Ok(()) => Deferred::RankChanged {
                account,
                reply: format!("[SUCCESS] Rank of player with id {account} set to {rank}"),
                rank,
            },
            Err(e) => {
                warn!("Setting rank of account {} failed: {}", account, e);
                Deferred::Reply("[RANK] Could not set rank!".to_string())
            }
        }
    });
    Ok(None)
}

fn ban(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let player = target(registry, caller, args.first())?;
    let name = name_of(registry, player)?;
    let ip = registry
        .session(player)
        .map(|s| s.addr().ip())
        .ok_or(CommandError::NotInWorld)?;
    let reason = if args.len() > 1 {
        args[1..].join(" ")
    } else {
        "No reason given".to_string()
    };

    info!("Banning {} ({}): {}", name, ip, reason);
    registry.send_chat(player, "You have been banned from this server.");
    registry.close_session(player, "banned");
    registry.broadcast_chat(&format!("[INFO] {name} has been banned: {reason}"));

    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.ban_ip(ip, reason).await {
            Ok(()) => Deferred::Reply(format!("Banned {ip}")),
            Err(e) => Deferred::Reply(format!("[ERROR] Could not store ban for {ip}: {e}")),
        }
    });
    Ok(None)
}

fn unban(registry: &mut SessionRegistry, caller: SessionId, args: &[String]) -> CommandResult {
    let ip: IpAddr = args[0]
        .parse()
        .map_err(|_| CommandError::Invalid(format!("{} is not an address.", args[0])))?;
    let storage = registry.state().storage.clone();
    defer(registry, caller, async move {
        match storage.unban_ip(ip).await {
            Ok(true) => Deferred::Reply(format!("Unbanned {ip}")),
            Ok(false) => Deferred::Reply(format!("{ip} is not banned")),
            Err(e) => Deferred::Reply(format!("[ERROR] {e}")),
        }
    });
    Ok(None)
}

/// Applies the result of a command's storage work.
pub fn apply_deferred(registry: &mut SessionRegistry, caller: SessionId, action: Deferred) {
    match action {
        Deferred::Reply(text) => registry.send_chat(caller, &text),
        Deferred::LoggedIn(account) => {
            let rights = registry.state().ranks.rights(&account.rank);
            let Some(session) = registry.session_mut(caller) else {
                return;
            };
            let rank = account.rank.to_lowercase();
            session.set_login(account.id, rank.clone(), rights);
            let name = session.display_name();
            info!("{} logged in as account {} ({})", name, account.id, rank);
            registry.send_chat(
                caller,
                &format!(
                    "[LOGIN] Successfully logged in as {} {}. Your last login name was {} with IP {}.",
                    rank, name, account.last_name, account.last_ip
                ),
            );
        }
        Deferred::Teleport { pos, reply } => {
            let Some(session) = registry.session_mut(caller) else {
                return;
            };
            session.teleport(pos);
            registry.send_chat(caller, &reply);
        }
        Deferred::RankChanged {
            account,
            rank,
            reply,
        } => {
            let rights = registry.state().ranks.rights(&rank);
            for id in registry.sessions_for_account(account) {
                if let Some(session) = registry.session_mut(id) {
                    session.rank = Some(rank.clone());
                    session.rights.extend(rights.iter().cloned());
                    info!("Rights of {} updated", session.display_name());
                }
            }
            registry.send_chat(caller, &reply);
        }
    }
}
