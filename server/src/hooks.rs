//! Named-event dispatch to external handlers.
//!
//! The relay fires one [`HookEvent`] per interesting thing that happens in a
//! session and only looks at the short-circuit [`HookResult`]. Handlers run in
//! registration order; the first one to veto or replace wins. A handler that
//! errors or panics is logged and skipped so it can never take a session down.

use log::{trace, warn};
use shared::entity::Item;
use shared::{EntityId, FieldGroup, FieldMask, Vector3};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    ConnectionAttempt {
        addr: SocketAddr,
    },
    Join {
        entity_id: EntityId,
        name: String,
    },
    EntityUpdate {
        entity_id: EntityId,
        mask: FieldMask,
    },
    FieldUpdate {
        entity_id: EntityId,
        group: FieldGroup,
    },
    Chat {
        entity_id: EntityId,
        message: String,
    },
    Command {
        entity_id: Option<EntityId>,
        command: String,
        args: Vec<String>,
    },
    Drop {
        entity_id: EntityId,
        item: Item,
        pos: Vector3,
    },
    Pickup {
        entity_id: EntityId,
        item: Item,
        pos: Vector3,
    },
    Hit {
        attacker: EntityId,
        target: EntityId,
        damage: f32,
    },
    Kill {
        killer: EntityId,
        target: EntityId,
    },
    Leave {
        entity_id: EntityId,
        name: String,
    },
    /// Fired before dirty masks are reset, so `dirty` lists what every
    /// entity touched during the tick that just ended.
    Tick {
        tick: u64,
        dirty: Vec<(EntityId, FieldMask)>,
    },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::ConnectionAttempt { .. } => "on_connection_attempt",
            HookEvent::Join { .. } => "on_join",
            HookEvent::EntityUpdate { .. } => "on_entity_update",
            HookEvent::FieldUpdate { group, .. } => group.event_name(),
            HookEvent::Chat { .. } => "on_chat",
            HookEvent::Command { .. } => "on_command",
            HookEvent::Drop { .. } => "on_drop",
            HookEvent::Pickup { .. } => "on_pickup",
            HookEvent::Hit { .. } => "on_hit",
            HookEvent::Kill { .. } => "on_kill",
            HookEvent::Leave { .. } => "on_leave",
            HookEvent::Tick { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// No opinion; the next handler runs.
    Continue,
    Veto,
    /// Substitute a value, e.g. a rewritten chat line or a rejection message.
    Replace(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookResult {
    pub vetoed: bool,
    pub value: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
}

pub trait Hook: Send {
    fn name(&self) -> &str;

    fn handle(&mut self, event: &HookEvent) -> Result<HookOutcome, HookError>;
}

#[derive(Default)]
pub struct HookBus {
    handlers: Vec<Box<dyn Hook>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Box<dyn Hook>) {
        self.handlers.push(hook);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn fire(&mut self, event: &HookEvent) -> HookResult {
        for handler in &mut self.handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            match outcome {
                Ok(Ok(HookOutcome::Continue)) => {}
                Ok(Ok(HookOutcome::Veto)) => {
                    trace!("{} vetoed by {}", event.name(), handler.name());
                    return HookResult {
                        vetoed: true,
                        value: None,
                    };
                }
                Ok(Ok(HookOutcome::Replace(value))) => {
                    return HookResult {
                        vetoed: false,
                        value: Some(value),
                    };
                }
                Ok(Err(e)) => {
                    warn!("Hook {} failed on {}: {}", handler.name(), event.name(), e);
                }
                Err(_) => {
                    warn!("Hook {} panicked on {}", handler.name(), event.name());
                }
            }
        }
        HookResult::default()
    }
}

/// Vetoes chat lines containing any configured word, case-insensitively.
pub struct ChatFilter {
    words: Vec<String>,
}

impl ChatFilter {
    pub fn new(words: Vec<String>) -> Self {
        Self {
            words: words.into_iter().map(|w| w.to_lowercase()).collect(),
        }
    }
}

impl Hook for ChatFilter {
    fn name(&self) -> &str {
        "chat_filter"
    }

    fn handle(&mut self, event: &HookEvent) -> Result<HookOutcome, HookError> {
        let HookEvent::Chat { entity_id, message } = event else {
            return Ok(HookOutcome::Continue);
        };
        let lowered = message.to_lowercase();
        if let Some(word) = self.words.iter().find(|w| lowered.contains(w.as_str())) {
            warn!("[CHAT] Dropped message from #{}: contains {:?}", entity_id, word);
            return Ok(HookOutcome::Veto);
        }
        Ok(HookOutcome::Continue)
    }
}
