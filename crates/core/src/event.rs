//! Topic-based event bus: sync subscribers, async-labeled subscribers (run
//! serially on this thread, but bucketed separately so callers can choose to
//! await only the async set) and a scripting bridge for an external
//! interpreter (Lua or similar).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value as Json;

/// Well-known topic names, matching the reference implementation's event
/// tables so a scripting bridge can subscribe by the same names a plugin
/// author would expect.
pub mod topics {
    pub const SERVER_STARTED: &str = "onServerStarted";
    pub const PLAYER_SENT_KEY: &str = "onPlayerSentKey";
    pub const PLAYER_AUTHENTICATED: &str = "onPlayerAuthenticated";
    pub const PLAYER_JOIN: &str = "onPlayerJoin";
    pub const PLAYER_READY: &str = "onPlayerReady";
    pub const CHAT_RECEIVE: &str = "onChatReceive";
    pub const CAR_SPAWN: &str = "onCarSpawn";
    pub const CAR_DELETE: &str = "onCarDelete";
    pub const CAR_EDITED: &str = "onCarEdited";
    pub const CAR_RESET: &str = "onCarReset";
    pub const CAR_CHANGED: &str = "onCarChanged";
    pub const CAR_FOCUS_MOVE: &str = "onCarFocusMove";
    pub const SENT_PING: &str = "onSentPing";
    pub const CHANGE_POSITION: &str = "onChangePosition";
    pub const PLAYER_DISCONNECT: &str = "onPlayerDisconnect";
    pub const SERVER_STOPPED: &str = "onServerStopped";
    pub const SERVER_TICK: &str = "serverTick";
    pub const SERVER_TICK_0_5S: &str = "serverTick_0.5s";
    pub const SERVER_TICK_1S: &str = "serverTick_1s";
    pub const SERVER_TICK_2S: &str = "serverTick_2s";
    pub const SERVER_TICK_3S: &str = "serverTick_3s";
    pub const SERVER_TICK_4S: &str = "serverTick_4s";
    pub const SERVER_TICK_5S: &str = "serverTick_5s";
    pub const SERVER_TICK_10S: &str = "serverTick_10s";
    pub const SERVER_TICK_30S: &str = "serverTick_30s";
    pub const SERVER_TICK_60S: &str = "serverTick_60s";

    /// Scripting-bridge topic names, distinct from the sync/async tables
    /// above because an embedded-script author uses a different vocabulary
    /// than a native subscriber (`onInit` vs `onServerStarted`, etc).
    pub mod lua {
        pub const ON_INIT: &str = "onInit";
        pub const ON_SHUTDOWN: &str = "onShutdown";
        pub const ON_PLAYER_AUTH: &str = "onPlayerAuth";
        pub const ON_PLAYER_CONNECTING: &str = "onPlayerConnecting";
        pub const ON_PLAYER_JOINING: &str = "onPlayerJoining";
        pub const ON_PLAYER_JOIN: &str = "onPlayerJoin";
        pub const ON_PLAYER_DISCONNECT: &str = "onPlayerDisconnect";
        pub const ON_CHAT_MESSAGE: &str = "onChatMessage";
        pub const ON_VEHICLE_SPAWN: &str = "onVehicleSpawn";
        pub const ON_VEHICLE_EDITED: &str = "onVehicleEdited";
        pub const ON_VEHICLE_DELETED: &str = "onVehicleDeleted";
        pub const ON_VEHICLE_RESET: &str = "onVehicleReset";
        pub const ON_FILE_CHANGED: &str = "onFileChanged";
        pub const ON_CONSOLE_INPUT: &str = "onConsoleInput";
    }
}

/// Payload handed to every subscriber. `data` carries whatever structured
/// arguments the topic defines (a car JSON blob, a chat message, ...);
/// `slot_id` identifies the originating session when there is one.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub event_name: String,
    pub slot_id: Option<i32>,
    pub nickname: Option<String>,
    pub data: Option<Json>,
}

impl EventContext {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Default::default()
        }
    }

    pub fn with_slot(mut self, slot_id: i32) -> Self {
        self.slot_id = Some(slot_id);
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_data(mut self, data: Json) -> Self {
        self.data = Some(data);
        self
    }
}

/// A chat handler's override return value: replace the outgoing message,
/// redirect it, or veto it outright.
#[derive(Debug, Clone)]
pub struct ChatOverride {
    pub message: String,
    pub to_all: bool,
    pub to_self: bool,
}

/// Common envelope for whatever a subscriber hands back. Most topics ignore
/// the return value entirely (`Unit`); a handful of "with handler" topics
/// (chat, car spawn/delete/edit, player join) interpret a typed variant.
#[derive(Debug, Clone)]
pub enum EventValue {
    Unit,
    Veto,
    Bool(bool),
    Chat(ChatOverride),
    Json(Json),
}

pub type SyncHandler = Arc<dyn Fn(&EventContext) -> EventValue + Send + Sync>;

/// Result of a call into the scripting bridge: `None` means no handler was
/// registered under that name, which the caller should warn about and skip.
pub trait ScriptInterpreter: Send + Sync {
    fn call(&self, func_name: &str, ctx: &EventContext) -> Option<EventValue>;
}

struct LuaBinding {
    func_name: String,
    interpreter: Arc<dyn ScriptInterpreter>,
}

#[derive(Default)]
struct Topic {
    sync: Vec<(u64, SyncHandler)>,
    async_: Vec<(u64, SyncHandler)>,
}

/// Topic-keyed pub/sub bus. Dispatch snapshots the subscriber list for a
/// topic before invoking it, so a handler may register or unregister during
/// its own call without deadlocking the bus.
pub struct EventBus {
    topics: RwLock<std::collections::HashMap<String, Topic>>,
    lua_topics: RwLock<std::collections::HashMap<String, Vec<(u64, LuaBinding)>>>,
    next_id: AtomicU64,
}

/// Handle returned by `register*`, used to `unregister` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(std::collections::HashMap::new()),
            lua_topics: RwLock::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a synchronous subscriber on `topic`.
    pub fn register_sync(
        &self,
        topic: &str,
        handler: impl Fn(&EventContext) -> EventValue + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.alloc_id();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .sync
            .push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Register an async-bucketed subscriber on `topic`. Dispatched the same
    /// way as a sync subscriber, but kept in a separate bucket so callers
    /// that only want the "fire and forget" set can call `emit_async` alone.
    pub fn register_async(
        &self,
        topic: &str,
        handler: impl Fn(&EventContext) -> EventValue + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.alloc_id();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .async_
            .push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Register a scripting-bridge binding: calling `topic` invokes
    /// `func_name` through `interpreter`.
    pub fn register_scripted(
        &self,
        topic: &str,
        func_name: impl Into<String>,
        interpreter: Arc<dyn ScriptInterpreter>,
    ) -> SubscriptionId {
        let id = self.alloc_id();
        self.lua_topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((
                id,
                LuaBinding {
                    func_name: func_name.into(),
                    interpreter,
                },
            ));
        SubscriptionId(id)
    }

    /// Remove a subscription by the id returned from `register*`, searching
    /// every topic bucket. Mirrors the reference's `unregister`, which also
    /// scans every topic since a handler's registration site isn't tracked
    /// separately.
    pub fn unregister(&self, id: SubscriptionId) {
        let mut removed = 0u32;
        {
            let mut topics = self.topics.write();
            for topic in topics.values_mut() {
                let before = topic.sync.len() + topic.async_.len();
                topic.sync.retain(|(sid, _)| *sid != id.0);
                topic.async_.retain(|(sid, _)| *sid != id.0);
                removed += (before - (topic.sync.len() + topic.async_.len())) as u32;
            }
        }
        {
            let mut lua = self.lua_topics.write();
            for bindings in lua.values_mut() {
                let before = bindings.len();
                bindings.retain(|(sid, _)| *sid != id.0);
                removed += (before - bindings.len()) as u32;
            }
        }
        tracing::debug!(subscription = id.0, removed, "unregistered event handler");
    }

    fn dispatch(topic_name: &str, handlers: &[(u64, SyncHandler)], ctx: &EventContext) -> Vec<EventValue> {
        handlers
            .iter()
            .filter_map(|(_, handler)| {
                match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::error!(topic = topic_name, "event handler panicked");
                        None
                    }
                }
            })
            .collect()
    }

    /// Call every sync subscriber on `topic`, in registration order.
    pub fn emit_sync(&self, ctx: &EventContext) -> Vec<EventValue> {
        let snapshot = self
            .topics
            .read()
            .get(&ctx.event_name)
            .map(|t| t.sync.clone());
        match snapshot {
            Some(handlers) => Self::dispatch(&ctx.event_name, &handlers, ctx),
            None => {
                tracing::trace!(event = %ctx.event_name, "no sync subscribers");
                Vec::new()
            }
        }
    }

    /// Call every async-bucketed subscriber on `topic`.
    pub fn emit_async(&self, ctx: &EventContext) -> Vec<EventValue> {
        let snapshot = self
            .topics
            .read()
            .get(&ctx.event_name)
            .map(|t| t.async_.clone());
        match snapshot {
            Some(handlers) => Self::dispatch(&ctx.event_name, &handlers, ctx),
            None => Vec::new(),
        }
    }

    /// Call the async bucket followed by the sync bucket and concatenate
    /// results, matching the reference's `call_as_events`.
    pub fn emit_both(&self, ctx: &EventContext) -> Vec<EventValue> {
        let mut results = self.emit_async(ctx);
        results.extend(self.emit_sync(ctx));
        results
    }

    /// Call every scripting-bridge binding registered on `topic`. A missing
    /// interpreter function is logged and skipped, never treated as fatal.
    pub fn emit_scripted(&self, ctx: &EventContext) -> Vec<EventValue> {
        let snapshot = self.lua_topics.read().get(&ctx.event_name).map(|bindings| {
            bindings
                .iter()
                .map(|(_, b)| (b.func_name.clone(), b.interpreter.clone()))
                .collect::<Vec<_>>()
        });
        let Some(bindings) = snapshot else {
            return Vec::new();
        };
        bindings
            .into_iter()
            .filter_map(|(func_name, interpreter)| {
                match interpreter.call(&func_name, ctx) {
                    Some(value) => Some(value),
                    None => {
                        tracing::warn!(
                            topic = %ctx.event_name,
                            function = %func_name,
                            "scripting function not found"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

impl Clone for Topic {
    fn clone(&self) -> Self {
        Self {
            sync: self.sync.clone(),
            async_: self.async_.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn sync_subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.register_sync("onPlayerJoin", move |_| {
            o1.lock().push(1);
            EventValue::Unit
        });
        let o2 = order.clone();
        bus.register_sync("onPlayerJoin", move |_| {
            o2.lock().push(2);
            EventValue::Unit
        });
        bus.emit_sync(&EventContext::new("onPlayerJoin"));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unregister_removes_from_every_topic() {
        let bus = EventBus::new();
        let id = bus.register_sync("onCarSpawn", |_| EventValue::Unit);
        bus.unregister(id);
        assert!(bus.emit_sync(&EventContext::new("onCarSpawn")).is_empty());
    }

    #[test]
    fn panicking_handler_does_not_break_dispatch() {
        let bus = EventBus::new();
        bus.register_sync("onChatReceive", |_| panic!("boom"));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        bus.register_sync("onChatReceive", move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            EventValue::Unit
        });
        bus.emit_sync(&EventContext::new("onChatReceive"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_both_runs_async_then_sync() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.register_async("serverTick", move |_| {
            o1.lock().push("async");
            EventValue::Unit
        });
        let o2 = order.clone();
        bus.register_sync("serverTick", move |_| {
            o2.lock().push("sync");
            EventValue::Unit
        });
        bus.emit_both(&EventContext::new("serverTick"));
        assert_eq!(*order.lock(), vec!["async", "sync"]);
    }

    struct Echo;
    impl ScriptInterpreter for Echo {
        fn call(&self, func_name: &str, _ctx: &EventContext) -> Option<EventValue> {
            if func_name == "onPlayerJoin" {
                Some(EventValue::Bool(true))
            } else {
                None
            }
        }
    }

    #[test]
    fn scripted_dispatch_skips_missing_functions() {
        let bus = EventBus::new();
        bus.register_scripted(topics::lua::ON_PLAYER_JOIN, "onPlayerJoin", Arc::new(Echo));
        bus.register_scripted(topics::lua::ON_PLAYER_JOIN, "missingFn", Arc::new(Echo));
        let results = bus.emit_scripted(&EventContext::new(topics::lua::ON_PLAYER_JOIN));
        assert_eq!(results.len(), 1);
    }
}
