//! Protocol code dispatch: turns a decoded reliable frame or a stripped
//! datagram payload into the corresponding session/world mutation plus
//! event-bus notification, mirroring the reference's `_handle_codes_tcp` /
//! `_handle_codes_udp` / `_handle_car_codes` / `_chat_handler`.
//!
//! Codes `V`, `W`, `Y` and `E` always broadcast reliably even when the
//! caller asked for a datagram reply — state-sync broadcasts and named
//! events must not be allowed to silently drop on an unreliable link.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::event::{ChatOverride, EventBus, EventContext, EventValue, topics};
use crate::registry::Registry;
use crate::session::{Car, Session, Unicycle};

const FORCE_RELIABLE_CODES: &[u8] = b"VWYE";

pub fn forces_reliable(code: u8) -> bool {
    FORCE_RELIABLE_CODES.contains(&code)
}

/// `Od:<slot>-<car_id>` removal notice, matching the reference's
/// `f"Od:{self.cid}-{car_id}"` (`Client.py:459,479,491,511,548`).
fn od_packet(slot_id: i32, car_id: usize) -> Vec<u8> {
    format!("Od:{slot_id}-{car_id}").into_bytes()
}

/// Full spawn packet the reference builds once per spawn attempt and reuses
/// for the accept broadcast, the reject self-reply and the car's stored
/// `packet` (replayed to later joiners): `f"Os:{roles}:{nick}:{cid}-{car_id}:{car_data}"`
/// (`Client.py:451`).
fn os_packet(sender: &Session, car_id: usize, car_data: &str) -> String {
    format!(
        "Os:{}:{}:{}-{car_id}:{car_data}",
        sender.roles, sender.nickname, sender.slot_id
    )
}

/// Shared context every dispatch call needs: the session table to broadcast
/// against, the event bus to notify, and the per-player car cap.
pub struct Dispatcher {
    pub registry: Arc<Registry>,
    pub bus: Arc<EventBus>,
    pub log_chat: bool,
    pub max_cars: usize,
    pub allow_unicycle: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, bus: Arc<EventBus>, log_chat: bool, max_cars: usize) -> Self {
        Self {
            registry,
            bus,
            log_chat,
            max_cars,
            allow_unicycle: true,
        }
    }

    /// Send `payload` to every synced session except `sender`, honoring
    /// `FORCE_RELIABLE_CODES` and `to_self`.
    pub fn broadcast(&self, sender: &Arc<Session>, payload: &[u8], to_self: bool, to_udp: bool) {
        let effective_udp = to_udp && payload.first().is_none_or(|&c| !forces_reliable(c));
        for session in self.registry.synced_sessions() {
            if !to_self && Arc::ptr_eq(&session, sender) {
                continue;
            }
            if let Err(e) = session.send_self(payload, effective_udp) {
                tracing::debug!(slot = session.slot_id, error = %e, "broadcast send failed");
            }
        }
    }

    /// Dispatch one reliable (TCP) frame from `sender`.
    pub fn handle_reliable(&self, sender: &Arc<Session>, payload: &[u8]) {
        let Some(&code) = payload.first() else {
            return;
        };
        match code {
            b'H' => self.handle_ready(sender),
            b'C' => self.handle_chat(sender, payload),
            b'O' => self.handle_car_codes(sender, &payload[1..]),
            b'E' => self.handle_named_event(sender, &payload[1..]),
            b'N' => self.broadcast(sender, payload, false, false),
            b'V' | b'W' | b'Y' => self.broadcast(sender, payload, false, false),
            other => tracing::trace!(slot = sender.slot_id, code = other as char, "unknown reliable code, ignoring"),
        }
    }

    /// Dispatch one datagram payload from `sender`, already stripped of the
    /// two-byte slot/reserved prefix (byte 2 of the raw datagram is `code`).
    pub fn handle_datagram(&self, sender: &Arc<Session>, payload: &[u8]) {
        let Some(&code) = payload.first() else {
            return;
        };
        match code {
            b'p' => {
                self.bus
                    .emit_async(&EventContext::new(topics::SENT_PING).with_slot(sender.slot_id));
                let _ = sender.send_self(payload, true);
            }
            b'Z' => self.handle_position(sender, &payload[1..]),
            b'X' => self.broadcast(sender, payload, false, true),
            other => tracing::trace!(slot = sender.slot_id, code = other as char, "unknown datagram code, ignoring"),
        }
    }

    /// Entry into PLAY: announce the new player, hand it every other
    /// player's cars directly, then mark it synced and ready. Mirrors the
    /// reference's `_connected_handler`, which runs this whole sequence
    /// before the client is considered caught up with the world.
    fn handle_ready(&self, sender: &Arc<Session>) {
        sender.mark_ready();

        self.bus
            .emit_both(&EventContext::new(topics::PLAYER_JOIN).with_slot(sender.slot_id));

        let mut announce = vec![b'S', b'n'];
        announce.extend_from_slice(sender.nickname.as_bytes());
        self.broadcast(sender, &announce, true, false);

        let welcome = format!("J{} joined the server!", sender.nickname);
        self.broadcast(sender, welcome.as_bytes(), true, false);

        for other in self.registry.live_sessions() {
            if Arc::ptr_eq(&other, sender) {
                continue;
            }
            for (_car_id, car) in other.cars() {
                let _ = sender.send_self(car.packet.as_bytes(), false);
            }
        }

        sender.mark_synced();
        self.bus
            .emit_both(&EventContext::new(topics::PLAYER_READY).with_slot(sender.slot_id));
    }

    fn handle_named_event(&self, sender: &Arc<Session>, body: &[u8]) {
        let Ok(text) = std::str::from_utf8(body) else {
            return;
        };
        let Some((name, data)) = text.split_once(':') else {
            return;
        };
        self.bus.emit_both(
            &EventContext::new(name.to_string())
                .with_slot(sender.slot_id)
                .with_data(Json::String(data.to_string())),
        );
        self.bus.emit_scripted(
            &EventContext::new(name.to_string())
                .with_slot(sender.slot_id)
                .with_data(Json::String(data.to_string())),
        );
    }

    fn handle_position(&self, sender: &Arc<Session>, body: &[u8]) {
        if let Ok(text) = std::str::from_utf8(body) {
            if let Some((car_id_str, json_str)) = text.split_once(':') {
                if let (Ok(car_id), Ok(value)) = (
                    car_id_str.parse::<usize>(),
                    serde_json::from_str::<Json>(json_str),
                ) {
                    if let Some(mut car) = sender.car(car_id) {
                        car.pos = Some(value.clone());
                        sender.set_car(car_id, Some(car));
                    }
                    sender.set_last_position(value.clone());
                    self.bus.emit_async(
                        &EventContext::new(topics::CHANGE_POSITION)
                            .with_slot(sender.slot_id)
                            .with_data(value),
                    );
                }
            }
        }
        let mut framed = vec![b'Z'];
        framed.extend_from_slice(body);
        self.broadcast(sender, &framed, false, true);
    }

    /// Car sub-dispatch: the second byte after `O` selects spawn / delete /
    /// edit / reset / broken / focus-move.
    fn handle_car_codes(&self, sender: &Arc<Session>, body: &[u8]) {
        let Some((&sub_code, rest)) = body.split_first() else {
            return;
        };
        match sub_code {
            b's' => self.spawn_car(sender, rest),
            b'd' => self.delete_car(sender, rest),
            b'c' => self.edit_car(sender, rest),
            b'r' => self.reset_car(sender, rest),
            b't' => self.broken_car(sender, rest),
            b'm' => self.focus_move(sender, rest),
            _ => tracing::debug!(slot = sender.slot_id, sub_code = sub_code as char, "unknown car sub-code"),
        }
    }

    /// Parses `<cid>-<car_id>:<json>`, computes the real `car_id` as the
    /// lowest empty slot (ignoring whatever the client proposed), and
    /// applies the accept rule: allowed by scripting/handlers and under the
    /// per-player car cap, or a unicycle with unicycles allowed, or flagged
    /// `over_spawn`.
    ///
    /// The vehicle description is located by its leading `{`, not by
    /// splitting on `:`, since the description itself may contain colons
    /// (driven by `jbm`/config paths) and the id prefix ahead of it is never
    /// consulted for anything but locating where the JSON begins.
    fn spawn_car(&self, sender: &Arc<Session>, rest: &[u8]) {
        let Ok(text) = std::str::from_utf8(rest) else {
            return;
        };
        let Some(brace) = text.find('{') else {
            return;
        };
        let json_str = &text[brace..];
        let Some(car_id) = (0..self.max_cars).find(|&i| sender.car(i).is_none()) else {
            return;
        };

        let (json, json_ok) = match serde_json::from_str::<Json>(json_str) {
            Ok(v) => (Some(v), true),
            Err(_) => (None, false),
        };
        let is_unicycle = json
            .as_ref()
            .and_then(|v| v.get("jbm"))
            .and_then(Json::as_str)
            .map(|jbm| jbm == "unicycle")
            .unwrap_or(false);

        let scripted = self.bus.emit_scripted(
            &EventContext::new(topics::lua::ON_VEHICLE_SPAWN).with_slot(sender.slot_id),
        );
        let scripting_veto = scripted.iter().any(|v| matches!(v, EventValue::Bool(true) | EventValue::Veto));

        let handler_results = self.bus.emit_both(
            &EventContext::new(topics::CAR_SPAWN)
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
        let handler_veto = handler_results.iter().any(|v| matches!(v, EventValue::Bool(false) | EventValue::Veto));
        let allow = !scripting_veto && !handler_veto;

        let over_spawn = false;
        let accept = (allow && sender.car_count() < self.max_cars)
            || (is_unicycle && self.allow_unicycle)
            || over_spawn;

        let pkt = os_packet(sender, car_id, json_str);

        if !accept {
            let _ = sender.send_self(pkt.as_bytes(), false);
            let _ = sender.send_self(&od_packet(sender.slot_id, car_id), false);
            return;
        }

        if is_unicycle {
            if let Some(old_id) = sender.unicycle().car_id {
                sender.set_car(old_id, None);
                self.broadcast(sender, &od_packet(sender.slot_id, old_id), true, false);
            }
            sender.set_unicycle(Unicycle {
                car_id: Some(car_id),
                packet: pkt.clone(),
            });
        }

        sender.set_car(
            car_id,
            Some(Car {
                packet: pkt.clone(),
                json,
                json_ok,
                unicycle: is_unicycle,
                over_spawn,
                pos: None,
            }),
        );
        if sender.focus_car() < 0 {
            sender.set_focus_car(car_id as i32);
        }

        self.broadcast(sender, pkt.as_bytes(), true, false);

        self.bus.emit_async(
            &EventContext::new("onCarSpawned")
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
    }

    fn delete_car(&self, sender: &Arc<Session>, rest: &[u8]) {
        let Some((cid_str, car_id_str)) = std::str::from_utf8(rest).ok().and_then(|s| s.split_once('-')) else {
            return;
        };
        let (Ok(cid), Ok(car_id)) = (cid_str.parse::<i32>(), car_id_str.parse::<usize>()) else {
            return;
        };
        if cid != sender.slot_id {
            return;
        }

        let mut original = vec![b'O', b'd'];
        original.extend_from_slice(rest);
        self.broadcast(sender, &original, true, false);

        sender.set_car(car_id, None);
        if sender.unicycle().car_id == Some(car_id) {
            sender.set_unicycle(Unicycle::default());
        }

        self.broadcast(sender, &od_packet(cid, car_id), true, false);

        self.bus.emit_both(
            &EventContext::new(topics::CAR_DELETE)
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
        self.bus.emit_async(
            &EventContext::new("onCarDeleted")
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
        self.bus
            .emit_scripted(&EventContext::new(topics::lua::ON_VEHICLE_DELETED).with_slot(sender.slot_id));
    }

    fn edit_car(&self, sender: &Arc<Session>, rest: &[u8]) {
        let Ok(text) = std::str::from_utf8(rest) else {
            return;
        };
        let Some((cid_str, remainder)) = text.split_once('-') else {
            return;
        };
        let Some((car_id_str, json_str)) = remainder.split_once(':') else {
            return;
        };
        let (Ok(cid), Ok(car_id)) = (cid_str.parse::<i32>(), car_id_str.parse::<usize>()) else {
            return;
        };
        if cid != sender.slot_id {
            return;
        }

        if sender.unicycle().car_id == Some(car_id) {
            sender.set_car(car_id, None);
            sender.set_unicycle(Unicycle::default());
            self.broadcast(sender, &od_packet(cid, car_id), true, false);
            return;
        }

        if let Some(mut car) = sender.car(car_id) {
            if let Ok(patch) = serde_json::from_str::<Json>(json_str) {
                let mut merged = car.json.clone().unwrap_or(Json::Object(Default::default()));
                if let (Json::Object(base), Json::Object(extra)) = (&mut merged, patch) {
                    base.extend(extra);
                }
                car.json = Some(merged);
                car.json_ok = true;
            }
            car.packet = json_str.to_string();
            sender.set_car(car_id, Some(car));
        }

        let mut framed = vec![b'O', b'c'];
        framed.extend_from_slice(text.as_bytes());
        self.broadcast(sender, &framed, false, false);

        self.bus.emit_both(
            &EventContext::new(topics::CAR_EDITED)
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
        self.bus
            .emit_scripted(&EventContext::new(topics::lua::ON_VEHICLE_EDITED).with_slot(sender.slot_id));
    }

    fn reset_car(&self, sender: &Arc<Session>, rest: &[u8]) {
        let Some((cid_str, _)) = std::str::from_utf8(rest).ok().and_then(|s| s.split_once('-')) else {
            return;
        };
        let Ok(cid) = cid_str.parse::<i32>() else {
            return;
        };
        if cid != sender.slot_id {
            return;
        }

        let mut framed = vec![b'O', b'r'];
        framed.extend_from_slice(rest);
        self.broadcast(sender, &framed, false, false);

        self.bus
            .emit_both(&EventContext::new(topics::CAR_RESET).with_slot(sender.slot_id));
        self.bus
            .emit_scripted(&EventContext::new(topics::lua::ON_VEHICLE_RESET).with_slot(sender.slot_id));
    }

    fn broken_car(&self, sender: &Arc<Session>, rest: &[u8]) {
        let mut framed = vec![b'O', b't'];
        framed.extend_from_slice(rest);
        self.broadcast(sender, &framed, false, false);
        if let Some((cid_str, _)) = std::str::from_utf8(rest).ok().and_then(|s| s.split_once('-')) {
            if cid_str.parse::<i32>() == Ok(sender.slot_id) {
                self.bus
                    .emit_async(&EventContext::new(topics::CAR_CHANGED).with_slot(sender.slot_id));
            }
        }
    }

    fn focus_move(&self, sender: &Arc<Session>, rest: &[u8]) {
        let Some((cid_str, car_id_str)) = std::str::from_utf8(rest).ok().and_then(|s| s.split_once('-')) else {
            return;
        };
        let (Ok(cid), Ok(car_id)) = (cid_str.parse::<i32>(), car_id_str.parse::<i32>()) else {
            return;
        };
        if cid != sender.slot_id {
            return;
        }
        sender.set_focus_car(car_id);

        let mut framed = vec![b'O', b'm'];
        framed.extend_from_slice(rest);
        self.broadcast(sender, &framed, true, false);

        self.bus.emit_async(
            &EventContext::new(topics::CAR_FOCUS_MOVE)
                .with_slot(sender.slot_id)
                .with_data(serde_json::json!({"carId": car_id})),
        );
    }

    /// Chat path: payload is `C:<nick>:<msg>`. Scripting gets first refusal
    /// (`onChatMessage` returning `1` drops silently); otherwise native
    /// sync+async subscribers may override the message, redirect it, or
    /// veto it.
    fn handle_chat(&self, sender: &Arc<Session>, payload: &[u8]) {
        let Ok(text) = std::str::from_utf8(payload) else {
            return;
        };
        let Some(sep) = text[2.min(text.len())..].find(':').map(|i| i + 2.min(text.len())) else {
            let _ = sender.send_self(b"C:Server: Invalid message.", false);
            return;
        };
        let message = &text[sep + 1..];
        if message.is_empty() {
            return;
        }

        if self.log_chat {
            tracing::info!(slot = sender.slot_id, nickname = %sender.nickname, message, "chat");
        }

        let scripted = self.bus.emit_scripted(
            &EventContext::new(topics::lua::ON_CHAT_MESSAGE)
                .with_slot(sender.slot_id)
                .with_nickname(sender.nickname.clone())
                .with_data(Json::String(message.to_string())),
        );
        if scripted.iter().any(|v| matches!(v, EventValue::Bool(true))) {
            return;
        }

        let ctx = EventContext::new(topics::CHAT_RECEIVE)
            .with_slot(sender.slot_id)
            .with_nickname(sender.nickname.clone())
            .with_data(Json::String(message.to_string()));

        let mut outgoing = message.to_string();
        let mut to_all = true;
        let mut to_self = true;
        let mut suppressed = false;
        for value in self.bus.emit_both(&ctx) {
            match value {
                EventValue::Veto | EventValue::Bool(false) => suppressed = true,
                EventValue::Chat(ChatOverride {
                    message,
                    to_all: a,
                    to_self: s,
                }) => {
                    outgoing = message;
                    to_all = a;
                    to_self = s;
                }
                EventValue::Unit => {}
                other => tracing::debug!(?other, "bad returned data from chat handler"),
            }
        }
        if suppressed {
            return;
        }

        let mut framed = vec![b'C'];
        framed.extend_from_slice(outgoing.as_bytes());
        if to_all {
            self.broadcast(sender, &framed, to_self, false);
        } else if to_self {
            let _ = sender.send_self(&framed, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::dummy_session;

    fn dispatcher() -> (Dispatcher, Arc<Registry>) {
        let registry = Arc::new(Registry::new(4));
        let bus = Arc::new(EventBus::new());
        (Dispatcher::new(registry.clone(), bus, true, 21), registry)
    }

    #[test]
    fn forces_reliable_matches_the_protected_code_set() {
        assert!(forces_reliable(b'Y'));
        assert!(forces_reliable(b'V'));
        assert!(!forces_reliable(b'Z'));
    }

    #[test]
    fn spawn_then_delete_car_clears_the_slot() {
        let (dispatcher, registry) = dispatcher();
        let sender = registry.insert(|id| dummy_session(id, "a")).unwrap();
        dispatcher.handle_reliable(&sender, b"Os0-0:{\"jbm\":\"car\"}");
        assert!(sender.car(0).is_some());
        dispatcher.handle_reliable(&sender, format!("Od{}-0", sender.slot_id).as_bytes());
        assert!(sender.car(0).is_none());
    }

    #[test]
    fn spawning_two_unicycles_replaces_the_first() {
        let (dispatcher, registry) = dispatcher();
        let sender = registry.insert(|id| dummy_session(id, "a")).unwrap();
        dispatcher.handle_reliable(&sender, b"Os0-0:{\"jbm\":\"unicycle\"}");
        assert_eq!(sender.unicycle().car_id, Some(0));
        dispatcher.handle_reliable(&sender, b"Os0-0:{\"jbm\":\"unicycle\"}");
        assert_eq!(sender.unicycle().car_id, Some(1));
        assert!(sender.car(0).is_none());
        assert!(sender.car(1).is_some());
    }

    #[test]
    fn chat_veto_suppresses_the_message() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.bus.register_sync(topics::CHAT_RECEIVE, |_| EventValue::Veto);
        let sender = registry.insert(|id| dummy_session(id, "a")).unwrap();
        dispatcher.handle_reliable(&sender, b"C:a:hello");
    }

    #[test]
    fn malformed_chat_gets_an_invalid_message_reply() {
        let (dispatcher, registry) = dispatcher();
        let sender = registry.insert(|id| dummy_session(id, "a")).unwrap();
        dispatcher.handle_reliable(&sender, b"Cnotachatmessage");
    }
}
