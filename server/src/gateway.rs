//! Delivery gateway: authenticates connections, routes their inbound events,
//! and fans producer events out to channel members.
//!
//! Delivery is best-effort and at-most-once. A broadcast goes to whoever is
//! a member when the membership snapshot is taken; an event for an empty
//! channel is dropped and reported as `false` to the caller.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthOutcome, DegradeReason, TokenVerifier};
use crate::config::Config;
use crate::error::GatewayError;
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound};
use crate::types::{
    is_urgent, Channel, ClientMessage, GatewayEvent, ServerErrorMsg, ServerMessage, UserTypingMsg,
};

const JOINED_NOTIFICATION_ROOM: &str = "Successfully joined notification room";

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Members in the snapshot, including any excluded sender.
    pub members: usize,
    /// Frames actually queued.
    pub delivered: usize,
}

pub struct Gateway {
    registry: ConnectionRegistry,
    verifier: TokenVerifier,
    allow_anonymous_channels: bool,
    outbound_buffer: usize,
    /// Internal lifecycle bus. Nobody listening is fine.
    event_tx: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            registry: ConnectionRegistry::new(),
            verifier: TokenVerifier::new(config),
            allow_anonymous_channels: config.allow_anonymous_channels,
            outbound_buffer: config.outbound_buffer.max(1),
            event_tx,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: GatewayEvent) {
        let _ = self.event_tx.send(event);
    }

    // ── Connection lifecycle ────────────────────────────────

    /// Authenticate an upgrade request and register the connection.
    ///
    /// Never refuses: a missing or bad credential yields an anonymous connection.
    pub fn accept_connection(&self, headers: &HeaderMap) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let outcome = self.verifier.authenticate(headers);
        self.accept(outcome)
    }

    /// Register a connection whose handshake has already been judged.
    pub fn accept(&self, outcome: AuthOutcome) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        match outcome {
            AuthOutcome::Authenticated(user_id) => {
                self.registry.register(id, Some(user_id.clone()), tx);
                info!(conn_id = %id, user_id = %user_id, "connection authenticated");
                self.publish(GatewayEvent::Authenticated {
                    connection_id: id,
                    user_id,
                });
            }
            AuthOutcome::Anonymous(reason) => {
                self.registry.register(id, None, tx);
                match &reason {
                    DegradeReason::Missing => {
                        info!(conn_id = %id, "no token, connection continues anonymously")
                    }
                    other => {
                        warn!(conn_id = %id, reason = %other, "auth degraded to anonymous")
                    }
                }
                self.publish(GatewayEvent::AuthDegraded {
                    connection_id: id,
                    reason: reason.to_string(),
                });
            }
        }

        (id, rx)
    }

    /// Unregister a connection. Safe to call more than once.
    pub fn disconnect(&self, conn: ConnectionId) -> bool {
        let Some(entry) = self.registry.unregister(conn) else {
            return false;
        };
        info!(
            conn_id = %conn,
            user_id = ?entry.user_id,
            "connection closed"
        );
        self.publish(GatewayEvent::Disconnected {
            connection_id: conn,
            user_id: entry.user_id,
        });
        true
    }

    /// Record inbound activity for the heartbeat.
    pub fn touch(&self, conn: ConnectionId) {
        self.registry.touch(conn);
    }

    /// Evict connections past the heartbeat bound, then ping the rest.
    /// Returns the number evicted.
    pub fn sweep(&self, timeout: Duration) -> usize {
        if self.registry.is_empty() {
            return 0;
        }
        let stale = self.registry.stale(timeout);
        for conn in &stale {
            // The writer sends the close frame, then sees its queue end.
            let _ = self.registry.send(
                *conn,
                Outbound::Close {
                    code: 1001,
                    reason: "heartbeat timeout",
                },
            );
            if self.registry.unregister(*conn).is_some() {
                warn!(conn_id = %conn, "heartbeat timeout, connection evicted");
                self.publish(GatewayEvent::Evicted { connection_id: *conn });
            }
        }
        let pinged = self.registry.ping_all();
        debug!(pinged, evicted = stale.len(), "heartbeat sweep");
        stale.len()
    }

    // ── Inbound events ──────────────────────────────────────

    /// Decode and route one inbound text frame. Failures become an `error`
    /// frame for this connection only.
    pub fn handle_message(&self, conn: ConnectionId, text: &str) {
        if let Err(e) = self.dispatch(conn, text) {
            warn!(conn_id = %conn, "message error: {e}");
            self.send_error(conn, &e.to_string());
        }
    }

    fn dispatch(&self, conn: ConnectionId, text: &str) -> Result<(), GatewayError> {
        let msg: ClientMessage = serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("invalid event: {e}")))?;

        match msg {
            ClientMessage::JoinNotificationRoom(user_id) => self.join_user_channel(conn, &user_id),
            ClientMessage::JoinWorkspaceChat(workspace_id) => {
                self.join_workspace_channel(conn, &workspace_id).map(|_| ())
            }
            ClientMessage::LeaveWorkspaceChat(workspace_id) => {
                self.leave_workspace_channel(conn, &workspace_id);
                Ok(())
            }
            ClientMessage::TypingChat(typing) => self
                .relay_typing(conn, &typing.workspace_id, &typing.user_name)
                .map(|_| ()),
        }
    }

    /// Admit `conn` to `user:<requested>`.
    ///
    /// Authenticated connections may only join their own channel. Anonymous
    /// connections are admitted only when anonymous channels are enabled.
    pub fn join_user_channel(&self, conn: ConnectionId, requested: &str) -> Result<(), GatewayError> {
        let identity = self.registry.identity(conn)?;
        let channel = Channel::user(requested);

        match identity.as_deref() {
            Some(bound) if bound == requested => {}
            Some(bound) => {
                warn!(conn_id = %conn, bound, requested, "refused join of another user's channel");
                return Err(GatewayError::ChannelAuthorizationDenied {
                    requested: requested.to_owned(),
                });
            }
            None if self.allow_anonymous_channels => {
                debug!(conn_id = %conn, channel = %channel, "anonymous join (degraded mode)");
            }
            None => {
                return Err(GatewayError::AnonymousDenied {
                    channel: channel.to_string(),
                })
            }
        }

        self.registry.join(conn, channel.clone())?;
        info!(conn_id = %conn, channel = %channel, "joined notification channel");
        self.send_to(
            conn,
            &ServerMessage::TestNotification(json!({ "message": JOINED_NOTIFICATION_ROOM })),
        );
        Ok(())
    }

    /// Move `conn` into `workspace:<workspace_id>`, leaving its previous workspace.
    /// Workspace membership itself is authorized by the CRUD layer, not here.
    pub fn join_workspace_channel(
        &self,
        conn: ConnectionId,
        workspace_id: &str,
    ) -> Result<Option<Channel>, GatewayError> {
        let channel = Channel::workspace(workspace_id);
        if self.registry.identity(conn)?.is_none() && !self.allow_anonymous_channels {
            return Err(GatewayError::AnonymousDenied {
                channel: channel.to_string(),
            });
        }

        let previous = self.registry.join(conn, channel.clone())?;
        info!(
            conn_id = %conn,
            channel = %channel,
            left = ?previous.as_ref().map(ToString::to_string),
            "joined workspace channel"
        );
        Ok(previous)
    }

    /// Leave `workspace:<workspace_id>`; no-op when not a member.
    pub fn leave_workspace_channel(&self, conn: ConnectionId, workspace_id: &str) -> bool {
        let channel = Channel::workspace(workspace_id);
        let left = self.registry.leave(conn, &channel);
        if left {
            info!(conn_id = %conn, channel = %channel, "left workspace channel");
        }
        left
    }

    /// Tell every other member of the workspace that `conn` is typing.
    /// Only members of the workspace channel may relay.
    pub fn relay_typing(
        &self,
        conn: ConnectionId,
        workspace_id: &str,
        display_name: &str,
    ) -> Result<FanOut, GatewayError> {
        let user_id = self.registry.identity(conn)?;
        let channel = Channel::workspace(workspace_id);
        if !self.registry.is_member(conn, &channel) {
            return Err(GatewayError::NotAMember {
                channel: channel.to_string(),
            });
        }
        let msg = ServerMessage::UserTyping(UserTypingMsg {
            user_id,
            user_name: display_name.to_owned(),
        });
        Ok(self.fan_out(&channel, &msg, Some(conn)))
    }

    // ── Producer API ────────────────────────────────────────

    /// Deliver a notification payload to every connection of `user_id`.
    /// Returns whether the user channel had any member.
    pub fn broadcast_to_user(&self, user_id: &str, payload: &JsonValue) -> bool {
        let msg = ServerMessage::for_user(payload.clone());
        self.fan_out(&Channel::user(user_id), &msg, None).members > 0
    }

    /// Deliver any outbound event to a workspace channel.
    pub fn broadcast_to_workspace(&self, workspace_id: &str, msg: &ServerMessage) -> bool {
        self.fan_out(&Channel::workspace(workspace_id), msg, None).members > 0
    }

    /// Normal delivery plus a distinct `urgent-notification` on the same channel.
    pub fn escalate_urgent(&self, user_id: &str, payload: &JsonValue) -> bool {
        let had_members = self.broadcast_to_user(user_id, payload);
        let urgent = ServerMessage::UrgentNotification(payload.clone());
        let out = self.fan_out(&Channel::user(user_id), &urgent, None);
        info!(user_id, recipients = out.delivered, "urgent notification escalated");
        had_members
    }

    /// Producer entry point: escalates high-priority and deadline payloads.
    pub fn notify(&self, user_id: &str, payload: &JsonValue) -> bool {
        if is_urgent(payload) {
            self.escalate_urgent(user_id, payload)
        } else {
            self.broadcast_to_user(user_id, payload)
        }
    }

    // ── Delivery ────────────────────────────────────────────

    /// Serialize once, queue on every member except `exclude`. A failing
    /// target is logged and skipped.
    pub fn fan_out(
        &self,
        channel: &Channel,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> FanOut {
        let members = self.registry.members_of(channel);
        if members.is_empty() {
            debug!(channel = %channel, event = msg.event_name(), "no members, event dropped");
            return FanOut::default();
        }

        let text: Arc<str> = match serde_json::to_string(msg) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(channel = %channel, event = msg.event_name(), "serialize error: {e}");
                return FanOut {
                    members: members.len(),
                    delivered: 0,
                };
            }
        };

        let mut delivered = 0;
        for &target in members.iter().filter(|&&id| Some(id) != exclude) {
            match self.registry.send(target, Outbound::Text(Arc::clone(&text))) {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    warn!(conn_id = %target, channel = %channel, ?failure, "fan-out target skipped")
                }
            }
        }

        debug!(
            channel = %channel,
            event = msg.event_name(),
            members = members.len(),
            recipients = delivered,
            "broadcast"
        );
        FanOut {
            members: members.len(),
            delivered,
        }
    }

    /// Queue one message for one connection.
    pub fn send_to(&self, conn: ConnectionId, msg: &ServerMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!(conn_id = %conn, "serialize error: {e}");
                return false;
            }
        };
        self.registry.send(conn, Outbound::Text(json.into())).is_ok()
    }

    fn send_error(&self, conn: ConnectionId, message: &str) {
        let msg = ServerMessage::Error(ServerErrorMsg {
            message: message.to_owned(),
        });
        self.send_to(conn, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Gateway {
        Gateway::new(&Config::default())
    }

    fn connect(gw: &Gateway, user: &str) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        gw.accept(AuthOutcome::Authenticated(user.into()))
    }

    fn anonymous(gw: &Gateway) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        gw.accept(AuthOutcome::Anonymous(DegradeReason::Missing))
    }

    /// Next queued server message, if any.
    fn next(rx: &mut mpsc::Receiver<Outbound>) -> Option<ServerMessage> {
        loop {
            match rx.try_recv().ok()? {
                Outbound::Text(t) => return Some(serde_json::from_str(&t).unwrap()),
                _ => continue,
            }
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        std::iter::from_fn(|| next(rx)).collect()
    }

    #[test]
    fn own_user_channel_join_is_confirmed() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.handle_message(a, r#"{"event":"join-notification-room","data":"u1"}"#);

        assert!(gw.registry().is_member(a, &Channel::user("u1")));
        assert_eq!(
            next(&mut rx),
            Some(ServerMessage::TestNotification(
                json!({"message": "Successfully joined notification room"})
            ))
        );
    }

    #[test]
    fn joining_another_users_channel_is_refused() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.handle_message(a, r#"{"event":"join-notification-room","data":"u2"}"#);

        assert!(!gw.registry().is_member(a, &Channel::user("u2")));
        match next(&mut rx) {
            Some(ServerMessage::Error(e)) => {
                assert!(e.message.contains("Cannot join another user's notification room"))
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        // Still registered and usable.
        gw.join_user_channel(a, "u1").unwrap();
        assert!(gw.registry().is_member(a, &Channel::user("u1")));
    }

    #[test]
    fn anonymous_joins_follow_configuration() {
        let gw = gateway();
        let (anon, mut rx) = anonymous(&gw);
        assert!(matches!(
            gw.join_user_channel(anon, "u1"),
            Err(GatewayError::AnonymousDenied { .. })
        ));
        assert!(gw.join_workspace_channel(anon, "w1").is_err());
        assert_eq!(gw.registry().channel_count(), 0);
        assert!(next(&mut rx).is_none());

        let permissive = Gateway::new(&Config {
            allow_anonymous_channels: true,
            ..Config::default()
        });
        let (anon, _rx) = anonymous(&permissive);
        permissive.join_user_channel(anon, "u1").unwrap();
        permissive.join_workspace_channel(anon, "w1").unwrap();
        assert!(permissive.registry().is_member(anon, &Channel::user("u1")));
    }

    #[test]
    fn switching_workspaces_keeps_one_membership() {
        let gw = gateway();
        let (a, _rx) = connect(&gw, "u1");
        gw.handle_message(a, r#"{"event":"join-workspace-chat","data":"a"}"#);
        gw.handle_message(a, r#"{"event":"join-workspace-chat","data":"b"}"#);

        assert!(gw.registry().is_member(a, &Channel::workspace("b")));
        assert!(!gw.registry().is_member(a, &Channel::workspace("a")));
    }

    #[test]
    fn leave_workspace_is_a_noop_when_absent() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        assert!(!gw.leave_workspace_channel(a, "w1"));
        gw.join_workspace_channel(a, "w1").unwrap();
        gw.handle_message(a, r#"{"event":"leave-workspace-chat","data":"w1"}"#);
        assert!(!gw.registry().is_member(a, &Channel::workspace("w1")));
        assert!(next(&mut rx).is_none());
    }

    #[test]
    fn malformed_frame_yields_error_event_only() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.handle_message(a, "{not json");
        assert!(matches!(next(&mut rx), Some(ServerMessage::Error(_))));
        assert_eq!(gw.registry().len(), 1);
    }

    #[test]
    fn broadcast_reaches_only_the_addressed_user() {
        let gw = gateway();
        let (a, mut rx_a) = connect(&gw, "u1");
        let (b, mut rx_b) = connect(&gw, "u2");
        gw.join_user_channel(a, "u1").unwrap();
        gw.join_user_channel(b, "u2").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert!(gw.broadcast_to_user("u1", &json!({"message": "Task assigned"})));

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        match &got[0] {
            ServerMessage::Notification(p) => assert_eq!(p["message"], "Task assigned"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn broadcast_to_empty_channel_reports_false() {
        let gw = gateway();
        assert!(!gw.broadcast_to_user("nobody", &json!({"message": "x"})));
        assert!(!gw.broadcast_to_workspace("w0", &ServerMessage::ChatMessage(json!({}))));
    }

    #[test]
    fn every_tab_of_a_user_receives() {
        let gw = gateway();
        let (a, mut rx_a) = connect(&gw, "u1");
        let (b, mut rx_b) = connect(&gw, "u1");
        gw.join_user_channel(a, "u1").unwrap();
        gw.join_user_channel(b, "u1").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        gw.broadcast_to_user("u1", &json!({"type": "invitation", "message": "join w1"}));
        assert!(matches!(next(&mut rx_a), Some(ServerMessage::WorkspaceInvitation(_))));
        assert!(matches!(next(&mut rx_b), Some(ServerMessage::WorkspaceInvitation(_))));
    }

    #[test]
    fn failing_target_does_not_stop_fan_out() {
        let gw = gateway();
        let (a, mut rx_a) = connect(&gw, "u1");
        let (b, rx_b) = connect(&gw, "u2");
        let (c, mut rx_c) = connect(&gw, "u3");
        for conn in [a, b, c] {
            gw.join_workspace_channel(conn, "w1").unwrap();
        }
        // b's writer is gone: its queue is closed.
        drop(rx_b);

        let out = gw.fan_out(
            &Channel::workspace("w1"),
            &ServerMessage::ChatMessage(json!({"text": "hi"})),
            None,
        );
        assert_eq!(out, FanOut { members: 3, delivered: 2 });
        assert!(matches!(next(&mut rx_a), Some(ServerMessage::ChatMessage(_))));
        assert!(matches!(next(&mut rx_c), Some(ServerMessage::ChatMessage(_))));
    }

    #[test]
    fn full_queue_drops_only_for_that_connection() {
        let gw = Gateway::new(&Config {
            outbound_buffer: 1,
            ..Config::default()
        });
        let (slow, _rx_slow) = connect(&gw, "u1");
        let (fast, mut rx_fast) = connect(&gw, "u2");
        gw.join_workspace_channel(slow, "w1").unwrap();
        gw.join_workspace_channel(fast, "w1").unwrap();

        let msg = ServerMessage::ChatMessage(json!({"n": 1}));
        gw.fan_out(&Channel::workspace("w1"), &msg, None);
        next(&mut rx_fast).unwrap();
        let out = gw.fan_out(&Channel::workspace("w1"), &msg, None);
        assert_eq!(out.delivered, 1);
        assert!(next(&mut rx_fast).is_some());
    }

    #[test]
    fn urgent_escalation_emits_both_events_on_user_channel_only() {
        let gw = gateway();
        let (a, mut rx_a) = connect(&gw, "u1");
        let (b, mut rx_b) = connect(&gw, "u2");
        gw.join_user_channel(a, "u1").unwrap();
        gw.join_workspace_channel(a, "w1").unwrap();
        gw.join_user_channel(b, "u2").unwrap();
        gw.join_workspace_channel(b, "w1").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let payload = json!({"type": "deadline", "message": "due soon", "priority": "high"});
        assert!(gw.escalate_urgent("u1", &payload));

        let got = drain(&mut rx_a);
        assert_eq!(
            got,
            vec![
                ServerMessage::Notification(payload.clone()),
                ServerMessage::UrgentNotification(payload),
            ]
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn notify_escalates_only_urgent_payloads() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.join_user_channel(a, "u1").unwrap();
        drain(&mut rx);

        gw.notify("u1", &json!({"type": "task", "message": "assigned"}));
        assert_eq!(drain(&mut rx).len(), 1);

        gw.notify("u1", &json!({"type": "deadline", "message": "due"}));
        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(matches!(got[1], ServerMessage::UrgentNotification(_)));
    }

    #[test]
    fn typing_reaches_others_but_not_the_typist() {
        let gw = gateway();
        let (a, mut rx_a) = connect(&gw, "alice-id");
        let (b, mut rx_b) = connect(&gw, "bob-id");
        gw.join_workspace_channel(a, "w1").unwrap();
        gw.join_workspace_channel(b, "w1").unwrap();

        gw.handle_message(
            a,
            r#"{"event":"typing-chat","data":{"workspaceId":"w1","userName":"Alice"}}"#,
        );

        assert_eq!(
            next(&mut rx_b),
            Some(ServerMessage::UserTyping(UserTypingMsg {
                user_id: Some("alice-id".into()),
                user_name: "Alice".into(),
            }))
        );
        assert!(next(&mut rx_a).is_none());
    }

    #[test]
    fn typing_from_outside_the_workspace_is_refused() {
        let gw = gateway();
        let (member, mut rx_member) = connect(&gw, "bob-id");
        gw.join_workspace_channel(member, "w1").unwrap();
        let (anon, mut rx_anon) = anonymous(&gw);
        let (outsider, mut rx_outsider) = connect(&gw, "eve-id");

        assert!(gw.join_workspace_channel(anon, "w1").is_err());
        gw.handle_message(
            anon,
            r#"{"event":"typing-chat","data":{"workspaceId":"w1","userName":"Mallory"}}"#,
        );
        assert!(matches!(
            gw.relay_typing(outsider, "w1", "Eve"),
            Err(GatewayError::NotAMember { ref channel }) if channel == "workspace:w1"
        ));

        assert!(next(&mut rx_member).is_none());
        assert!(matches!(next(&mut rx_anon), Some(ServerMessage::Error(_))));
        assert!(next(&mut rx_outsider).is_none());
    }

    #[test]
    fn events_keep_per_connection_order() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.join_user_channel(a, "u1").unwrap();
        drain(&mut rx);

        for n in 0..5 {
            gw.broadcast_to_user("u1", &json!({"message": n}));
        }
        let order: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                ServerMessage::Notification(p) => p["message"].as_i64().unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn disconnect_is_idempotent_and_stops_delivery() {
        let gw = gateway();
        let mut events = gw.subscribe_events();
        let (a, _rx) = connect(&gw, "u1");
        gw.join_user_channel(a, "u1").unwrap();

        assert!(gw.disconnect(a));
        assert!(!gw.disconnect(a));
        assert!(!gw.broadcast_to_user("u1", &json!({"message": "late"})));

        assert!(matches!(events.try_recv(), Ok(GatewayEvent::Authenticated { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(GatewayEvent::Disconnected { user_id: Some(ref u), .. }) if u == "u1"
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn degraded_auth_is_published() {
        let gw = gateway();
        let mut events = gw.subscribe_events();
        gw.accept(AuthOutcome::Anonymous(DegradeReason::Expired));
        match events.try_recv() {
            Ok(GatewayEvent::AuthDegraded { reason, .. }) => assert_eq!(reason, "token expired"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sweep_evicts_silent_connections() {
        let gw = gateway();
        let (a, mut rx) = connect(&gw, "u1");
        gw.join_user_channel(a, "u1").unwrap();
        drain(&mut rx);

        // Zero bound: anything not touched within this instant is stale.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(gw.sweep(Duration::ZERO), 1);
        assert_eq!(gw.registry().len(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: 1001,
                reason: "heartbeat timeout"
            }
        );
    }

    #[test]
    fn sweep_pings_live_connections() {
        let gw = gateway();
        let (_a, mut rx) = connect(&gw, "u1");
        assert_eq!(gw.sweep(Duration::from_secs(60)), 0);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
    }
}
