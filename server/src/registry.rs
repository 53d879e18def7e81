//! Connection registry.
//!
//! Two indices kept consistent with each other:
//! - `connections`: connection id → identity, joined channels, liveness, outbound queue
//! - `channels`: channel → member connection ids (entry removed when it empties)
//!
//! Lock order is always connection entry first, then channel entry. Nothing
//! takes a connection lock while holding a channel lock, so the two maps
//! cannot deadlock against each other.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::types::Channel;

/// Opaque connection identifier, assigned at upgrade time.
pub type ConnectionId = Uuid;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized `ServerMessage`, shared across every target of a fan-out.
    Text(Arc<str>),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Why a single target of a fan-out did not get its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Outbound queue full (slow consumer). The frame is dropped;
    /// `dropped` is the connection's running total.
    Full { dropped: u64 },
    /// Writer task gone.
    Closed,
    /// Unregistered between the membership snapshot and the send.
    Gone,
}

/// Per-connection state. Only the registry mutates it.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    /// Bound identity; `None` for anonymous connections.
    pub user_id: Option<String>,
    /// Id of the joined `user:` channel, if any.
    pub user_channel: Option<String>,
    /// Id of the joined `workspace:` channel, if any.
    pub workspace: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: DateTime<Utc>,
    /// Frames dropped because the queue was full.
    dropped: AtomicU64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionEntry {
    fn new(id: ConnectionId, user_id: Option<String>, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            user_channel: None,
            workspace: None,
            connected_at: now,
            last_ping: None,
            last_pong: now,
            dropped: AtomicU64::new(0),
            tx,
        }
    }

    fn slot_mut(&mut self, channel: &Channel) -> &mut Option<String> {
        match channel {
            Channel::User(_) => &mut self.user_channel,
            Channel::Workspace(_) => &mut self.workspace,
        }
    }

    fn joined(&self) -> impl Iterator<Item = Channel> + '_ {
        let user = self.user_channel.iter().map(|id| Channel::user(id.as_str()));
        let workspace = self.workspace.iter().map(|id| Channel::workspace(id.as_str()));
        user.chain(workspace)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channels: DashMap<Channel, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. Returns `false` if the id is already registered.
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> bool {
        match self.connections.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry::new(id, user_id, tx));
                true
            }
        }
    }

    /// Remove a connection and its channel memberships.
    ///
    /// Only the first call for a given id does anything; later calls return `None`.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(&id)?;
        for channel in entry.joined() {
            self.detach(&channel, id);
        }
        debug!(conn_id = %id, remaining = self.connections.len(), "connection unregistered");
        Some(entry)
    }

    /// Bound identity of a live connection.
    pub fn identity(&self, id: ConnectionId) -> Result<Option<String>, GatewayError> {
        self.connections
            .get(&id)
            .map(|entry| entry.user_id.clone())
            .ok_or(GatewayError::UnknownConnection(id))
    }

    /// Join `channel`, replacing the connection's previous channel of the same kind.
    /// Returns the channel that was left, if any.
    pub fn join(&self, id: ConnectionId, channel: Channel) -> Result<Option<Channel>, GatewayError> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or(GatewayError::UnknownConnection(id))?;

        let previous = entry
            .slot_mut(&channel)
            .replace(channel.id().to_owned())
            .filter(|prev| prev != channel.id())
            .map(|prev| same_kind(&channel, prev));

        if let Some(prev) = &previous {
            self.detach(prev, id);
        }
        self.channels.entry(channel).or_default().insert(id);
        drop(entry);

        Ok(previous)
    }

    /// Leave `channel`. Returns `false` if the connection was not a member.
    pub fn leave(&self, id: ConnectionId, channel: &Channel) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let slot = entry.slot_mut(channel);
        if slot.as_deref() != Some(channel.id()) {
            return false;
        }
        *slot = None;
        self.detach(channel, id);
        true
    }

    /// Snapshot of the members of `channel`.
    pub fn members_of(&self, channel: &Channel) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, id: ConnectionId, channel: &Channel) -> bool {
        self.channels
            .get(channel)
            .map(|set| set.contains(&id))
            .unwrap_or(false)
    }

    /// Queue a frame for one connection without waiting.
    pub fn send(&self, id: ConnectionId, frame: Outbound) -> Result<(), SendFailure> {
        let entry = self.connections.get(&id).ok_or(SendFailure::Gone)?;
        match entry.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                Err(SendFailure::Full { dropped })
            }
            Err(TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Record a pong (or any inbound activity).
    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.last_pong = Utc::now();
        }
    }

    /// Queue a ping on every connection. Returns how many were queued.
    pub fn ping_all(&self) -> usize {
        let now = Utc::now();
        let mut queued = 0;
        for mut entry in self.connections.iter_mut() {
            entry.last_ping = Some(now);
            if entry.tx.try_send(Outbound::Ping).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Connections whose last pong is older than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Utc::now();
        self.connections
            .iter()
            .filter(|entry| (now - entry.last_pong).to_std().unwrap_or_default() > timeout)
            .map(|entry| entry.id)
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of channels with at least one member.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn detach(&self, channel: &Channel, id: ConnectionId) {
        let now_empty = {
            let Some(mut members) = self.channels.get_mut(channel) else {
                return;
            };
            members.remove(&id);
            members.is_empty()
        };
        if now_empty {
            self.channels.remove_if(channel, |_, members| members.is_empty());
        }
    }
}

fn same_kind(channel: &Channel, id: String) -> Channel {
    match channel {
        Channel::User(_) => Channel::User(id),
        Channel::Workspace(_) => Channel::Workspace(id),
    }
}
