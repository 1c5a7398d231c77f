use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::domain::{SessionId, UserId};
use shared::protocol::ServerEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Capacity of the presence transition channel. Transitions are tiny and the
/// broadcaster drains them promptly; lagging receivers just miss old entries.
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// One live transport connection for a user.
///
/// The sender handle is the bounded per-connection outbound queue owned by
/// the transport layer; everything the core wants a device to see goes
/// through it.
#[derive(Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub established_at: DateTime<Utc>,
    pub tx: mpsc::Sender<ServerEvent>,
}

/// Emitted when a user crosses the 0→1 or 1→0 live-session boundary.
#[derive(Debug, Clone)]
pub struct PresenceTransition {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// User → live sessions map with a reverse index for O(1) unregister.
///
/// All lookups are lock-per-key and never suspend; fan-out helpers snapshot
/// the session list before sending so no map lock is held across channel
/// operations.
pub struct ConnectionRegistry {
    sessions: DashMap<UserId, Vec<Session>>,
    index: DashMap<SessionId, UserId>,
    last_seen: DashMap<UserId, DateTime<Utc>>,
    transitions: broadcast::Sender<PresenceTransition>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
            last_seen: DashMap::new(),
            transitions,
        }
    }

    /// Adds a session for `user_id`. Always succeeds; a user may hold any
    /// number of concurrent sessions. Publishes an online transition when
    /// this is the user's first live session.
    pub fn register(&self, user_id: UserId, tx: mpsc::Sender<ServerEvent>) -> SessionId {
        let session = Session {
            session_id: SessionId::new(),
            user_id,
            established_at: Utc::now(),
            tx,
        };
        let session_id = session.session_id;
        self.index.insert(session_id, user_id);

        let went_online = {
            let mut entry = self.sessions.entry(user_id).or_default();
            entry.push(session);
            entry.len() == 1
        };
        if went_online {
            debug!(user_id = user_id.0, "user online");
            let _ = self.transitions.send(PresenceTransition {
                user_id,
                is_online: true,
                last_seen_at: self.last_seen(user_id),
            });
        }
        session_id
    }

    /// Removes a session and reports which user it belonged to. Unknown ids
    /// are a no-op (`None`), so disconnect paths may call this without
    /// checking whether eviction already ran. Publishes an offline transition
    /// and stamps `last_seen` when the user's final session goes away.
    pub fn unregister(&self, session_id: SessionId) -> Option<UserId> {
        let (_, user_id) = self.index.remove(&session_id)?;

        let went_offline = match self.sessions.get_mut(&user_id) {
            Some(mut entry) => {
                entry.retain(|s| s.session_id != session_id);
                entry.is_empty()
            }
            None => false,
        };
        if went_offline {
            self.sessions.remove_if(&user_id, |_, v| v.is_empty());
            let now = Utc::now();
            self.last_seen.insert(user_id, now);
            debug!(user_id = user_id.0, "user offline");
            let _ = self.transitions.send(PresenceTransition {
                user_id,
                is_online: false,
                last_seen_at: Some(now),
            });
        }
        Some(user_id)
    }

    /// Snapshot of the user's live sessions. Stale-tolerant: a session may
    /// disconnect between the snapshot and a send, which surfaces as a
    /// skipped channel, not an error.
    pub fn sessions_of(&self, user_id: UserId) -> Vec<Session> {
        self.sessions
            .get(&user_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions
            .get(&user_id)
            .map(|entry| !entry.is_empty())
            .unwrap_or(false)
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&user_id).map(|entry| *entry)
    }

    /// Presence transition feed for the broadcaster worker.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceTransition> {
        self.transitions.subscribe()
    }

    /// Best-effort send to every live session of `user_id`. Full or closed
    /// per-session queues are skipped (the slow or dead connection misses the
    /// event; reconnect re-syncs). Returns how many sessions accepted the
    /// event.
    pub fn deliver(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.deliver_filtered(user_id, event, |_| true)
    }

    /// Like [`deliver`](Self::deliver) but skips one session, used to avoid
    /// echoing an event back to the device that caused it.
    pub fn deliver_except(
        &self,
        user_id: UserId,
        except: SessionId,
        event: &ServerEvent,
    ) -> usize {
        self.deliver_filtered(user_id, event, |s| s.session_id != except)
    }

    fn deliver_filtered<F>(&self, user_id: UserId, event: &ServerEvent, keep: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let targets = self.sessions_of(user_id);
        let mut reached = 0;
        for session in targets.iter().filter(|s| keep(s)) {
            match session.tx.try_send(event.clone()) {
                Ok(()) => reached += 1,
                Err(err) => {
                    debug!(
                        user_id = user_id.0,
                        session_id = %session.session_id.0,
                        error = %err,
                        "session send skipped"
                    );
                }
            }
        }
        reached
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
