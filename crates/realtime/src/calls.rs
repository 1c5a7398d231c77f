use crate::registry::ConnectionRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::domain::{CallId, CallKind, UserId};
use shared::protocol::ServerEvent;
use std::sync::Arc;
use tracing::debug;

/// Transient signaling correlation. Never persisted; call history belongs to
/// the store layer above this relay.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub target_id: UserId,
    pub kind: CallKind,
    pub started_at: DateTime<Utc>,
}

/// Fire-and-forget forwarder for call signaling. Payloads are relayed
/// verbatim to every live session of the target, tagged with the sender's
/// id; reliability belongs to the media negotiation layer above.
pub struct CallRelay {
    registry: Arc<ConnectionRegistry>,
    active: DashMap<CallId, CallSession>,
}

impl CallRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            active: DashMap::new(),
        }
    }

    /// Starts signaling. A fully offline target is answered with
    /// `call_unreachable` so the caller can stop ringing immediately.
    pub fn offer(
        &self,
        caller_id: UserId,
        call_id: CallId,
        target_id: UserId,
        kind: CallKind,
        sdp: String,
    ) {
        if !self.registry.is_online(target_id) {
            debug!(
                call_id = %call_id.0,
                target_id = target_id.0,
                "call target offline, bouncing offer"
            );
            self.registry.deliver(
                caller_id,
                &ServerEvent::CallUnreachable {
                    call_id,
                    target_user_id: target_id,
                },
            );
            return;
        }
        self.active.insert(
            call_id,
            CallSession {
                call_id,
                caller_id,
                target_id,
                kind,
                started_at: Utc::now(),
            },
        );
        self.registry.deliver(
            target_id,
            &ServerEvent::CallOffer {
                call_id,
                from_user_id: caller_id,
                kind,
                sdp,
            },
        );
    }

    pub fn answer(&self, from_user_id: UserId, call_id: CallId, target_id: UserId, sdp: String) {
        self.registry.deliver(
            target_id,
            &ServerEvent::CallAnswer {
                call_id,
                from_user_id,
                sdp,
            },
        );
    }

    pub fn ice_candidate(
        &self,
        from_user_id: UserId,
        call_id: CallId,
        target_id: UserId,
        candidate: String,
    ) {
        self.registry.deliver(
            target_id,
            &ServerEvent::CallIceCandidate {
                call_id,
                from_user_id,
                candidate,
            },
        );
    }

    pub fn hangup(&self, from_user_id: UserId, call_id: CallId, target_id: UserId) {
        self.active.remove(&call_id);
        self.registry.deliver(
            target_id,
            &ServerEvent::CallHangup {
                call_id,
                from_user_id,
            },
        );
    }

    /// Ends every call the user is part of, notifying the peer. Called when
    /// a user's last session disappears without a hangup.
    pub fn prune_for(&self, user_id: UserId) {
        let stale: Vec<CallSession> = self
            .active
            .iter()
            .filter(|entry| entry.caller_id == user_id || entry.target_id == user_id)
            .map(|entry| entry.clone())
            .collect();
        for call in stale {
            if self.active.remove(&call.call_id).is_none() {
                continue;
            }
            let peer = if call.caller_id == user_id {
                call.target_id
            } else {
                call.caller_id
            };
            debug!(call_id = %call.call_id.0, user_id = user_id.0, "pruning call after disconnect");
            self.registry.deliver(
                peer,
                &ServerEvent::CallHangup {
                    call_id: call.call_id,
                    from_user_id: user_id,
                },
            );
        }
    }

    pub fn active_call(&self, call_id: CallId) -> Option<CallSession> {
        self.active.get(&call_id).map(|entry| entry.clone())
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
