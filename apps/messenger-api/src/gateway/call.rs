//! Call session state machine: `ringing → active → ended`.

use std::fmt;

use chrono::{DateTime, Utc};
use messenger_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call not found")]
    NotFound,
    #[error("not a participant of this call")]
    NotParticipant,
    #[error("only the callee can answer this call")]
    NotCallee,
    #[error("call is {0}")]
    InvalidState(CallStatus),
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    started: Instant,
    ended_at: Option<Instant>,
}

impl CallSession {
    pub fn new(caller_id: impl Into<String>, callee_id: impl Into<String>) -> Self {
        Self {
            id: prefixed_ulid(prefix::CALL),
            caller_id: caller_id.into(),
            callee_id: callee_id.into(),
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            started: Instant::now(),
            ended_at: None,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.caller_id == user_id {
            Some(&self.callee_id)
        } else if self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == CallStatus::Ended
    }

    /// Time since the call was placed.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.started)
    }

    /// Time since the call ended, if it has.
    pub fn ended_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.ended_at.map(|at| now.saturating_duration_since(at))
    }

    /// `ringing → active`, callee only.
    pub fn accept(&mut self, user_id: &str) -> Result<(), CallError> {
        if self.callee_id != user_id {
            return Err(if self.caller_id == user_id {
                CallError::NotCallee
            } else {
                CallError::NotParticipant
            });
        }
        if self.status != CallStatus::Ringing {
            return Err(CallError::InvalidState(self.status));
        }
        self.status = CallStatus::Active;
        Ok(())
    }

    /// `ringing → ended` by the callee declining. Returns the caller id.
    pub fn reject(&mut self, user_id: &str) -> Result<&str, CallError> {
        if self.callee_id != user_id {
            return Err(if self.caller_id == user_id {
                CallError::NotCallee
            } else {
                CallError::NotParticipant
            });
        }
        if self.status != CallStatus::Ringing {
            return Err(CallError::InvalidState(self.status));
        }
        self.end();
        Ok(&self.caller_id)
    }

    /// Either party ends a ringing or active call. Returns the other party.
    pub fn hang_up(&mut self, user_id: &str) -> Result<&str, CallError> {
        if !self.is_participant(user_id) {
            return Err(CallError::NotParticipant);
        }
        if self.is_ended() {
            return Err(CallError::InvalidState(self.status));
        }
        self.end();
        self.peer_of(user_id).ok_or(CallError::NotParticipant)
    }

    /// Who a signaling payload from `user_id` goes to. Any non-ended state
    /// relays; negotiation phase is not checked.
    pub fn relay_target(&self, user_id: &str) -> Result<&str, CallError> {
        let peer = self.peer_of(user_id).ok_or(CallError::NotParticipant)?;
        if self.is_ended() {
            return Err(CallError::InvalidState(self.status));
        }
        Ok(peer)
    }

    /// Force the call to `ended`. Returns false if it already was.
    pub fn end(&mut self) -> bool {
        self.end_at(Instant::now())
    }

    pub fn end_at(&mut self, at: Instant) -> bool {
        if self.is_ended() {
            return false;
        }
        self.status = CallStatus::Ended;
        self.ended_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut call = CallSession::new("a", "b");
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.status, CallStatus::Ringing);

        call.accept("b").unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.relay_target("a").unwrap(), "b");

        assert_eq!(call.hang_up("a").unwrap(), "b");
        assert!(call.is_ended());
        assert!(call.ended_for(Instant::now()).is_some());
    }

    #[test]
    fn only_callee_can_accept() {
        let mut call = CallSession::new("a", "b");
        assert_eq!(call.accept("a"), Err(CallError::NotCallee));
        assert_eq!(call.accept("mallory"), Err(CallError::NotParticipant));
        assert_eq!(call.status, CallStatus::Ringing);

        call.accept("b").unwrap();
        assert_eq!(call.accept("b"), Err(CallError::InvalidState(CallStatus::Active)));
    }

    #[test]
    fn reject_only_while_ringing() {
        let mut call = CallSession::new("a", "b");
        assert_eq!(call.reject("a"), Err(CallError::NotCallee));
        assert_eq!(call.reject("b").unwrap(), "a");
        assert!(call.is_ended());

        let mut active = CallSession::new("a", "b");
        active.accept("b").unwrap();
        assert_eq!(active.reject("b"), Err(CallError::InvalidState(CallStatus::Active)));
    }

    #[test]
    fn hangup_while_ringing_by_caller() {
        let mut call = CallSession::new("a", "b");
        assert_eq!(call.hang_up("a").unwrap(), "b");
        assert_eq!(call.hang_up("b"), Err(CallError::InvalidState(CallStatus::Ended)));
    }

    #[test]
    fn relay_ignores_phase_but_not_end() {
        let mut call = CallSession::new("a", "b");
        // ICE before any offer still relays while ringing.
        assert_eq!(call.relay_target("a").unwrap(), "b");
        assert_eq!(call.relay_target("b").unwrap(), "a");
        assert_eq!(call.relay_target("c"), Err(CallError::NotParticipant));

        assert!(call.end());
        assert!(!call.end());
        assert_eq!(call.relay_target("a"), Err(CallError::InvalidState(CallStatus::Ended)));
    }

    #[test]
    fn error_messages() {
        assert_eq!(CallError::NotFound.to_string(), "call not found");
        assert_eq!(CallError::InvalidState(CallStatus::Ended).to_string(), "call is ended");
    }
}
