//! Call-signaling hub: one connection per user, plus the call table.
//!
//! Independent of the chat hub. SDP and ICE payloads are relayed verbatim
//! between the two participants of a call and never inspected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{self, Instant};

use super::call::{CallError, CallSession, CallStatus};
use super::connection::Connection;
use super::events::{parse_call_event, CallClientEvent, CallServerEvent};
use super::{Hub, HubSettings, CLOSE_GOING_AWAY, CLOSE_SUPERSEDED, CLOSE_TRY_AGAIN_LATER};
use crate::error::HubError;

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub connection: HubSettings,
    /// Unanswered calls are ended after this long.
    pub ring_timeout: Duration,
    /// How long ended calls stay in the table before eviction.
    pub ended_call_retention: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            connection: HubSettings::default(),
            ring_timeout: Duration::from_secs(45),
            ended_call_retention: Duration::from_secs(300),
        }
    }
}

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub evicted: usize,
}

pub struct CallHub {
    /// user_id → the user's single live connection; the newest wins.
    clients: DashMap<String, Arc<Connection>>,
    /// Serializes the cap check with the insert it guards.
    admission: Mutex<()>,
    calls: Mutex<HashMap<String, CallSession>>,
    accepting: AtomicBool,
    settings: CallSettings,
}

impl CallHub {
    pub fn new(settings: CallSettings) -> Self {
        Self {
            clients: DashMap::new(),
            admission: Mutex::new(()),
            calls: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            settings,
        }
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of a call, ended ones included until evicted.
    pub fn call(&self, call_id: &str) -> Option<CallSession> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn send_to(&self, user_id: &str, event: &CallServerEvent) -> bool {
        let conn = self.clients.get(user_id).map(|entry| entry.value().clone());
        match conn {
            Some(conn) => conn.send_event(event),
            None => false,
        }
    }

    fn start_call(&self, conn: &Connection, peer_id: Option<String>) -> Result<(), HubError> {
        let user_id = conn.user_id();
        let peer_id = required(peer_id, "peer_id")?;
        if peer_id == user_id {
            return Err(HubError::validation("cannot call yourself"));
        }
        if !self.is_connected(&peer_id) {
            return Err(HubError::UserOffline);
        }

        let call_id = {
            let mut calls = self.calls.lock();
            if is_busy(&calls, user_id) {
                return Err(HubError::AlreadyInCall);
            }
            if is_busy(&calls, &peer_id) {
                return Err(HubError::UserBusy);
            }
            let call = CallSession::new(user_id, peer_id.as_str());
            let call_id = call.id.clone();
            calls.insert(call_id.clone(), call);
            call_id
        };

        let rang = self.send_to(
            &peer_id,
            &CallServerEvent::IncomingCall {
                call_id: call_id.clone(),
                from_user_id: user_id.to_string(),
            },
        );
        if !rang {
            // Peer vanished between the check and the ring.
            self.calls.lock().remove(&call_id);
            return Err(HubError::UserOffline);
        }

        tracing::info!(call_id = %call_id, caller = %user_id, callee = %peer_id, "call ringing");
        conn.send_event(&CallServerEvent::CallStarted { call_id, peer_id });
        Ok(())
    }

    /// Apply a transition to a call under the table lock; returns whatever
    /// the transition yields, owned.
    fn transition<T>(
        &self,
        call_id: Option<String>,
        apply: impl FnOnce(&mut CallSession) -> Result<T, CallError>,
    ) -> Result<(String, T), HubError> {
        let call_id = required(call_id, "call_id")?;
        let mut calls = self.calls.lock();
        let call = calls.get_mut(&call_id).ok_or(CallError::NotFound)?;
        let out = apply(call)?;
        Ok((call_id, out))
    }

    fn relay(
        &self,
        conn: &Connection,
        call_id: Option<String>,
        build: impl FnOnce(String, String) -> CallServerEvent,
    ) -> Result<(), HubError> {
        let user_id = conn.user_id();
        let (call_id, peer) = self.transition(call_id, |call| call.relay_target(user_id).map(str::to_string))?;
        let event = build(call_id.clone(), user_id.to_string());
        if !self.send_to(&peer, &event) {
            tracing::debug!(call_id = %call_id, peer = %peer, "relay target not connected");
        }
        Ok(())
    }

    fn dispatch(&self, conn: &Connection, event: CallClientEvent) -> Result<(), HubError> {
        let user_id = conn.user_id();

        match event {
            CallClientEvent::StartCall { peer_id } => self.start_call(conn, peer_id)?,

            CallClientEvent::AcceptCall { call_id } => {
                let (call_id, caller) = self.transition(call_id, |call| {
                    call.accept(user_id)?;
                    Ok(call.caller_id.clone())
                })?;
                tracing::info!(call_id = %call_id, "call accepted");
                let event = CallServerEvent::CallAccepted { call_id };
                self.send_to(&caller, &event);
                conn.send_event(&event);
            }

            CallClientEvent::RejectCall { call_id } => {
                let (call_id, caller) = self.transition(call_id, |call| call.reject(user_id).map(str::to_string))?;
                tracing::info!(call_id = %call_id, "call rejected");
                self.send_to(&caller, &CallServerEvent::CallRejected { call_id });
            }

            CallClientEvent::Hangup { call_id } => {
                let (call_id, peer) = self.transition(call_id, |call| call.hang_up(user_id).map(str::to_string))?;
                tracing::info!(call_id = %call_id, user_id = %user_id, "call hung up");
                self.send_to(
                    &peer,
                    &CallServerEvent::Hangup {
                        call_id,
                        from_user_id: Some(user_id.to_string()),
                        reason: None,
                    },
                );
            }

            CallClientEvent::Offer { call_id, sdp } => {
                let sdp = required_value(sdp, "sdp")?;
                self.relay(conn, call_id, |call_id, from_user_id| CallServerEvent::Offer {
                    call_id,
                    from_user_id,
                    sdp,
                })?;
            }

            CallClientEvent::Answer { call_id, sdp } => {
                let sdp = required_value(sdp, "sdp")?;
                self.relay(conn, call_id, |call_id, from_user_id| CallServerEvent::Answer {
                    call_id,
                    from_user_id,
                    sdp,
                })?;
            }

            CallClientEvent::Ice { call_id, candidate } => {
                let candidate = required_value(candidate, "candidate")?;
                self.relay(conn, call_id, |call_id, from_user_id| CallServerEvent::Ice {
                    call_id,
                    from_user_id,
                    candidate,
                })?;
            }
        }

        Ok(())
    }

    /// End calls that rang too long and forget calls that ended long ago.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut timed_out = Vec::new();
        let evicted = {
            let mut calls = self.calls.lock();
            for call in calls.values_mut() {
                if call.status == CallStatus::Ringing
                    && call.age(now) >= self.settings.ring_timeout
                    && call.end_at(now)
                {
                    timed_out.push((call.id.clone(), call.caller_id.clone(), call.callee_id.clone()));
                }
            }

            let before = calls.len();
            let retention = self.settings.ended_call_retention;
            calls.retain(|_, call| call.ended_for(now).map_or(true, |ended| ended < retention));
            before - calls.len()
        };

        for (call_id, caller, callee) in &timed_out {
            tracing::info!(call_id = %call_id, "unanswered call timed out");
            let event = CallServerEvent::Hangup {
                call_id: call_id.clone(),
                from_user_id: None,
                reason: Some("timeout".to_string()),
            };
            self.send_to(caller, &event);
            self.send_to(callee, &event);
        }

        SweepReport {
            timed_out: timed_out.len(),
            evicted,
        }
    }

    /// Stop admitting, end every call, close every connection, and wait for
    /// their pumps.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let conns: Vec<Arc<Connection>> = self.clients.iter().map(|entry| entry.value().clone()).collect();
        self.clients.clear();
        {
            let mut calls = self.calls.lock();
            for call in calls.values_mut() {
                call.end();
            }
        }
        tracing::info!(connections = conns.len(), "call hub shutting down");

        for conn in &conns {
            conn.close_with(CLOSE_GOING_AWAY, "server shutting down");
        }
        let pumps = join_all(conns.iter().map(|c| c.wait_done()));
        if time::timeout(self.settings.connection.write_wait * 2, pumps).await.is_err() {
            tracing::warn!("timed out waiting for call connections to finish");
        }
    }

    fn refuse(&self, conn: &Connection, err: HubError) -> Result<(), HubError> {
        let code = match err {
            HubError::ShuttingDown => CLOSE_GOING_AWAY,
            _ => CLOSE_TRY_AGAIN_LATER,
        };
        tracing::warn!(%err, user_id = %conn.user_id(), "call connection rejected");
        conn.close_with(code, &err.to_string());
        Err(err)
    }
}

#[async_trait]
impl Hub for CallHub {
    fn settings(&self) -> &HubSettings {
        &self.settings.connection
    }

    async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        if !self.accepting.load(Ordering::Acquire) {
            return self.refuse(&conn, HubError::ShuttingDown);
        }
        let previous = {
            let guard = self.admission.lock();
            // A replacement for an existing user never counts against the cap.
            if !self.clients.contains_key(conn.user_id())
                && self.clients.len() >= self.settings.connection.max_connections
            {
                drop(guard);
                return self.refuse(&conn, HubError::AtCapacity);
            }
            self.clients.insert(conn.user_id().to_string(), conn.clone())
        };

        if let Some(previous) = previous {
            tracing::info!(
                user_id = %conn.user_id(),
                old_conn = %previous.id(),
                new_conn = %conn.id(),
                "call connection superseded"
            );
            previous.close_with(CLOSE_SUPERSEDED, "superseded");
        }

        // Lost a race with shutdown.
        if !self.accepting.load(Ordering::Acquire) {
            self.clients.remove_if(conn.user_id(), |_, current| current.id() == conn.id());
            return self.refuse(&conn, HubError::ShuttingDown);
        }
        Ok(())
    }

    async fn unregister(&self, conn: &Arc<Connection>) {
        let user_id = conn.user_id();
        // A superseded connection must not evict its replacement.
        if self
            .clients
            .remove_if(user_id, |_, current| current.id() == conn.id())
            .is_none()
        {
            return;
        }

        let ended: Vec<(String, String)> = {
            let mut calls = self.calls.lock();
            calls
                .values_mut()
                .filter(|call| call.is_participant(user_id))
                .filter_map(|call| {
                    let peer = call.peer_of(user_id)?.to_string();
                    call.end().then(|| (call.id.clone(), peer))
                })
                .collect()
        };

        for (call_id, peer) in ended {
            tracing::info!(call_id = %call_id, user_id = %user_id, "call ended by disconnect");
            self.send_to(
                &peer,
                &CallServerEvent::Hangup {
                    call_id,
                    from_user_id: Some(user_id.to_string()),
                    reason: Some("peer_disconnected".to_string()),
                },
            );
        }
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, text: &str) {
        let result = parse_call_event(text).and_then(|event| self.dispatch(conn, event));
        if let Err(err) = result {
            tracing::debug!(%err, conn_id = %conn.id(), user_id = %conn.user_id(), "call event rejected");
            conn.send_event(&CallServerEvent::Error {
                message: err.to_string(),
            });
        }
    }
}

fn is_busy(calls: &HashMap<String, CallSession>, user_id: &str) -> bool {
    calls.values().any(|call| !call.is_ended() && call.is_participant(user_id))
}

fn required(value: Option<String>, field: &str) -> Result<String, HubError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HubError::validation(format!("{field} is required")))
}

fn required_value(value: Option<Value>, field: &str) -> Result<Value, HubError> {
    value
        .filter(|v| !v.is_null())
        .ok_or_else(|| HubError::validation(format!("{field} is required")))
}
