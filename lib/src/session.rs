//! Connection state machine and logical session tracking
//!
//! A connection moves through `Connecting → Initialized → SessionActive →
//! Closing → Closed`. Within it, any number of logical agent sessions may be
//! created; the newest one becomes the default target for calls that omit a
//! session id.

use crate::config::PromptPolicy;
use crate::error::{BridgeError, Result};
use crate::schema::SessionId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Initialized,
    SessionActive,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Initialized)
                | (Initialized, SessionActive)
                | (SessionActive, SessionActive)
                | (Connecting | Initialized | SessionActive, Closing)
                | (Closing, Closed)
        )
    }

    /// `Closing` or `Closed`
    pub fn is_shutting_down(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Initialized => "initialized",
            ConnectionState::SessionActive => "session_active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Guarded cell holding the current [`ConnectionState`]
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> ConnectionState {
        *self.lock()
    }

    /// Move to `next`, failing if the transition is not allowed
    ///
    /// A connection already shutting down reports `ConnectionClosed`.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        let mut state = self.lock();
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(if previous.is_shutting_down() {
                BridgeError::ConnectionClosed
            } else {
                BridgeError::InvalidRequest(format!(
                    "cannot move from {} to {}",
                    previous, next
                ))
            });
        }
        *state = next;
        tracing::debug!("Connection state {} -> {}", previous, next);
        Ok(previous)
    }

    /// Enter `Closing` from any live state. Returns `false` if already there.
    pub fn begin_closing(&self) -> bool {
        self.transition(ConnectionState::Closing).is_ok()
    }

    /// Enter the terminal `Closed` state
    pub fn finish(&self) {
        let mut state = self.lock();
        *state = ConnectionState::Closed;
    }
}

/// A running prompt turn; the session's turn slot is held until dropped
pub struct ActiveTurn {
    pub cancellation: CancellationToken,
    _slot: OwnedMutexGuard<()>,
}

/// One agent-side conversation context
#[derive(Debug)]
pub struct LogicalSession {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    mode_id: Mutex<Option<String>>,
    // Replaced on every cancel so a cancel never outlives the turns it hit
    cancellation: Mutex<CancellationToken>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl LogicalSession {
    pub fn new(id: SessionId, cwd: PathBuf, mode_id: Option<String>) -> Self {
        Self {
            id,
            cwd,
            created_at: Utc::now(),
            mode_id: Mutex::new(mode_id),
            cancellation: Mutex::new(CancellationToken::new()),
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn mode_id(&self) -> Option<String> {
        self.mode_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_mode_id(&self, mode_id: impl Into<String>) {
        *self.mode_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(mode_id.into());
    }

    fn current_token(&self) -> CancellationToken {
        self.cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a turn is currently running
    pub fn is_busy(&self) -> bool {
        self.turn.try_lock().is_err()
    }

    /// Claim the session's single turn slot
    ///
    /// With [`PromptPolicy::Queue`] this waits behind the running turn;
    /// a cancel issued while waiting fails the queued turn with `Cancelled`.
    /// With [`PromptPolicy::Reject`] an occupied slot fails with `Busy`.
    pub async fn begin_turn(&self, policy: PromptPolicy) -> Result<ActiveTurn> {
        let cancellation = self.current_token();

        let slot = match policy {
            PromptPolicy::Reject => self.turn.clone().try_lock_owned().map_err(|_| {
                BridgeError::Busy(format!("session {} already has a prompt in flight", self.id))
            })?,
            PromptPolicy::Queue => tokio::select! {
                slot = self.turn.clone().lock_owned() => slot,
                _ = cancellation.cancelled() => return Err(BridgeError::Cancelled),
            },
        };

        if cancellation.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        Ok(ActiveTurn {
            cancellation,
            _slot: slot,
        })
    }

    /// Cancel the running turn and every turn queued behind it
    pub fn cancel(&self) {
        let previous = {
            let mut token = self.cancellation.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        previous.cancel();
    }
}

#[derive(Default)]
struct TableState {
    sessions: HashMap<SessionId, Arc<LogicalSession>>,
    default: Option<SessionId>,
}

/// Logical sessions owned by one connection
#[derive(Default)]
pub struct SessionTable {
    state: Mutex<TableState>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new session and make it the default target
    pub fn register(&self, session: LogicalSession) -> Arc<LogicalSession> {
        let session = Arc::new(session);
        let mut state = self.lock();
        state.default = Some(session.id.clone());
        state.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up `id`, or the default session when `id` is `None`
    pub fn resolve(&self, id: Option<&SessionId>) -> Result<Arc<LogicalSession>> {
        let state = self.lock();
        let id = match id.or(state.default.as_ref()) {
            Some(id) => id,
            None => {
                return Err(BridgeError::InvalidParams(
                    "no session_id given and no session exists".to_string(),
                ))
            }
        };

        state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::InvalidParams(format!("unknown session: {}", id)))
    }

    pub fn default_session(&self) -> Option<SessionId> {
        self.lock().default.clone()
    }

    /// Cancel every turn on every session; used during teardown
    pub fn cancel_all(&self) {
        let sessions: Vec<_> = self.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
