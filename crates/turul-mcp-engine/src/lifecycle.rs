//! Connection lifecycle and admission control
//!
//! ```text
//! Uninitialized -> Initializing -> Operational -> ShuttingDown -> Closed
//! ```
//!
//! Any phase may drop straight to `Closed` when the transport goes away.
//! Before `Operational` only the handshake and `ping` get through.

use serde::Serialize;
use std::fmt;
use tracing::debug;
use turul_mcp_protocol::{Role, methods};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Uninitialized,
    Initializing,
    Operational,
    ShuttingDown,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Uninitialized => write!(f, "uninitialized"),
            Phase::Initializing => write!(f, "initializing"),
            Phase::Operational => write!(f, "operational"),
            Phase::ShuttingDown => write!(f, "shutting_down"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Responses are not admission-checked: they answer requests that were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    role: Role,
    phase: Phase,
    initialize_answered: bool,
    history: Vec<Phase>,
}

impl Lifecycle {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Uninitialized,
            initialize_answered: false,
            history: vec![Phase::Uninitialized],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, starting with `Uninitialized`
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn is_operational(&self) -> bool {
        self.phase == Phase::Operational
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Decide whether a message may cross the connection in `direction`.
    ///
    /// Returns the phase the message moves the connection into, if any. The
    /// transition itself is applied separately with [`Lifecycle::advance`] so
    /// callers can finish validating the payload first.
    pub fn admit(&self, direction: Direction, kind: MessageKind, method: &str) -> EngineResult<Option<Phase>> {
        if self.phase == Phase::Closed {
            return Err(EngineError::ConnectionClosed);
        }

        match (kind, method) {
            (MessageKind::Request, methods::INITIALIZE) => {
                // Only the client opens the handshake
                let sender = self.sender(direction);
                if sender != Role::Client {
                    return Err(EngineError::violation(format!(
                        "{} may not send initialize",
                        sender
                    )));
                }
                if self.phase != Phase::Uninitialized {
                    return Err(EngineError::violation(format!(
                        "initialize not allowed while {}",
                        self.phase
                    )));
                }
                Ok(Some(Phase::Initializing))
            }
            (MessageKind::Request, methods::PING) => Ok(None),
            (MessageKind::Notification, methods::notifications::INITIALIZED) => {
                let sender = self.sender(direction);
                if sender != Role::Client {
                    return Err(EngineError::violation(format!(
                        "{} may not send notifications/initialized",
                        sender
                    )));
                }
                if self.phase != Phase::Initializing || !self.initialize_answered {
                    return Err(EngineError::violation(format!(
                        "notifications/initialized out of order while {}",
                        self.phase
                    )));
                }
                Ok(Some(Phase::Operational))
            }
            _ => match self.phase {
                Phase::Uninitialized | Phase::Initializing => Err(EngineError::NotInitialized {
                    method: method.to_string(),
                }),
                Phase::ShuttingDown if kind == MessageKind::Request => Err(EngineError::ShuttingDown),
                _ => Ok(None),
            },
        }
    }

    /// Batches are only accepted once the handshake is complete
    pub fn admit_batch(&self) -> EngineResult<()> {
        match self.phase {
            Phase::Operational | Phase::ShuttingDown => Ok(()),
            Phase::Closed => Err(EngineError::ConnectionClosed),
            phase => Err(EngineError::violation(format!(
                "batches are not allowed while {}",
                phase
            ))),
        }
    }

    /// The initialize result was sent (server) or received (client)
    pub fn record_initialize_response(&mut self) -> EngineResult<()> {
        if self.phase != Phase::Initializing || self.initialize_answered {
            return Err(EngineError::violation(format!(
                "unexpected initialize response while {}",
                self.phase
            )));
        }
        self.initialize_answered = true;
        Ok(())
    }

    /// Move along one of the lifecycle edges
    pub fn advance(&mut self, to: Phase) -> EngineResult<PhaseTransition> {
        let legal = matches!(
            (self.phase, to),
            (Phase::Uninitialized, Phase::Initializing)
                | (Phase::Initializing, Phase::Operational)
                | (Phase::Operational, Phase::ShuttingDown)
        ) || (to == Phase::Closed && self.phase != Phase::Closed);

        if !legal {
            return Err(EngineError::violation(format!(
                "illegal transition {} -> {}",
                self.phase, to
            )));
        }
        Ok(self.transition(to))
    }

    /// Operational -> ShuttingDown. `None` from any other phase.
    pub fn begin_shutdown(&mut self) -> Option<PhaseTransition> {
        (self.phase == Phase::Operational).then(|| self.transition(Phase::ShuttingDown))
    }

    /// Any phase -> Closed. `None` if already closed.
    pub fn close(&mut self) -> Option<PhaseTransition> {
        (self.phase != Phase::Closed).then(|| self.transition(Phase::Closed))
    }

    fn transition(&mut self, to: Phase) -> PhaseTransition {
        let from = self.phase;
        debug!(role = %self.role, from = %from, to = %to, "Lifecycle phase transition: {} -> {}", from, to);
        self.phase = to;
        self.history.push(to);
        PhaseTransition { from, to }
    }

    fn sender(&self, direction: Direction) -> Role {
        match direction {
            Direction::Outbound => self.role,
            Direction::Inbound => self.role.peer(),
        }
    }
}
