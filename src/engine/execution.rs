// SPDX-License-Identifier: Apache-2.0

//! Per-transaction execution slot
//!
//! A slot holds at most one in-flight execution. The dispatch worker parks
//! its outcome here and the next poll takes it out, returning the slot to
//! idle. The HTTP side never touches the connection while the slot is busy.

use std::time::Instant;

use parking_lot::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{AsyncStatus, QueryResult};

/// How an execution ended, as recorded by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(QueryResult),
    /// The statement failed on the server; the message is the server error.
    Failed(String),
    Cancelled(String),
    ConnectionLost(String),
}

impl ExecutionOutcome {
    pub fn from_result(result: EngineResult<QueryResult>) -> Self {
        match result {
            Ok(result) => Self::Completed(result),
            Err(EngineError::Cancelled) => Self::Cancelled(EngineError::Cancelled.to_string()),
            Err(e @ (EngineError::ConnectionLost { .. } | EngineError::SshTunnelLost { .. })) => {
                Self::ConnectionLost(e.to_string())
            }
            Err(EngineError::ExecutionError { message }) => Self::Failed(message),
            Err(other) => Self::Failed(other.to_string()),
        }
    }

    pub fn async_status(&self) -> AsyncStatus {
        match self {
            Self::Completed(_) | Self::Failed(_) => AsyncStatus::Ok,
            Self::Cancelled(_) => AsyncStatus::ExecutionAborted,
            Self::ConnectionLost(_) => AsyncStatus::NotConnected,
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Running { worker_id: u64, started_at: Instant },
    Finished(ExecutionOutcome),
}

/// What a poller sees when it looks at the slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotPoll {
    /// Nothing was dispatched since the last poll.
    Idle,
    Running { worker_id: u64, elapsed_ms: u128 },
    Finished(ExecutionOutcome),
}

#[derive(Debug)]
pub struct ExecutionSlot {
    state: Mutex<SlotState>,
}

impl ExecutionSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Running { .. })
    }

    /// Worker currently owning the slot, if any.
    pub fn running_worker(&self) -> Option<u64> {
        match *self.state.lock() {
            SlotState::Running { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }

    /// Claims the slot for `worker_id`. An unpolled outcome of the previous
    /// execution is discarded.
    pub fn reserve(&self, worker_id: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Running { .. }) {
            return Err(EngineError::ExecutionInProgress);
        }
        *state = SlotState::Running {
            worker_id,
            started_at: Instant::now(),
        };
        Ok(())
    }

    /// Records the outcome of `worker_id`. Returns false when the slot is no
    /// longer owned by that worker.
    pub fn complete(&self, worker_id: u64, outcome: ExecutionOutcome) -> bool {
        let mut state = self.state.lock();
        match *state {
            SlotState::Running { worker_id: owner, .. } if owner == worker_id => {
                *state = SlotState::Finished(outcome);
                true
            }
            _ => false,
        }
    }

    /// Releases a reservation whose worker never started.
    pub fn abandon(&self, worker_id: u64) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Running { worker_id: owner, .. } if owner == worker_id) {
            *state = SlotState::Idle;
        }
    }

    /// Takes a finished outcome out of the slot. A running slot is left
    /// untouched.
    pub fn poll_take(&self) -> SlotPoll {
        let mut state = self.state.lock();
        if let SlotState::Running {
            worker_id,
            started_at,
        } = &*state
        {
            return SlotPoll::Running {
                worker_id: *worker_id,
                elapsed_ms: started_at.elapsed().as_millis(),
            };
        }
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Finished(outcome) => SlotPoll::Finished(outcome),
            _ => SlotPoll::Idle,
        }
    }
}

impl Default for ExecutionSlot {
    fn default() -> Self {
        Self::new()
    }
}
