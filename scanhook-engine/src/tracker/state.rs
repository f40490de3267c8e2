// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Execution trace lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    Start,
    Succeed,
    Fail,
    Cancel,
}

impl ExecutionEvent {
    /// Event that leads into the given terminal status.
    pub fn for_terminal(status: ExecutionStatus) -> Option<ExecutionEvent> {
        match status {
            ExecutionStatus::Completed => Some(ExecutionEvent::Succeed),
            ExecutionStatus::Failed => Some(ExecutionEvent::Fail),
            ExecutionStatus::Cancelled => Some(ExecutionEvent::Cancel),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid transition: {current:?} -> {event:?}")]
pub struct InvalidTransition {
    pub current: ExecutionStatus,
    pub event: ExecutionEvent,
}

impl ExecutionStatus {
    pub fn transition(self, event: ExecutionEvent) -> Result<ExecutionStatus, InvalidTransition> {
        use ExecutionEvent::*;
        use ExecutionStatus::*;

        let next = match (self, event) {
            (Pending, Start) => Running,
            (Running, Succeed) => Completed,
            (Running, Fail) => Failed,
            (Pending | Running, Cancel) => Cancelled,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = ExecutionStatus::Pending;
        let s = s.transition(ExecutionEvent::Start).unwrap();
        assert_eq!(s, ExecutionStatus::Running);
        let s = s.transition(ExecutionEvent::Succeed).unwrap();
        assert_eq!(s, ExecutionStatus::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_no_pending_to_terminal_shortcut() {
        assert!(ExecutionStatus::Pending.transition(ExecutionEvent::Succeed).is_err());
        assert!(ExecutionStatus::Pending.transition(ExecutionEvent::Fail).is_err());
        assert_eq!(
            ExecutionStatus::Pending.transition(ExecutionEvent::Cancel).unwrap(),
            ExecutionStatus::Cancelled
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for event in [
                ExecutionEvent::Start,
                ExecutionEvent::Succeed,
                ExecutionEvent::Fail,
                ExecutionEvent::Cancel,
            ] {
                assert!(terminal.transition(event).is_err());
            }
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
    }
}
