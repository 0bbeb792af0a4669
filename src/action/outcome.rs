use std::fmt::{Display, Formatter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionErrorKind {
    /// the peer has no action of that name - reported through a negative acknowledgement
    UnknownAction,
    Unauthorized,
    /// the handler failed or panicked
    Handler,
    /// the caller stopped waiting
    Timeout,
    /// the message could not be sent
    Disconnected,
    /// the peer's response could not be interpreted
    Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl Display for ActionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
impl std::error::Error for ActionError {}

/// The settled result of an action invocation, as it travels in a return message:
///
/// ```json
/// {"status": "ok", "data": ...}
/// {"status": "error", "error": {"kind": "handler", "message": "..."}}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionOutcome {
    Ok {
        data: Value,
    },
    Error {
        error: ActionError,
    },
}

impl ActionOutcome {
    pub fn ok(data: Value) -> ActionOutcome {
        ActionOutcome::Ok { data }
    }

    pub fn error(kind: ActionErrorKind, message: impl Into<String>) -> ActionOutcome {
        ActionOutcome::Error {
            error: ActionError {
                kind,
                message: message.into(),
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ActionOutcome::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ActionErrorKind> {
        match self {
            ActionOutcome::Ok { .. } => None,
            ActionOutcome::Error { error } => Some(error.kind),
        }
    }

    pub fn into_result(self) -> Result<Value, ActionError> {
        match self {
            ActionOutcome::Ok { data } => Ok(data),
            ActionOutcome::Error { error } => Err(error),
        }
    }
}
