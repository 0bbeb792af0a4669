//! Wire representation of the protocol: textual control frames, id-prefixed binary chunk frames,
//!  and the codec that turns a payload into a sequence of both.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::bail;

pub mod message_id;
pub mod control_frame;
pub mod binary_frame;
pub mod compression;
pub mod chunk_codec;

/// A single frame as it travels over the socket. Text frames carry control information,
///  binary frames carry chunks of message payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}
impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(s) => s.len(),
            WireFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a connection's single writer can be asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(WireFrame),
    Close,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    ActionInvoke,
    ActionAck,
    ActionReturn,
}
impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ActionInvoke => "action-invoke",
            MessageType::ActionAck => "action-ack",
            MessageType::ActionReturn => "action-return",
        }
    }
}
impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action-invoke" => Ok(MessageType::ActionInvoke),
            "action-ack" => Ok(MessageType::ActionAck),
            "action-return" => Ok(MessageType::ActionReturn),
            other => bail!("unknown message type {:?}", other),
        }
    }
}
