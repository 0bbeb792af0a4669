use anyhow::{anyhow, bail};
use crate::wire::compression::Compression;
use crate::wire::message_id::MessageId;
use crate::wire::MessageType;

const MSG_PREFIX: &str = "msg";
const CONTENT_LENGTH: &str = "content-length=";
const CHUNK_RANGE: &str = "chunk-range=";
const END: &str = "end";
const USERDATA_SET: &str = "userdata|set|";
const AUTH_TOKEN: &str = "auth|token|";

/// Header of a message, announcing its id, the number of bytes that will follow in chunk
///  frames, and how to interpret them once complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageStart {
    pub id: MessageId,
    pub content_length: usize,
    pub message_type: MessageType,
    pub compression: Compression,
    pub metadata: String,
}

/// Textual control frames, all of them pipe-delimited:
///
/// ```ascii
/// msg|<id>|content-length=<n>|<type>|<compression>|<metadata>
/// msg|<id>|content-length=0|action-ack|none|<iid>|<true|false>
/// msg|<id>|chunk-range=<start>-<end>
/// msg|<id>|end
/// userdata|set|<base64 json>
/// auth|token|<base64 token>
/// ```
///
/// The metadata of a start frame is the remainder of the line, so it may contain pipes itself.
///  Ranges are half-open, i.e. `end` is the first offset *after* the chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    Start(MessageStart),
    Ack {
        id: MessageId,
        iid: String,
        accepted: bool,
    },
    Range {
        id: MessageId,
        start: usize,
        end: usize,
    },
    End {
        id: MessageId,
    },
    /// base64 encoded identity - decoding is left to the receiver, which checks its size first
    UserData(String),
    /// base64 encoded opaque token
    AuthToken(String),
}

impl ControlFrame {
    pub fn to_text(&self) -> String {
        match self {
            ControlFrame::Start(start) => format!("{}|{}|{}{}|{}|{}|{}",
                MSG_PREFIX, start.id, CONTENT_LENGTH, start.content_length, start.message_type, start.compression, start.metadata),
            ControlFrame::Ack { id, iid, accepted } => format!("{}|{}|{}0|{}|{}|{}|{}",
                MSG_PREFIX, id, CONTENT_LENGTH, MessageType::ActionAck, Compression::None, iid, accepted),
            ControlFrame::Range { id, start, end } => format!("{}|{}|{}{}-{}", MSG_PREFIX, id, CHUNK_RANGE, start, end),
            ControlFrame::End { id } => format!("{}|{}|{}", MSG_PREFIX, id, END),
            ControlFrame::UserData(data) => format!("{}{}", USERDATA_SET, data),
            ControlFrame::AuthToken(token) => format!("{}{}", AUTH_TOKEN, token),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<ControlFrame> {
        if let Some(data) = text.strip_prefix(USERDATA_SET) {
            return Ok(ControlFrame::UserData(data.to_string()));
        }
        if let Some(token) = text.strip_prefix(AUTH_TOKEN) {
            return Ok(ControlFrame::AuthToken(token.to_string()));
        }

        let mut parts = text.splitn(3, '|');
        if parts.next() != Some(MSG_PREFIX) {
            bail!("unknown control frame kind");
        }
        let id = MessageId::parse(parts.next().ok_or_else(|| anyhow!("control frame without message id"))?)?;
        let rest = parts.next().ok_or_else(|| anyhow!("control frame for {:?} without body", id))?;

        if rest == END {
            return Ok(ControlFrame::End { id });
        }
        if let Some(range) = rest.strip_prefix(CHUNK_RANGE) {
            let (start, end) = range.split_once('-')
                .ok_or_else(|| anyhow!("malformed chunk range {:?}", range))?;
            let start: usize = start.parse()?;
            let end: usize = end.parse()?;
            if end < start {
                bail!("chunk range {}-{} ends before it starts", start, end);
            }
            return Ok(ControlFrame::Range { id, start, end });
        }
        if rest.starts_with(CONTENT_LENGTH) {
            return Self::parse_start(id, rest);
        }
        bail!("unknown control frame body for {:?}", id)
    }

    fn parse_start(id: MessageId, rest: &str) -> anyhow::Result<ControlFrame> {
        let mut parts = rest.splitn(4, '|');
        let content_length: usize = parts.next()
            .and_then(|s| s.strip_prefix(CONTENT_LENGTH))
            .ok_or_else(|| anyhow!("missing content length"))?
            .parse()?;
        let message_type: MessageType = parts.next()
            .ok_or_else(|| anyhow!("missing message type"))?
            .parse()?;
        let compression: Compression = parts.next()
            .ok_or_else(|| anyhow!("missing compression"))?
            .parse()?;
        let metadata = parts.next().unwrap_or("").to_string();

        if message_type == MessageType::ActionAck {
            if content_length != 0 {
                bail!("acknowledgement {:?} declares a non-zero content length", id);
            }
            let (iid, accepted) = metadata.rsplit_once('|')
                .ok_or_else(|| anyhow!("acknowledgement {:?} without acceptance flag", id))?;
            let accepted = match accepted {
                "true" => true,
                "false" => false,
                other => bail!("invalid acceptance flag {:?}", other),
            };
            return Ok(ControlFrame::Ack { id, iid: iid.to_string(), accepted });
        }

        Ok(ControlFrame::Start(MessageStart {
            id,
            content_length,
            message_type,
            compression,
            metadata,
        }))
    }
}
