use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use crate::wire::message_id::MessageId;

/// Binary chunk frame, self-describing with regard to the message it belongs to:
///
/// ```ascii
/// 0: flags / length (u8)
///    * bit 7: 1 if the id is transmitted as the decoded bytes of its base64 text, 0 for ASCII
///    * bit 0-6: length L of the id in bytes
/// 1: message id (L bytes)
/// *: raw chunk of the message payload
/// ```
pub struct ChunkFrame;

impl ChunkFrame {
    const BASE64_FLAG: u8 = 0x80;
    const LEN_MASK: u8 = 0x7f;

    pub fn encode(id: &MessageId, chunk: &[u8]) -> Vec<u8> {
        let (flag, id_bytes) = match id.base64_bytes() {
            Some(raw) => (Self::BASE64_FLAG, raw),
            None => (0, id.as_str().as_bytes().to_vec()),
        };

        let mut buf = BytesMut::with_capacity(1 + id_bytes.len() + chunk.len());
        buf.put_u8(flag | id_bytes.len() as u8);
        buf.put_slice(&id_bytes);
        buf.put_slice(chunk);
        buf.to_vec()
    }

    pub fn decode(frame: &[u8]) -> anyhow::Result<(MessageId, &[u8])> {
        let (&prefix, rest) = frame.split_first()
            .ok_or_else(|| anyhow!("empty binary frame"))?;

        let id_len = (prefix & Self::LEN_MASK) as usize;
        if id_len == 0 {
            bail!("binary frame without message id");
        }
        if rest.len() < id_len {
            bail!("binary frame is shorter than its declared id length {}", id_len);
        }
        let (id_bytes, chunk) = rest.split_at(id_len);

        let id = if prefix & Self::BASE64_FLAG != 0 {
            MessageId::from_base64_bytes(id_bytes)?
        }
        else {
            MessageId::parse(std::str::from_utf8(id_bytes)?)?
        };
        Ok((id, chunk))
    }
}
