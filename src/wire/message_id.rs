use std::fmt::{Debug, Display, Formatter};
use anyhow::bail;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crate::util::random::Random;

/// Number of random bytes in a generated id; rendered as 8 characters of base64 text
const RANDOM_ID_BYTES: usize = 6;

/// The id of one message in flight. It is scoped to a connection and only needs to be unique
///  among the messages currently being reassembled there, so a short random id is sufficient.
///
/// Ids are plain text in control frames. In binary frames, an id that is valid (unpadded,
///  URL-safe) base64 is sent as its decoded bytes to save space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    /// Longest id that fits the 7 bit length in a binary frame's prefix byte
    pub const MAX_LEN: usize = 0x7f;

    pub fn random<R: Random>() -> MessageId {
        let mut raw = [0u8; RANDOM_ID_BYTES];
        R::fill_bytes(&mut raw);
        MessageId(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn parse(s: &str) -> anyhow::Result<MessageId> {
        if s.is_empty() {
            bail!("empty message id");
        }
        if s.len() > Self::MAX_LEN {
            bail!("message id is longer than {} bytes", Self::MAX_LEN);
        }
        if !s.bytes().all(|b| b.is_ascii_graphic() && b != b'|') {
            bail!("message id {:?} contains invalid characters", s);
        }
        Ok(MessageId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The compact raw form of this id, if it is canonical base64
    pub fn base64_bytes(&self) -> Option<Vec<u8>> {
        let decoded = URL_SAFE_NO_PAD.decode(&self.0).ok()?;
        if decoded.is_empty() || decoded.len() > Self::MAX_LEN {
            return None;
        }
        if URL_SAFE_NO_PAD.encode(&decoded) != self.0 {
            return None;
        }
        Some(decoded)
    }

    pub fn from_base64_bytes(raw: &[u8]) -> anyhow::Result<MessageId> {
        if raw.is_empty() {
            bail!("empty message id");
        }
        MessageId::parse(&URL_SAFE_NO_PAD.encode(raw))
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::util::random::{MockRandom, RngRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    #[test]
    fn test_random_id_is_base64() {
        let id = MessageId::random::<RngRandom>();
        assert_eq!(id.as_str().len(), 8);
        assert_eq!(id.base64_bytes().unwrap().len(), RANDOM_ID_BYTES);
    }

    #[test]
    fn test_random_id_uses_random_bytes() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::fill_bytes_context();
        ctx.expect().returning(|buf| buf.fill(0xff));

        let id = MessageId::random::<MockRandom>();
        assert_eq!(id.as_str(), "________");
    }

    #[rstest]
    #[case::simple("abc", true)]
    #[case::generated("AbCd-_12", true)]
    #[case::max_len(&"a".repeat(127), true)]
    #[case::empty("", false)]
    #[case::too_long(&"a".repeat(128), false)]
    #[case::pipe("ab|c", false)]
    #[case::space("ab c", false)]
    #[case::non_ascii("äbc", false)]
    fn test_parse(#[case] s: &str, #[case] valid: bool) {
        assert_eq!(MessageId::parse(s).is_ok(), valid);
    }

    #[rstest]
    #[case::canonical("AbCd-_12", Some(vec![0x01, 0xb0, 0x9d, 0xfb, 0xfd, 0x76]))]
    #[case::not_base64("a.b", None)]
    #[case::non_canonical_tail("AB", None)]
    fn test_base64_bytes(#[case] s: &str, #[case] expected: Option<Vec<u8>>) {
        let id = MessageId::parse(s).unwrap();
        assert_eq!(id.base64_bytes(), expected);
        if let Some(raw) = expected {
            assert_eq!(MessageId::from_base64_bytes(&raw).unwrap(), id);
        }
    }
}
