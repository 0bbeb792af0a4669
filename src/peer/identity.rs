use std::collections::BTreeSet;
use anyhow::bail;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
#[cfg(test)] use mockall::automock;
use serde::{Deserialize, Serialize};
use crate::peer::{ConnectionRequest, PeerId};

/// Query parameter (and its value) in a connection URL that requests the bidirectional-auth
///  handshake instead of the server asserting the client's identity directly
pub const AUTH_MARKER_PARAM: &str = "shim-auth";
pub const AUTH_MARKER_VALUE: &str = "bidirectional";

/// The authenticated identity of one side of a connection. Roles are what action authorization
///  is checked against; `data` is opaque to the protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Identity {
    pub fn new<'a>(id: &str, roles: impl IntoIterator<Item = &'a str>) -> Identity {
        Identity {
            id: id.to_string(),
            roles: roles.into_iter().map(|r| r.to_string()).collect(),
            data: serde_json::Value::Null,
        }
    }

    /// base64 encoded JSON, as carried by a `userdata|set` frame
    pub fn to_base64(&self) -> anyhow::Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// The length limit is checked before decoding
    pub fn from_base64(encoded: &str, max_len: usize) -> anyhow::Result<Identity> {
        if encoded.len() > max_len {
            bail!("identity payload of {} bytes exceeds the maximum of {}", encoded.len(), max_len);
        }
        let json = STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[derive(Clone, Debug)]
pub struct AuthRequest {
    pub connection: ConnectionRequest,
    /// The token a server issued in a bidirectional-auth handshake, `None` for direct identity
    ///  assertion by the server
    pub token: Option<String>,
}

/// Verifies whoever is on the other end of a connection. A server calls this when accepting a
///  connection; a client calls it when it receives an auth token from the server, and pushes
///  the resulting identity back.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthHandler: Send + Sync + 'static {
    async fn authenticate(&self, peer_id: &PeerId, request: &AuthRequest) -> anyhow::Result<Identity>;
}

/// The server's side of the bidirectional-auth handshake: issues the (signed, opaque) token it
///  pushes to the client, and checks the identity the client pushes back.
///
/// The pushed identity is the client's own claim, roles included. The default
///  [AuthTokenProvider::verify_identity] accepts it as is, which is only safe if the
///  client's auth handler is trusted to have verified the token.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthTokenProvider: Send + Sync + 'static {
    async fn issue_token(&self, peer_id: &PeerId, request: &ConnectionRequest) -> anyhow::Result<String>;

    /// Returns the identity to record for the client, or an error to close the connection
    async fn verify_identity(&self, _peer_id: &PeerId, identity: Identity) -> anyhow::Result<Identity> {
        Ok(identity)
    }
}

/// Accepts every connection under the identity `anonymous` without roles
pub struct AnonymousAuth;

#[async_trait]
impl AuthHandler for AnonymousAuth {
    async fn authenticate(&self, _peer_id: &PeerId, _request: &AuthRequest) -> anyhow::Result<Identity> {
        Ok(Identity::new("anonymous", []))
    }
}

pub fn encode_token(token: &str) -> String {
    STANDARD.encode(token)
}

pub fn decode_token(encoded: &str) -> anyhow::Result<String> {
    Ok(String::from_utf8(STANDARD.decode(encoded)?)?)
}

/// `uri` may be a full URL or just the path and query of an upgrade request
pub fn requests_bidirectional_auth(uri: &str) -> bool {
    let Some((_, query)) = uri.split_once('?') else {
        return false;
    };
    let query = query.split('#').next().unwrap_or("");
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(k, v)| k == AUTH_MARKER_PARAM && v == AUTH_MARKER_VALUE)
}

pub fn add_bidirectional_marker(url: &mut url::Url) {
    if !requests_bidirectional_auth(url.as_str()) {
        url.query_pairs_mut().append_pair(AUTH_MARKER_PARAM, AUTH_MARKER_VALUE);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plain_path("/ws", false)]
    #[case::marker("/ws?shim-auth=bidirectional", true)]
    #[case::marker_among_others("ws://host:1234/ws?token=abc&shim-auth=bidirectional&x=1", true)]
    #[case::other_value("/ws?shim-auth=direct", false)]
    #[case::marker_in_fragment("/ws?x=1#shim-auth=bidirectional", false)]
    #[case::marker_in_path("/shim-auth=bidirectional", false)]
    fn test_requests_bidirectional_auth(#[case] uri: &str, #[case] expected: bool) {
        assert_eq!(requests_bidirectional_auth(uri), expected);
    }

    #[test]
    fn test_add_marker_once() {
        let mut url = url::Url::parse("ws://localhost:8080/rpc?a=b").unwrap();
        add_bidirectional_marker(&mut url);
        add_bidirectional_marker(&mut url);
        assert_eq!(url.as_str(), "ws://localhost:8080/rpc?a=b&shim-auth=bidirectional");
    }

    #[test]
    fn test_identity_base64() {
        let mut identity = Identity::new("alice", ["admin", "guest"]);
        identity.data = serde_json::json!({"team": "ops"});

        let encoded = identity.to_base64().unwrap();
        assert_eq!(Identity::from_base64(&encoded, 2048).unwrap(), identity);
        assert!(Identity::from_base64(&encoded, encoded.len() - 1).is_err());
    }

    #[rstest]
    #[case::not_base64("not base64!")]
    #[case::not_json("bm90IGpzb24=")]
    fn test_identity_malformed(#[case] encoded: &str) {
        assert!(Identity::from_base64(encoded, 2048).is_err());
    }

    #[test]
    fn test_identity_defaults_missing_fields() {
        let encoded = STANDARD.encode(r#"{"id":"bob"}"#);
        assert_eq!(Identity::from_base64(&encoded, 2048).unwrap(), Identity::new("bob", []));
    }

    #[test]
    fn test_token_encoding() {
        assert_eq!(encode_token("token"), "dG9rZW4=");
        assert_eq!(decode_token("dG9rZW4=").unwrap(), "token");
        assert!(decode_token("//8=").is_err());
    }
}
