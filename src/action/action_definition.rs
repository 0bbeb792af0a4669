use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;
use crate::peer::identity::Identity;
use crate::peer::PeerId;

/// Everything a handler gets to see of an inbound invocation
#[derive(Clone, Debug)]
pub struct ActionCall {
    pub peer_id: PeerId,
    pub identity: Identity,
    pub payload: Value,
    /// The caller's roles that are relevant for this action: the roles that granted access for
    ///  role based authorization, all of the caller's roles otherwise
    pub roles: BTreeSet<String>,
}

impl ActionCall {
    pub fn new(peer_id: PeerId, identity: Identity, payload: Value) -> ActionCall {
        let roles = identity.roles.clone();
        ActionCall {
            peer_id,
            identity,
            payload,
            roles,
        }
    }
}

#[derive(Clone)]
pub enum Authorization {
    /// the caller needs at least one of these roles
    Roles(BTreeSet<String>),
    Predicate(Arc<dyn Fn(&ActionCall) -> bool + Send + Sync>),
}

impl Debug for Authorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Roles(roles) => write!(f, "Roles({:?})", roles),
            Authorization::Predicate(_) => write!(f, "Predicate"),
        }
    }
}

impl Authorization {
    pub fn public() -> Authorization {
        Authorization::Predicate(Arc::new(|_: &ActionCall| true))
    }

    pub fn roles<'a>(roles: impl IntoIterator<Item = &'a str>) -> Authorization {
        Authorization::Roles(roles.into_iter().map(|r| r.to_string()).collect())
    }

    pub fn predicate(f: impl Fn(&ActionCall) -> bool + Send + Sync + 'static) -> Authorization {
        Authorization::Predicate(Arc::new(f))
    }

    /// Narrows the call's roles to the applicable ones if the call is authorized
    pub fn authorize(&self, call: &mut ActionCall) -> bool {
        match self {
            Authorization::Roles(permitted) => {
                let applicable: BTreeSet<String> = permitted.intersection(&call.identity.roles)
                    .cloned()
                    .collect();
                if applicable.is_empty() {
                    return false;
                }
                call.roles = applicable;
                true
            }
            Authorization::Predicate(f) => f(call),
        }
    }
}

/// Application code behind an action. A returned error becomes an error outcome for the
///  caller, and so does a panic.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, call: ActionCall) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(ActionCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, call: ActionCall) -> anyhow::Result<Value> {
        self(call).await
    }
}

pub struct ActionDefinition {
    pub name: String,
    pub authorization: Authorization,
    pub handler: Arc<dyn ActionHandler>,
}

impl Debug for ActionDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Action{{{}:{:?}}}", self.name, self.authorization)
    }
}
