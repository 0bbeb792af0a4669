use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, trace};
use uuid::Uuid;
use crate::action::outcome::{ActionErrorKind, ActionOutcome};
use crate::peer::PeerId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Accepted,
    /// the peer rejected the invocation, or it could not be delivered
    Rejected,
}

/// `Sent -> Acked -> Returned`, after which an invocation is reaped once its grace period has
///  elapsed. A negative acknowledgement goes straight to `Returned`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvocationState {
    Sent,
    Acked,
    Returned,
}

struct Invocation {
    peer_id: PeerId,
    action: String,
    sent_at: Instant,
    ack: watch::Sender<AckState>,
    result: watch::Sender<Option<ActionOutcome>>,
}

impl Invocation {
    fn state(&self) -> InvocationState {
        if self.result.borrow().is_some() {
            InvocationState::Returned
        }
        else if *self.ack.borrow() == AckState::Pending {
            InvocationState::Sent
        }
        else {
            InvocationState::Acked
        }
    }
}

/// Outstanding locally initiated invocations by invocation id. Both the acknowledgement and the
///  result of an invocation resolve at most once: later resolutions are ignored.
#[derive(Clone)]
pub struct InvocationRegistry {
    grace_period: Duration,
    invocations: Arc<Mutex<FxHashMap<String, Invocation>>>,
}

impl InvocationRegistry {
    pub fn new(grace_period: Duration) -> InvocationRegistry {
        InvocationRegistry {
            grace_period,
            invocations: Default::default(),
        }
    }

    /// Registers a new invocation that times out unless it is resolved within `timeout`,
    ///  whether or not anybody waits for its result
    pub async fn register(&self, peer_id: PeerId, action: &str, timeout: Duration) -> InvocationHandle {
        let iid = Uuid::new_v4().to_string();
        let (ack, ack_rx) = watch::channel(AckState::Pending);
        let (result, result_rx) = watch::channel(None);

        trace!("registering invocation {} of {:?} on {:?}", iid, action, peer_id);
        self.invocations.lock().await
            .insert(iid.clone(), Invocation {
                peer_id: peer_id.clone(),
                action: action.to_string(),
                sent_at: Instant::now(),
                ack,
                result,
            });

        let registry = self.clone();
        let deadline_iid = iid.clone();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            let timed_out = ActionOutcome::error(ActionErrorKind::Timeout, format!("no result after {:?}", timeout));
            registry.complete(&deadline_iid, timed_out).await;
        });

        InvocationHandle {
            iid,
            peer_id,
            ack_rx,
            result_rx,
            registry: self.clone(),
        }
    }

    /// A handle for an invocation that is still registered
    pub async fn handle(&self, iid: &str) -> Option<InvocationHandle> {
        let invocations = self.invocations.lock().await;
        let invocation = invocations.get(iid)?;
        Some(InvocationHandle {
            iid: iid.to_string(),
            peer_id: invocation.peer_id.clone(),
            ack_rx: invocation.ack.subscribe(),
            result_rx: invocation.result.subscribe(),
            registry: self.clone(),
        })
    }

    pub async fn state(&self, iid: &str) -> Option<InvocationState> {
        self.invocations.lock().await
            .get(iid)
            .map(|i| i.state())
    }

    pub async fn len(&self) -> usize {
        self.invocations.lock().await.len()
    }

    /// Returns `false` for an unknown invocation id
    pub async fn acknowledge(&self, iid: &str, accepted: bool) -> bool {
        let invocations = self.invocations.lock().await;
        let Some(invocation) = invocations.get(iid) else {
            return false;
        };

        let new_state = if accepted { AckState::Accepted } else { AckState::Rejected };
        let modified = invocation.ack.send_if_modified(|state| {
            if *state == AckState::Pending {
                *state = new_state;
                true
            }
            else {
                false
            }
        });
        if !modified {
            trace!("ignoring duplicate acknowledgement for invocation {}", iid);
            return true;
        }
        debug!("invocation {} of {:?} {} after {:?}", iid, invocation.action, if accepted { "acknowledged" } else { "rejected" }, invocation.sent_at.elapsed());

        if !accepted {
            let outcome = ActionOutcome::error(ActionErrorKind::UnknownAction, format!("peer rejected invocation of {:?}", invocation.action));
            drop(invocations);
            self.complete(iid, outcome).await;
        }
        true
    }

    /// Settles an invocation's result and schedules its removal after the grace period.
    ///  Returns `false` for an unknown invocation id.
    pub async fn complete(&self, iid: &str, outcome: ActionOutcome) -> bool {
        let invocations = self.invocations.lock().await;
        let Some(invocation) = invocations.get(iid) else {
            return false;
        };

        // a result that was never acknowledged did not get through
        let implied_ack = match outcome.error_kind() {
            Some(ActionErrorKind::Timeout | ActionErrorKind::Disconnected | ActionErrorKind::UnknownAction) => AckState::Rejected,
            _ => AckState::Accepted,
        };
        invocation.ack.send_if_modified(|state| {
            if *state == AckState::Pending {
                *state = implied_ack;
                true
            }
            else {
                false
            }
        });

        let modified = invocation.result.send_if_modified(|result| {
            if result.is_none() {
                *result = Some(outcome);
                true
            }
            else {
                false
            }
        });
        if !modified {
            trace!("ignoring duplicate result for invocation {}", iid);
            return true;
        }
        debug!("invocation {} of {:?} returned after {:?}", iid, invocation.action, invocation.sent_at.elapsed());

        let registered = self.invocations.clone();
        let grace_period = self.grace_period;
        let iid = iid.to_string();
        tokio::spawn(async move {
            time::sleep(grace_period).await;
            trace!("reaping invocation {}", iid);
            registered.lock().await.remove(&iid);
        });
        true
    }

    /// Resolves all pending invocations on a peer with an error
    pub async fn fail_all_for_peer(&self, peer_id: &PeerId, kind: ActionErrorKind, message: &str) {
        let pending = self.invocations.lock().await
            .iter()
            .filter(|(_, i)| &i.peer_id == peer_id && i.result.borrow().is_none())
            .map(|(iid, _)| iid.clone())
            .collect::<Vec<_>>();

        for iid in pending {
            self.complete(&iid, ActionOutcome::error(kind, message)).await;
        }
    }
}

/// A caller's view of one invocation. Acknowledgement and result can be awaited independently,
///  and from several handles for the same invocation.
pub struct InvocationHandle {
    iid: String,
    peer_id: PeerId,
    ack_rx: watch::Receiver<AckState>,
    result_rx: watch::Receiver<Option<ActionOutcome>>,
    registry: InvocationRegistry,
}

impl InvocationHandle {
    pub fn iid(&self) -> &str {
        &self.iid
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn ack_state(&self) -> AckState {
        *self.ack_rx.borrow()
    }

    pub fn result(&self) -> Option<ActionOutcome> {
        self.result_rx.borrow().clone()
    }

    pub async fn wait_for_ack(&mut self) -> AckState {
        let acked = self.ack_rx.wait_for(|s| *s != AckState::Pending).await
            .map(|state| *state);
        acked.unwrap_or_else(|_| *self.ack_rx.borrow())
    }

    /// Waits for the invocation's result. If it does not arrive in time, the invocation is
    ///  completed with a timeout error - whatever the peer is still doing with it.
    pub async fn wait_for_result(&mut self, timeout: Duration) -> ActionOutcome {
        let waited = time::timeout(timeout, self.result_rx.wait_for(|r| r.is_some()))
            .await
            .map(|r| r.map(|outcome| (*outcome).clone()));

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(_) => ActionOutcome::error(ActionErrorKind::Protocol, format!("invocation {} was discarded", self.iid)),
            Err(_) => {
                debug!("invocation {} timed out after {:?}", self.iid, timeout);
                let timed_out = ActionOutcome::error(ActionErrorKind::Timeout, format!("no result after {:?}", timeout));
                self.registry.complete(&self.iid, timed_out.clone()).await;
                // a result may have raced the timeout
                self.result().unwrap_or(timed_out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn registry() -> InvocationRegistry {
        InvocationRegistry::new(Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_then_result() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "echo", TIMEOUT).await;
        assert_eq!(registry.state(handle.iid()).await, Some(InvocationState::Sent));

        assert!(registry.acknowledge(handle.iid(), true).await);
        assert_eq!(handle.wait_for_ack().await, AckState::Accepted);
        assert_eq!(registry.state(handle.iid()).await, Some(InvocationState::Acked));

        assert!(registry.complete(handle.iid(), ActionOutcome::ok(json!("x"))).await);
        assert_eq!(handle.wait_for_result(Duration::from_secs(1)).await, ActionOutcome::ok(json!("x")));
        assert_eq!(registry.state(handle.iid()).await, Some(InvocationState::Returned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_ack_completes_invocation() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "missing", TIMEOUT).await;

        registry.acknowledge(handle.iid(), false).await;
        assert_eq!(handle.wait_for_ack().await, AckState::Rejected);
        let outcome = handle.wait_for_result(Duration::from_secs(1)).await;
        assert_eq!(outcome.error_kind(), Some(ActionErrorKind::UnknownAction));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_is_idempotent() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "echo", TIMEOUT).await;

        registry.acknowledge(handle.iid(), true).await;
        registry.acknowledge(handle.iid(), false).await;
        registry.complete(handle.iid(), ActionOutcome::ok(json!(1))).await;
        registry.complete(handle.iid(), ActionOutcome::ok(json!(2))).await;

        assert_eq!(handle.wait_for_ack().await, AckState::Accepted);
        assert_eq!(handle.wait_for_result(Duration::from_secs(1)).await, ActionOutcome::ok(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "slow", TIMEOUT).await;
        registry.acknowledge(handle.iid(), true).await;

        let start = Instant::now();
        let outcome = handle.wait_for_result(Duration::from_millis(500)).await;
        assert_eq!(outcome.error_kind(), Some(ActionErrorKind::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(510));

        // a late return is ignored
        registry.complete(handle.iid(), ActionOutcome::ok(json!("late"))).await;
        assert_eq!(handle.result(), Some(outcome));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_ack_rejects() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "x", TIMEOUT).await;
        handle.wait_for_result(Duration::from_millis(10)).await;
        assert_eq!(handle.wait_for_ack().await, AckState::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaped_after_grace_period() {
        let registry = registry();
        let handle = registry.register(PeerId::from("p"), "echo", TIMEOUT).await;
        let iid = handle.iid().to_string();
        registry.complete(&iid, ActionOutcome::ok(json!(null))).await;

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(registry.state(&iid).await, Some(InvocationState::Returned));
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.state(&iid).await, None);
        assert_eq!(registry.len().await, 0);

        assert!(!registry.complete(&iid, ActionOutcome::ok(json!(null))).await);
        assert!(!registry.acknowledge(&iid, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_handle_sees_result() {
        let registry = registry();
        let handle = registry.register(PeerId::from("p"), "echo", TIMEOUT).await;
        let mut second = registry.handle(handle.iid()).await.unwrap();

        registry.complete(handle.iid(), ActionOutcome::ok(json!(7))).await;
        assert_eq!(second.wait_for_result(Duration::from_secs(1)).await, ActionOutcome::ok(json!(7)));
        assert!(registry.handle("unknown").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_for_peer() {
        let registry = registry();
        let mut a = registry.register(PeerId::from("a"), "x", TIMEOUT).await;
        let b = registry.register(PeerId::from("b"), "x", TIMEOUT).await;

        registry.fail_all_for_peer(&PeerId::from("a"), ActionErrorKind::Disconnected, "gone").await;
        assert_eq!(a.wait_for_result(Duration::from_secs(1)).await.error_kind(), Some(ActionErrorKind::Disconnected));
        assert_eq!(b.result(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_invocation_times_out_and_is_reaped() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "hang", Duration::from_secs(5)).await;
        registry.acknowledge(handle.iid(), true).await;
        assert_eq!(handle.wait_for_ack().await, AckState::Accepted);
        let iid = handle.iid().to_string();
        drop(handle);

        time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(registry.state(&iid).await, Some(InvocationState::Returned));
        let outcome = registry.handle(&iid).await.unwrap().result();
        assert_eq!(outcome.unwrap().error_kind(), Some(ActionErrorKind::Timeout));

        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_does_not_override_result() {
        let registry = registry();
        let mut handle = registry.register(PeerId::from("p"), "echo", Duration::from_secs(5)).await;
        registry.complete(handle.iid(), ActionOutcome::ok(json!("done"))).await;

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.wait_for_result(Duration::from_secs(1)).await, ActionOutcome::ok(json!("done")));
    }
}
