//! One-shot completion correlation for engine commands
//!
//! Each command kind owns a [`CompletionSlot`]. Arming the slot takes the
//! kind's gate, so at most one command of a kind is outstanding per session;
//! a second caller waits for the first to resolve. The engine's completion
//! fires the armed resolver exactly once and leaves the slot inert, so a late
//! completion is discarded instead of resolving an unrelated command.

use crate::engine::{EngineError, SubscribeAck};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::messages::Subscription;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, MutexGuard};
use tracing::debug;

/// Commands that resolve through a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
    Disconnect,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Connect => "connect",
            CommandKind::Subscribe => "subscribe",
            CommandKind::Unsubscribe => "unsubscribe",
            CommandKind::Publish => "publish",
            CommandKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

type Resolver<T> = Box<dyn FnOnce(T) -> BridgeResult<()> + Send>;

struct Armed<T> {
    resolve: Resolver<T>,
    reply: oneshot::Sender<BridgeResult<()>>,
}

/// Completion slot for one command kind of one session
pub struct CompletionSlot<T> {
    kind: CommandKind,
    gate: tokio::sync::Mutex<()>,
    armed: Mutex<Option<Armed<T>>>,
}

impl<T: Send + 'static> CompletionSlot<T> {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            gate: tokio::sync::Mutex::new(()),
            armed: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Install `resolve` for the next completion of this kind.
    ///
    /// Waits while another command of the same kind is outstanding.
    pub async fn arm<F>(&self, resolve: F) -> PendingCompletion<'_, T>
    where
        F: FnOnce(T) -> BridgeResult<()> + Send + 'static,
    {
        let turn = self.gate.lock().await;
        let (reply, receiver) = oneshot::channel();
        *self.lock_armed() = Some(Armed {
            resolve: Box::new(resolve),
            reply,
        });
        PendingCompletion {
            slot: self,
            receiver,
            _turn: turn,
        }
    }

    /// Deliver an engine completion. Returns false when nothing was armed.
    pub fn fire(&self, outcome: T) -> bool {
        let armed = self.lock_armed().take();
        match armed {
            Some(Armed { resolve, reply }) => {
                let result = resolve(outcome);
                // the waiter may already have given up
                let _ = reply.send(result);
                true
            }
            None => {
                debug!(command = %self.kind, "Stale completion discarded");
                false
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock_armed().is_some()
    }

    /// Drop any armed resolver; its waiter resolves as cancelled
    pub fn disarm(&self) {
        if self.lock_armed().take().is_some() {
            debug!(command = %self.kind, "Pending completion disarmed");
        }
    }

    fn lock_armed(&self) -> std::sync::MutexGuard<'_, Option<Armed<T>>> {
        self.armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for one armed command; dropping it disarms the slot
pub struct PendingCompletion<'a, T: Send + 'static> {
    slot: &'a CompletionSlot<T>,
    receiver: oneshot::Receiver<BridgeResult<()>>,
    _turn: MutexGuard<'a, ()>,
}

impl<'a, T: Send + 'static> PendingCompletion<'a, T> {
    /// Wait for the completion with no deadline
    pub async fn wait(mut self) -> BridgeResult<()> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::cancelled(self.slot.kind)),
        }
    }

    /// Wait for the completion, failing with a timeout after `limit`
    pub async fn wait_for(mut self, limit: Duration) -> BridgeResult<()> {
        match tokio::time::timeout(limit, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::cancelled(self.slot.kind)),
            Err(_) => {
                debug!(command = %self.slot.kind, ?limit, "Completion timed out");
                Err(BridgeError::timeout(self.slot.kind, limit))
            }
        }
    }
}

impl<T: Send + 'static> Drop for PendingCompletion<'_, T> {
    fn drop(&mut self) {
        self.slot.disarm();
    }
}

/// Completion slots of one session
pub struct CompletionCorrelator {
    pub connect: CompletionSlot<Result<(), EngineError>>,
    pub subscribe: CompletionSlot<SubscribeAck>,
    pub unsubscribe: CompletionSlot<Vec<String>>,
    pub publish: CompletionSlot<Result<(), EngineError>>,
    pub disconnect: CompletionSlot<Result<(), EngineError>>,
}

impl CompletionCorrelator {
    pub fn new() -> Self {
        Self {
            connect: CompletionSlot::new(CommandKind::Connect),
            subscribe: CompletionSlot::new(CommandKind::Subscribe),
            unsubscribe: CompletionSlot::new(CommandKind::Unsubscribe),
            publish: CompletionSlot::new(CommandKind::Publish),
            disconnect: CompletionSlot::new(CommandKind::Disconnect),
        }
    }

    /// Disarm every slot; outstanding commands resolve as cancelled
    pub fn cancel_all(&self) {
        self.connect.disarm();
        self.subscribe.disarm();
        self.unsubscribe.disarm();
        self.publish.disarm();
        self.disconnect.disarm();
    }
}

impl Default for CompletionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// How a SUBACK resolves a subscribe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeVerdict {
    pub granted: Vec<String>,
    pub failed: Vec<String>,
}

impl SubscribeVerdict {
    /// At least one requested topic was granted
    pub fn succeeded(&self) -> bool {
        !self.granted.is_empty()
    }

    pub fn failure_message(&self) -> String {
        format!("Failed to subscribe to topics: {}", self.failed.join(", "))
    }
}

/// Split the requested topics into granted and failed.
///
/// A requested topic the engine neither granted nor refused counts as failed.
pub fn subscribe_verdict(requested: &[Subscription], ack: &SubscribeAck) -> SubscribeVerdict {
    let (granted, failed): (Vec<String>, Vec<String>) = requested
        .iter()
        .map(|subscription| subscription.topic.clone())
        .partition(|topic| ack.granted.contains(topic) && !ack.failed.contains(topic));
    SubscribeVerdict { granted, failed }
}

/// How an UNSUBACK set resolves an unsubscribe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeVerdict {
    pub confirmed: Vec<String>,
    pub failed: Vec<String>,
}

impl UnsubscribeVerdict {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure_message(&self) -> String {
        format!(
            "Failed to unsubscribe from topics: {}",
            self.failed.join(", ")
        )
    }
}

/// Succeeds only when the confirmed set equals the requested set
pub fn unsubscribe_verdict(requested: &[String], confirmed: &[String]) -> UnsubscribeVerdict {
    let failed: Vec<String> = requested
        .iter()
        .filter(|topic| !confirmed.contains(topic))
        .cloned()
        .collect();
    let confirmed: Vec<String> = requested
        .iter()
        .filter(|topic| confirmed.contains(topic))
        .cloned()
        .collect();
    UnsubscribeVerdict { confirmed, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn subs(topics: &[&str]) -> Vec<Subscription> {
        topics
            .iter()
            .map(|topic| Subscription::new(*topic, QoS::AtMostOnce))
            .collect()
    }

    fn strings(topics: &[&str]) -> Vec<String> {
        topics.iter().map(|topic| topic.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fire_resolves_exactly_once() {
        let slot = CompletionSlot::<Result<(), EngineError>>::new(CommandKind::Publish);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let pending = slot
            .arm(move |outcome| {
                counter.fetch_add(1, Ordering::SeqCst);
                outcome.map_err(BridgeError::from)
            })
            .await;
        assert!(slot.is_armed());

        assert!(slot.fire(Ok(())));
        assert!(!slot.is_armed());
        assert!(!slot.fire(Ok(())), "second completion must be stale");

        assert!(pending.wait().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_without_armed_slot_is_discarded() {
        let slot = CompletionSlot::<Vec<String>>::new(CommandKind::Unsubscribe);
        assert!(!slot.fire(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_resolver_failure_propagates() {
        let slot = CompletionSlot::<SubscribeAck>::new(CommandKind::Subscribe);
        let pending = slot
            .arm(|_| Err(BridgeError::operation_failed(CommandKind::Subscribe, "nope")))
            .await;
        slot.fire(SubscribeAck::default());

        let error = pending.wait().await.unwrap_err();
        assert!(matches!(
            error,
            BridgeError::OperationFailed {
                command: CommandKind::Subscribe,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_times_out_and_disarms() {
        let slot = CompletionSlot::<Result<(), EngineError>>::new(CommandKind::Connect);
        let pending = slot.arm(|outcome| outcome.map_err(BridgeError::from)).await;

        let error = pending
            .wait_for(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert!(!slot.is_armed());
        assert!(!slot.fire(Ok(())), "late completion is stale");
    }

    #[tokio::test]
    async fn test_dropping_pending_disarms() {
        let slot = CompletionSlot::<Result<(), EngineError>>::new(CommandKind::Disconnect);
        {
            let _pending = slot.arm(|outcome| outcome.map_err(BridgeError::from)).await;
            assert!(slot.is_armed());
        }
        assert!(!slot.is_armed());
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_cancelled() {
        let correlator = CompletionCorrelator::new();
        let pending = correlator
            .publish
            .arm(|outcome| outcome.map_err(BridgeError::from))
            .await;
        correlator.cancel_all();

        let error = pending.wait().await.unwrap_err();
        assert!(matches!(
            error,
            BridgeError::Cancelled {
                command: CommandKind::Publish
            }
        ));
    }

    #[tokio::test]
    async fn test_same_kind_commands_are_serialized() {
        let slot = Arc::new(CompletionSlot::<Result<(), EngineError>>::new(
            CommandKind::Publish,
        ));
        let first = slot.arm(|outcome| outcome.map_err(BridgeError::from)).await;

        let contender = slot.clone();
        let second = tokio::spawn(async move {
            let pending = contender
                .arm(|outcome| outcome.map_err(BridgeError::from))
                .await;
            contender.fire(Ok(()));
            pending.wait().await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second command waits for the gate");

        slot.fire(Ok(()));
        first.wait().await.unwrap();
        second.await.unwrap().unwrap();
    }

    #[test]
    fn test_subscribe_verdict_partial_success() {
        let ack = SubscribeAck {
            granted: strings(&["a", "c"]),
            failed: strings(&["b"]),
        };
        let verdict = subscribe_verdict(&subs(&["a", "b", "c"]), &ack);

        assert!(verdict.succeeded());
        assert_eq!(verdict.granted, strings(&["a", "c"]));
        assert_eq!(verdict.failed, strings(&["b"]));
        assert_eq!(verdict.failure_message(), "Failed to subscribe to topics: b");
    }

    #[test]
    fn test_subscribe_verdict_total_failure() {
        let ack = SubscribeAck {
            granted: vec![],
            failed: strings(&["a", "b"]),
        };
        let verdict = subscribe_verdict(&subs(&["a", "b"]), &ack);
        assert!(!verdict.succeeded());
        assert_eq!(verdict.failed, strings(&["a", "b"]));
    }

    #[test]
    fn test_subscribe_verdict_unreported_topic_fails() {
        let ack = SubscribeAck {
            granted: strings(&["a"]),
            failed: vec![],
        };
        let verdict = subscribe_verdict(&subs(&["a", "b"]), &ack);
        assert!(verdict.succeeded());
        assert_eq!(verdict.failed, strings(&["b"]));
    }

    #[test]
    fn test_unsubscribe_verdict() {
        let requested = strings(&["a", "b", "c"]);

        let all = unsubscribe_verdict(&requested, &strings(&["c", "a", "b"]));
        assert!(all.succeeded());
        assert_eq!(all.confirmed, requested);

        let partial = unsubscribe_verdict(&requested, &strings(&["a"]));
        assert!(!partial.succeeded());
        assert_eq!(partial.failed, strings(&["b", "c"]));
        assert_eq!(
            partial.failure_message(),
            "Failed to unsubscribe from topics: b, c"
        );
    }

    #[test]
    fn test_command_kind_display() {
        assert_eq!(CommandKind::Connect.to_string(), "connect");
        assert_eq!(CommandKind::Unsubscribe.to_string(), "unsubscribe");
    }
}
