use crate::component::Extension;
use crate::error::{Error, Result};
use crate::opamp::spec::CustomMessage;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};

/// Depth of the inbound queue handed to each registration
const INBOUND_QUEUE_DEPTH: usize = 64;

/// A registry of custom capabilities, usually provided by the OpAMP extension of the host.
pub trait CustomCapabilityRegistry: Send + Sync {
    /// Registers interest in `capability`. Every inbound custom message for that capability is
    /// delivered to the returned receiver until the handler is unregistered.
    fn register(&self, capability: &str) -> Result<CapabilityRegistration>;
}

/// Sending side of a capability registration.
pub trait CustomCapabilityHandler: Send + Sync {
    /// Queues one custom message of `message_type` for the control plane
    fn send_message(&self, message_type: &str, data: &[u8]) -> SendResult;
    /// Stops delivery of inbound messages; later sends fail
    fn unregister(&self);
}

pub struct CapabilityRegistration {
    pub messages: mpsc::Receiver<CustomMessage>,
    pub handler: Arc<dyn CustomCapabilityHandler>,
}

/// Outcome of a single send attempt.
pub enum SendResult {
    Sent,
    /// A previous message on the capability has not been flushed yet. Await the handle and
    /// send again.
    Pending(PendingSend),
    Failed(Error),
}

/// Resolves once the in-flight message that blocked a send has been flushed.
pub struct PendingSend {
    ready: oneshot::Receiver<()>,
}

impl PendingSend {
    pub fn new(ready: oneshot::Receiver<()>) -> PendingSend {
        PendingSend { ready }
    }

    /// Waits for the channel to clear. A dropped channel counts as cleared; the next send attempt
    /// reports the real state.
    pub async fn ready(self) {
        let _ = self.ready.await;
    }
}

/// Bounds on the pending-retry loop of [`send_with_retry`].
///
/// Properties:
///
/// * `max_attempts`: stop after this many send attempts that came back pending. `None` retries
/// for as long as the channel keeps reporting pending.
/// * `deadline`: stop when the overall time spent waiting exceeds this duration. `None` waits
/// indefinitely, which blocks the caller for as long as the control plane connection stalls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub deadline: Option<Duration>,
}

/// Sends `data` on `handler`, waiting on the channel signal and retrying whenever the channel
/// reports the message as pending. Hard failures are returned immediately without retrying.
pub async fn send_with_retry(
    handler: &dyn CustomCapabilityHandler,
    message_type: &str,
    data: &[u8],
    policy: &RetryPolicy,
) -> Result<()> {
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let pending = match handler.send_message(message_type, data) {
            SendResult::Sent => return Ok(()),
            SendResult::Failed(e) => return Err(e),
            SendResult::Pending(pending) => pending,
        };

        log::trace!("custom message pending type={} attempt={}", message_type, attempts);
        if matches!(policy.max_attempts, Some(max) if attempts >= max) {
            return Err(Error::SendTimeout { attempts });
        }

        match policy.deadline {
            Some(deadline) => {
                let remaining = deadline
                    .checked_sub(started.elapsed())
                    .ok_or(Error::SendTimeout { attempts })?;
                tokio::time::timeout(remaining, pending.ready())
                    .await
                    .map_err(|_| Error::SendTimeout { attempts })?;
            }
            None => pending.ready().await,
        }
    }
}

#[derive(Default)]
struct CapabilityState {
    subscribers: Vec<(u64, mpsc::Sender<CustomMessage>)>,
    in_flight: Option<CustomMessage>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl CapabilityState {
    fn release_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[derive(Default)]
struct Shared {
    capabilities: Mutex<HashMap<String, CapabilityState>>,
    sent: Notify,
    next_id: AtomicU64,
}

/// An in-process custom capability registry.
///
/// Each capability may have several registrations; inbound messages are fanned out to all of
/// them. Outbound messages behave like the OpAMP client's pending-message slot: one message per
/// capability may be in flight, and further sends report [`SendResult::Pending`] until
/// [`LocalCapabilityRegistry::flush`] takes it.
#[derive(Clone, Default)]
pub struct LocalCapabilityRegistry {
    shared: Arc<Shared>,
}

impl LocalCapabilityRegistry {
    pub fn new() -> LocalCapabilityRegistry {
        LocalCapabilityRegistry::default()
    }

    /// Delivers an inbound message to every registration of its capability and returns how many
    /// received it.
    pub fn deliver(&self, message: CustomMessage) -> usize {
        let mut capabilities = self.shared.capabilities.lock();
        let state = match capabilities.get_mut(&message.capability) {
            Some(state) => state,
            None => {
                log::debug!(
                    "dropping custom message for unregistered capability={}",
                    message.capability
                );
                return 0;
            }
        };

        let mut delivered = 0;
        state.subscribers.retain(|(id, tx)| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "custom message queue full capability={} registration={}",
                    message.capability,
                    id
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Takes the in-flight outbound message of `capability` and releases pending senders.
    pub fn flush(&self, capability: &str) -> Option<CustomMessage> {
        let mut capabilities = self.shared.capabilities.lock();
        let state = capabilities.get_mut(capability)?;
        let message = state.in_flight.take();
        state.release_waiters();
        message
    }

    /// Waits until a message is in flight on `capability` and flushes it.
    pub async fn next_outbound(&self, capability: &str) -> CustomMessage {
        loop {
            let notified = self.shared.sent.notified();
            if let Some(message) = self.flush(capability) {
                return message;
            }
            notified.await;
        }
    }

    pub fn is_registered(&self, capability: &str) -> bool {
        self.shared
            .capabilities
            .lock()
            .get(capability)
            .map(|state| !state.subscribers.is_empty())
            .unwrap_or(false)
    }
}

impl CustomCapabilityRegistry for LocalCapabilityRegistry {
    fn register(&self, capability: &str) -> Result<CapabilityRegistration> {
        if capability.is_empty() {
            return Err(Error::Capability("capability name is empty".to_string()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.shared
            .capabilities
            .lock()
            .entry(capability.to_string())
            .or_default()
            .subscribers
            .push((id, tx));
        log::debug!("registered capability={} registration={}", capability, id);

        Ok(CapabilityRegistration {
            messages: rx,
            handler: Arc::new(LocalCapabilityHandler {
                capability: capability.to_string(),
                id,
                shared: self.shared.clone(),
            }),
        })
    }
}

impl Extension for LocalCapabilityRegistry {
    fn as_capability_registry(&self) -> Option<Arc<dyn CustomCapabilityRegistry>> {
        Some(Arc::new(self.clone()))
    }
}

struct LocalCapabilityHandler {
    capability: String,
    id: u64,
    shared: Arc<Shared>,
}

impl CustomCapabilityHandler for LocalCapabilityHandler {
    fn send_message(&self, message_type: &str, data: &[u8]) -> SendResult {
        let mut capabilities = self.shared.capabilities.lock();
        let state = match capabilities.get_mut(&self.capability) {
            Some(state) if state.subscribers.iter().any(|(id, _)| *id == self.id) => state,
            _ => {
                return SendResult::Failed(Error::Capability(format!(
                    "capability {} is not registered",
                    self.capability
                )))
            }
        };

        if state.in_flight.is_some() {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            return SendResult::Pending(PendingSend::new(rx));
        }

        state.in_flight = Some(CustomMessage {
            capability: self.capability.clone(),
            r#type: message_type.to_string(),
            data: data.to_vec(),
        });
        drop(capabilities);
        self.shared.sent.notify_waiters();
        SendResult::Sent
    }

    fn unregister(&self) {
        let mut capabilities = self.shared.capabilities.lock();
        if let Some(state) = capabilities.get_mut(&self.capability) {
            state.subscribers.retain(|(id, _)| *id != self.id);
            if state.subscribers.is_empty() {
                state.release_waiters();
                capabilities.remove(&self.capability);
            }
        }
        log::debug!(
            "unregistered capability={} registration={}",
            self.capability,
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(capability: &str, kind: &str) -> CustomMessage {
        CustomMessage {
            capability: capability.to_string(),
            r#type: kind.to_string(),
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn fan_out_to_registrations() {
        let registry = LocalCapabilityRegistry::new();
        let mut a = registry.register("com.bindplane.snapshot").unwrap();
        let mut b = registry.register("com.bindplane.snapshot").unwrap();

        assert_eq!(registry.deliver(inbound("com.bindplane.snapshot", "requestSnapshot")), 2);
        assert_eq!(registry.deliver(inbound("com.other", "x")), 0);
        assert_eq!(a.messages.recv().await.unwrap().r#type, "requestSnapshot");
        assert_eq!(b.messages.recv().await.unwrap().r#type, "requestSnapshot");
    }

    #[tokio::test]
    async fn second_send_is_pending_until_flush() {
        let registry = LocalCapabilityRegistry::new();
        let reg = registry.register("cap").unwrap();

        assert!(matches!(reg.handler.send_message("t", b"1"), SendResult::Sent));
        let pending = match reg.handler.send_message("t", b"2") {
            SendResult::Pending(p) => p,
            _ => panic!("expected pending"),
        };

        let first = registry.flush("cap").unwrap();
        assert_eq!(first.data, b"1");
        pending.ready().await;
        assert!(matches!(reg.handler.send_message("t", b"2"), SendResult::Sent));
    }

    #[tokio::test]
    async fn retry_loop_waits_for_flush() {
        let registry = LocalCapabilityRegistry::new();
        let reg = registry.register("cap").unwrap();
        assert!(matches!(reg.handler.send_message("t", b"first"), SendResult::Sent));

        let handler = reg.handler.clone();
        let task = tokio::spawn(async move {
            send_with_retry(handler.as_ref(), "t", b"second", &RetryPolicy::default()).await
        });

        assert_eq!(registry.next_outbound("cap").await.data, b"first");
        task.await.unwrap().unwrap();
        assert_eq!(registry.next_outbound("cap").await.data, b"second");
    }

    #[tokio::test]
    async fn retry_loop_honours_attempt_cap() {
        let registry = LocalCapabilityRegistry::new();
        let reg = registry.register("cap").unwrap();
        assert!(matches!(reg.handler.send_message("t", b"first"), SendResult::Sent));

        let policy = RetryPolicy {
            max_attempts: Some(1),
            deadline: None,
        };
        let err = send_with_retry(reg.handler.as_ref(), "t", b"x", &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendTimeout { attempts: 1 }));
    }

    #[tokio::test]
    async fn retry_loop_honours_deadline() {
        let registry = LocalCapabilityRegistry::new();
        let reg = registry.register("cap").unwrap();
        assert!(matches!(reg.handler.send_message("t", b"first"), SendResult::Sent));

        let policy = RetryPolicy {
            max_attempts: None,
            deadline: Some(Duration::from_millis(20)),
        };
        let err = send_with_retry(reg.handler.as_ref(), "t", b"x", &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendTimeout { .. }));
    }

    #[tokio::test]
    async fn unregistered_handler_fails() {
        let registry = LocalCapabilityRegistry::new();
        let reg = registry.register("cap").unwrap();
        reg.handler.unregister();
        assert!(!registry.is_registered("cap"));
        assert!(matches!(
            reg.handler.send_message("t", b"x"),
            SendResult::Failed(_)
        ));
    }

    #[test]
    fn retry_policy_from_yaml() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5\ndeadline: 30s").unwrap();
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.deadline, Some(Duration::from_secs(30)));
        assert_eq!(
            serde_yaml::from_str::<RetryPolicy>("{}").unwrap(),
            RetryPolicy::default()
        );
    }
}
