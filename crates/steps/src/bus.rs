//! In-process event delivery.
//!
//! Events are named, carry a JSON payload, and are buffered: a payload
//! delivered before anyone waits is held until the first waiter claims it.
//! This matters for client tool results, which can arrive while the waiting
//! run is still being rescheduled.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct Inner {
    /// Payloads delivered with no waiter present.
    pending: HashMap<String, serde_json::Value>,
    waiters: HashMap<String, Vec<oneshot::Sender<serde_json::Value>>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event. Wakes every current waiter for the name; with no
    /// waiter the payload is buffered and the next `wait` claims it.
    pub fn notify(&self, event: &str, payload: serde_json::Value) {
        let mut inner = self.inner.lock();
        if let Some(waiters) = inner.waiters.remove(event) {
            tracing::debug!(event, waiters = waiters.len(), "event delivered");
            for tx in waiters {
                // A dropped receiver means the waiter timed out already.
                let _ = tx.send(payload.clone());
            }
        } else {
            tracing::debug!(event, "event buffered");
            inner.pending.insert(event.to_string(), payload);
        }
    }

    /// Wait until `event` is delivered or `timeout` elapses. Returns `None`
    /// on timeout. A buffered payload is claimed immediately and removed.
    pub async fn wait(
        &self,
        event: &str,
        timeout: std::time::Duration,
    ) -> Option<serde_json::Value> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(payload) = inner.pending.remove(event) {
                return Some(payload);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(event.to_string()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Some(payload),
            _ => {
                let mut inner = self.inner.lock();
                if let Some(ws) = inner.waiters.get_mut(event) {
                    ws.retain(|tx| !tx.is_closed());
                    if ws.is_empty() {
                        inner.waiters.remove(event);
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_waiter() {
        let bus = Arc::new(EventBus::new());
        let b = bus.clone();
        let waiter = tokio::spawn(async move {
            b.wait("resume:s1:m1", Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        bus.notify("resume:s1:m1", serde_json::json!({"done": true}));
        let payload = waiter.await.unwrap().unwrap();
        assert_eq!(payload["done"], true);
    }

    #[tokio::test]
    async fn notify_before_wait_is_buffered() {
        let bus = EventBus::new();
        bus.notify("resume:s1:m1", serde_json::json!(1));
        let payload = bus.wait("resume:s1:m1", Duration::from_millis(10)).await;
        assert_eq!(payload, Some(serde_json::json!(1)));
        // Claimed exactly once.
        assert!(bus.wait("resume:s1:m1", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let bus = EventBus::new();
        let got = bus.wait("never", Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn distinct_events_do_not_cross() {
        let bus = EventBus::new();
        bus.notify("resume:s1:m1", serde_json::json!("a"));
        assert!(bus.wait("resume:s1:m2", Duration::from_millis(10)).await.is_none());
        assert_eq!(
            bus.wait("resume:s1:m1", Duration::from_millis(10)).await,
            Some(serde_json::json!("a"))
        );
    }
}
