//! The step runner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use relay_domain::{Error, Result};

use crate::bus::EventBus;
use crate::log::StepLog;

/// Executes named steps for one workflow run, memoizing each outcome.
///
/// Step keys must be deterministic across replays of the same run; the
/// engine derives them from the round number and tool call ids, never from
/// timestamps or random values.
#[derive(Clone)]
pub struct StepRunner {
    run_id: String,
    log: Arc<dyn StepLog>,
    bus: Arc<EventBus>,
}

impl StepRunner {
    pub fn new(run_id: impl Into<String>, log: Arc<dyn StepLog>, bus: Arc<EventBus>) -> Self {
        Self {
            run_id: run_id.into(),
            log,
            bus,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Execute `f` once per `(run, key)`. A recorded outcome is returned
    /// without executing `f`; otherwise `f` runs and its output is recorded
    /// before being returned. Errors are not recorded, so a failed step
    /// executes again on the next attempt.
    pub async fn run<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.log.load(&self.run_id, key).await? {
            tracing::debug!(run_id = %self.run_id, step = key, "step replayed");
            return serde_json::from_value(cached)
                .map_err(|e| Error::Step(format!("corrupt record for step {key}: {e}")));
        }

        tracing::debug!(run_id = %self.run_id, step = key, "step executing");
        let out = f().await?;
        let value = serde_json::to_value(&out)?;
        self.log.record(&self.run_id, key, value).await?;
        Ok(out)
    }

    /// Suspend until `event` is delivered or `timeout` elapses, memoized
    /// under `key`. Returns the payload, or `None` on timeout. On replay the
    /// recorded outcome is returned without waiting, including a recorded
    /// timeout.
    pub async fn wait_for_event(
        &self,
        key: &str,
        event: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>> {
        if let Some(cached) = self.log.load(&self.run_id, key).await? {
            tracing::debug!(run_id = %self.run_id, step = key, "wait replayed");
            return Ok(serde_json::from_value(cached)
                .map_err(|e| Error::Step(format!("corrupt record for step {key}: {e}")))?);
        }

        tracing::info!(run_id = %self.run_id, step = key, event, "run suspended");
        let outcome = self.bus.wait(event, timeout).await;
        if outcome.is_none() {
            tracing::warn!(run_id = %self.run_id, step = key, event, "wait timed out");
        }
        self.log
            .record(&self.run_id, key, serde_json::to_value(&outcome)?)
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryStepLog;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(log: Arc<MemoryStepLog>, bus: Arc<EventBus>) -> StepRunner {
        StepRunner::new("run-1", log, bus)
    }

    #[tokio::test]
    async fn step_executes_once_across_replays() {
        let log = Arc::new(MemoryStepLog::new());
        let bus = Arc::new(EventBus::new());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let r = runner(log.clone(), bus.clone());
            let out: u32 = r
                .run("round-0-call-llm", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(out, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_execute_independently() {
        let log = Arc::new(MemoryStepLog::new());
        let bus = Arc::new(EventBus::new());
        let r = runner(log, bus);

        let a: String = r.run("round-0-call-llm", || async { Ok("a".to_string()) }).await.unwrap();
        let b: String = r.run("round-1-call-llm", || async { Ok("b".to_string()) }).await.unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
    }

    #[tokio::test]
    async fn failed_step_retries_on_next_attempt() {
        let log = Arc::new(MemoryStepLog::new());
        let bus = Arc::new(EventBus::new());
        let calls = AtomicU32::new(0);

        let r = runner(log.clone(), bus.clone());
        let first: Result<u32> = r
            .run("round-0-deduct", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Other("transient".into()))
            })
            .await;
        assert!(first.is_err());

        let r = runner(log, bus);
        let second: u32 = r
            .run("round-0-deduct", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await
            .unwrap();
        assert_eq!(second, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_resumes_on_notify_and_replays_recorded_payload() {
        let log = Arc::new(MemoryStepLog::new());
        let bus = Arc::new(EventBus::new());

        let r = runner(log.clone(), bus.clone());
        let b = bus.clone();
        let waiter = tokio::spawn(async move {
            r.wait_for_event("round-1-wait-client", "resume:s1:m1", Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        b.notify("resume:s1:m1", serde_json::json!({"c1": "picked.txt"}));
        let payload = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(payload["c1"], "picked.txt");

        // Replay returns the recorded payload without touching the bus.
        let r = runner(log, bus);
        let replayed = r
            .wait_for_event("round-1-wait-client", "resume:s1:m1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed["c1"], "picked.txt");
    }

    #[tokio::test]
    async fn wait_timeout_is_recorded() {
        let log = Arc::new(MemoryStepLog::new());
        let bus = Arc::new(EventBus::new());

        let r = runner(log.clone(), bus.clone());
        let got = r
            .wait_for_event("round-1-wait-client", "resume:s1:m1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());

        // The timeout itself replays. Deliver the event afterwards and the
        // replayed wait must still be a timeout.
        bus.notify("resume:s1:m1", serde_json::json!("late"));
        let r = runner(log, bus);
        let replayed = r
            .wait_for_event("round-1-wait-client", "resume:s1:m1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(replayed.is_none());
    }
}
