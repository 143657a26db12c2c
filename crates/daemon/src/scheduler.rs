//! Scheduler — translates time into dispatch.
//!
//! A single polling loop wakes every second, asks the store for due
//! pulses, claims a bounded number of them through the atomic
//! `mark_processing` guard, and spawns one execution task per claim.
//! Execution tasks never block the loop; the loop never dies except on
//! the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use reeve_domain::pulse::{truncate, Pulse};

use crate::executor::{AgentRunner, PulseExecutor};
use crate::sentinel::{Sentinel, DEFAULT_COOLDOWN_SECS};
use crate::store::{PulseStore, StoreError};

/// Poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Back-off after an unexpected loop error (store unreachable, etc.).
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Upper bound on pulses fetched per tick, regardless of free slots.
const FETCH_CAP: usize = 10;

pub struct Scheduler {
    store: PulseStore,
    runner: Arc<dyn AgentRunner>,
    sentinel: Arc<Sentinel>,
    max_concurrent: usize,
    in_flight: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: PulseStore,
        runner: Arc<dyn AgentRunner>,
        sentinel: Arc<Sentinel>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            runner,
            sentinel,
            max_concurrent: max_concurrent.max(1),
            in_flight: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Run the polling loop until `shutdown` fires. Loop errors are logged
    /// and backed off, never fatal.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(max_concurrent = self.max_concurrent, "scheduler loop started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = match self.tick().await {
                Ok(()) => POLL_INTERVAL,
                Err(e) => {
                    tracing::error!(error = %e, "scheduler tick failed, backing off");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("scheduler loop stopped");
    }

    /// One poll cycle: prune finished tasks, claim up to the free slot
    /// count, spawn executions.
    pub async fn tick(&self) -> Result<(), StoreError> {
        let running = self.prune_in_flight();
        let available = self.max_concurrent.saturating_sub(running);
        if available == 0 {
            tracing::debug!(running, max = self.max_concurrent, "at capacity, waiting");
            return Ok(());
        }

        let batch = self.store.get_due(FETCH_CAP.min(available) as i64).await?;

        for pulse in batch {
            // Atomic claim. Losing the race is expected, not an error.
            if !self.store.mark_processing(pulse.id).await? {
                tracing::warn!(pulse_id = pulse.id, "pulse no longer claimable, skipping");
                continue;
            }

            let store = self.store.clone();
            let runner = self.runner.clone();
            let sentinel = self.sentinel.clone();
            let handle = tokio::spawn(async move {
                execute_pulse(store, runner, sentinel, pulse).await;
            });
            self.in_flight.lock().push(handle);
        }

        Ok(())
    }

    /// Drop finished handles; return the number still running.
    fn prune_in_flight(&self) -> usize {
        let mut handles = self.in_flight.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Currently running execution tasks.
    pub fn in_flight(&self) -> usize {
        self.prune_in_flight()
    }

    /// Wait up to `grace` for in-flight executions, then abort stragglers.
    /// Aborted pulses remain PROCESSING; operators recover them by
    /// inspection.
    pub async fn drain(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
        let waiting = handles.iter().filter(|h| !h.is_finished()).count();
        if waiting == 0 {
            return;
        }

        tracing::info!(count = waiting, "waiting for in-flight pulses to complete");
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(count = aborted, "force-cancelled executions; pulses left PROCESSING");
        } else {
            tracing::info!("all in-flight pulses completed");
        }
    }
}

/// One execution task: build the prompt, run the agent, record the
/// terminal transition, and raise the sentinel when the retry budget is
/// gone. Never panics the scheduler.
async fn execute_pulse(
    store: PulseStore,
    runner: Arc<dyn AgentRunner>,
    sentinel: Arc<Sentinel>,
    pulse: Pulse,
) {
    let start = tokio::time::Instant::now();
    tracing::info!(
        pulse_id = pulse.id,
        priority = %pulse.priority,
        prompt = %truncate(&pulse.prompt, 50),
        "executing pulse"
    );

    let full_prompt = PulseExecutor::build_prompt(&pulse.prompt, pulse.sticky_notes.as_deref());

    match runner.run(&full_prompt, pulse.session_id.as_deref()).await {
        Ok(output) => {
            let duration_ms = start.elapsed().as_millis() as i64;
            if let Err(e) = store.mark_completed(pulse.id, duration_ms).await {
                tracing::error!(pulse_id = pulse.id, error = %e, "recording completion failed");
                return;
            }
            tracing::info!(
                pulse_id = pulse.id,
                duration_ms,
                session_id = output.session_id.as_deref().unwrap_or("-"),
                "pulse completed"
            );
        }
        Err(err) => {
            let error_message = err.to_string();
            tracing::error!(pulse_id = pulse.id, error = %error_message, "pulse failed");

            match store.mark_failed(pulse.id, &error_message, true).await {
                Ok(Some(retry_id)) => {
                    tracing::info!(pulse_id = pulse.id, retry_id, "scheduled retry pulse");
                }
                Ok(None) => {
                    tracing::error!(pulse_id = pulse.id, "retry budget exhausted, raising sentinel");
                    raise_sentinel(sentinel, pulse.id, &error_message).await;
                }
                Err(e) => {
                    tracing::error!(pulse_id = pulse.id, error = %e, "recording failure failed");
                }
            }
        }
    }
}

/// Fire the failsafe alert off the async runtime. Any sentinel fault is
/// swallowed; the scheduler must outlive its alert channel.
async fn raise_sentinel(sentinel: Arc<Sentinel>, pulse_id: i64, error_message: &str) {
    let message = format!("Reeve pulse {pulse_id} failed permanently: {error_message}");
    let delivered = tokio::task::spawn_blocking(move || {
        sentinel.alert(
            &message,
            Some(&format!("pulse_failed_{pulse_id}")),
            DEFAULT_COOLDOWN_SECS,
        )
    })
    .await
    .unwrap_or(false);

    if !delivered {
        tracing::warn!(pulse_id, "sentinel alert not delivered");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::executor::{ExecError, ExecutionOutput};
    use crate::sentinel::backends::AlertBackend;
    use reeve_domain::pulse::{NewPulse, PulseStatus};

    struct MockRunner {
        fail: bool,
        delay: Duration,
        calls: Arc<parking_lot::Mutex<Vec<(String, Option<String>)>>>,
    }

    impl MockRunner {
        fn ok() -> Self {
            Self {
                fail: false,
                delay: Duration::ZERO,
                calls: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }
        fn failing() -> Self {
            Self { fail: true, ..Self::ok() }
        }
        fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::ok() }
        }
    }

    #[async_trait]
    impl AgentRunner for MockRunner {
        async fn run(
            &self,
            prompt: &str,
            session_id: Option<&str>,
        ) -> Result<ExecutionOutput, ExecError> {
            self.calls
                .lock()
                .push((prompt.to_string(), session_id.map(String::from)));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(ExecError::Stream("mock agent failure".to_string()))
            } else {
                Ok(ExecutionOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    return_code: 0,
                    timed_out: false,
                    session_id: Some("sess-mock".to_string()),
                })
            }
        }
    }

    struct CountingBackend {
        sent: Arc<AtomicUsize>,
        last: Arc<parking_lot::Mutex<Option<String>>>,
    }

    impl AlertBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn send(&self, message: &str) -> bool {
            self.sent.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(message.to_string());
            true
        }
    }

    struct Harness {
        store: PulseStore,
        scheduler: Scheduler,
        alerts: Arc<AtomicUsize>,
        last_alert: Arc<parking_lot::Mutex<Option<String>>>,
        _state_dir: tempfile::TempDir,
    }

    async fn harness(runner: MockRunner, max_concurrent: usize) -> Harness {
        let store = PulseStore::open_in_memory().await.unwrap();
        let alerts = Arc::new(AtomicUsize::new(0));
        let last_alert = Arc::new(parking_lot::Mutex::new(None));
        let state_dir = tempfile::tempdir().unwrap();
        let sentinel = Sentinel::with_backend(
            Box::new(CountingBackend { sent: alerts.clone(), last: last_alert.clone() }),
            state_dir.path(),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(runner),
            Arc::new(sentinel),
            max_concurrent,
        );
        Harness { store, scheduler, alerts, last_alert, _state_dir: state_dir }
    }

    async fn settle(scheduler: &Scheduler) {
        // Execution tasks are spawned; give them a moment to finish.
        for _ in 0..50 {
            if scheduler.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("in-flight executions did not settle");
    }

    fn due_pulse(prompt: &str) -> NewPulse {
        NewPulse::new(Utc::now() - ChronoDuration::minutes(1), prompt)
    }

    #[tokio::test]
    async fn tick_completes_due_pulse() {
        let h = harness(MockRunner::ok(), 5).await;
        let id = h.store.schedule(due_pulse("say good morning")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        settle(&h.scheduler).await;

        let pulse = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(pulse.status, PulseStatus::Completed);
        assert!(pulse.execution_duration_ms.is_some());
        assert_eq!(h.alerts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execution_prompt_includes_sticky_notes_and_session() {
        let runner = MockRunner::ok();
        let calls = runner.calls.clone();
        let h = harness(runner, 5).await;

        let mut new = due_pulse("morning briefing now");
        new.sticky_notes = Some(vec!["water the plants".into()]);
        new.session_id = Some("sess-77".into());
        h.store.schedule(new).await.unwrap();

        h.scheduler.tick().await.unwrap();
        settle(&h.scheduler).await;

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        let (prompt, session) = &calls[0];
        assert!(prompt.starts_with("morning briefing now"));
        assert!(prompt.contains("📌 Reminders:"));
        assert!(prompt.contains("  - water the plants"));
        assert_eq!(session.as_deref(), Some("sess-77"));
    }

    #[tokio::test]
    async fn failure_schedules_retry_without_alert() {
        let h = harness(MockRunner::failing(), 5).await;
        let id = h.store.schedule(due_pulse("this will fail")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        settle(&h.scheduler).await;

        let parent = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(parent.status, PulseStatus::Failed);
        assert!(parent.error_message.as_deref().unwrap().contains("mock agent failure"));

        let retry = h.store.get(id + 1).await.unwrap().expect("retry pulse inserted");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, PulseStatus::Pending);

        // Budget remains: silent to the user.
        assert_eq!(h.alerts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_raises_one_sentinel_alert() {
        let h = harness(MockRunner::failing(), 5).await;
        let mut new = due_pulse("always failing pulse");
        new.max_retries = 0;
        let id = h.store.schedule(new).await.unwrap();

        h.scheduler.tick().await.unwrap();
        settle(&h.scheduler).await;

        let pulse = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(pulse.status, PulseStatus::Failed);
        assert_eq!(h.alerts.load(Ordering::SeqCst), 1);
        let message = h.last_alert.lock().clone().unwrap();
        assert!(message.contains(&id.to_string()));
        assert!(message.contains("mock agent failure"));

        // Re-failing the same pulse id within the cooldown stays quiet.
        raise_sentinel(
            Arc::new(Sentinel::with_backend(
                Box::new(CountingBackend { sent: h.alerts.clone(), last: h.last_alert.clone() }),
                h._state_dir.path(),
            )),
            id,
            "same pulse",
        )
        .await;
        assert_eq!(h.alerts.load(Ordering::SeqCst), 1, "cooldown suppresses the repeat");
    }

    #[tokio::test]
    async fn concurrency_bound_limits_claims() {
        let h = harness(MockRunner::slow(Duration::from_millis(250)), 1).await;
        h.store.schedule(due_pulse("first slow pulse")).await.unwrap();
        h.store.schedule(due_pulse("second slow pulse")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.in_flight(), 1, "only one slot available");

        // Second tick while the slot is busy claims nothing.
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.in_flight(), 1);

        let processing = h
            .store
            .get_by_status(reeve_domain::pulse::StatusFilter::Status(PulseStatus::Processing), 10)
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);

        settle(&h.scheduler).await;
        h.scheduler.tick().await.unwrap();
        settle(&h.scheduler).await;

        let pending = h.store.get_due(10).await.unwrap();
        assert!(pending.is_empty(), "both pulses eventually dispatched");
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_work() {
        let h = harness(MockRunner::slow(Duration::from_millis(150)), 5).await;
        let id = h.store.schedule(due_pulse("slow but finishes")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.in_flight(), 1);

        h.scheduler.drain(Duration::from_secs(5)).await;

        let pulse = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(pulse.status, PulseStatus::Completed, "drain waited for completion");
    }

    #[tokio::test]
    async fn drain_aborts_past_grace() {
        let h = harness(MockRunner::slow(Duration::from_secs(60)), 5).await;
        let id = h.store.schedule(due_pulse("runs far too long")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        h.scheduler.drain(Duration::from_millis(100)).await;

        // Force-cancelled mid-execution: left PROCESSING by design.
        let pulse = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(pulse.status, PulseStatus::Processing);
        assert_eq!(h.scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let h = harness(MockRunner::ok(), 5).await;
        let token = CancellationToken::new();
        let scheduler = h.scheduler;

        let token_clone = token.clone();
        let run = tokio::spawn(async move { scheduler.run(token_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("loop exits promptly")
            .unwrap();
    }
}
