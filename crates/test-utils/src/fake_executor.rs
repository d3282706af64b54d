use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;

use runweave::dag::ScheduledTask;
use runweave::exec::{ExecFuture, TaskExecutor, TaskOutcome};

/// One recorded call of the fake executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub key: String,
    pub attempt: u32,
    pub answer: Option<Value>,
}

/// A fake executor that:
/// - records every call (key, attempt, answer)
/// - answers from a per-key script of outcomes, then succeeds with
///   `{"key": .., "answer": ..}`
/// - optionally holds a task until its gate is opened
/// - tracks the peak number of concurrent calls
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<TaskOutcome>>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Outcomes for the next attempts of `key`, in order.
    pub fn script(self, key: &str, outcomes: impl IntoIterator<Item = TaskOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Calls for `key` block until a permit is added to the returned gate.
    pub fn gate(&self, key: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.key).collect()
    }

    pub fn attempts(&self, key: &str) -> usize {
        self.calls().iter().filter(|c| c.key == key).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, task: &ScheduledTask) -> TaskOutcome {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task.key)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            TaskOutcome::Success(json!({ "key": task.key, "answer": task.answer }))
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _in_flight = InFlight(&self.in_flight);

            self.calls.lock().unwrap().push(Call {
                key: task.key.clone(),
                attempt: task.attempt,
                answer: task.answer.clone(),
            });

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let gate = self.gates.lock().unwrap().get(&task.key).cloned();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            self.next_outcome(&task)
        })
    }
}
