//! Subscription scheduler task
//!
//! One long-lived task owns every registered subscription. Everything else
//! talks to it through [`SchedulerHandle`] messages, so the registry is
//! never shared behind a lock.
//!
//! ## Tick
//!
//! 1. Skip the tick if the previous one is still running
//! 2. Collect due subscriptions: schedules matching the clock (at most once
//!    per second), data-insert triggers marked by a capture (or freshly
//!    registered) and past their retry delay
//! 3. Evaluate them concurrently, bounded by a semaphore
//! 4. Fold the outcomes back into the trigger state
//!
//! Removal drops a subscription at once, but the caller's reply waits for
//! the running tick so nothing fires after removal completed.

use super::backoff::RetryBackoff;
use super::runner::{RunOutcome, SubscriptionRunner};
use crate::config::RepositoryConfig;
use crate::error::{EpcisError, Result, SubscriptionRunError};
use crate::model::{Subscription, SubscriptionTrigger};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};

/// Source of "now" for schedule matching
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrency: usize,
    pub channel_buffer: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub retry_limit: Option<u32>,
}

impl From<&RepositoryConfig> for SchedulerConfig {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_concurrency: config.max_concurrency,
            channel_buffer: config.channel_buffer,
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
            retry_limit: config.retry_limit,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&RepositoryConfig::default())
    }
}

enum Command {
    Register(Subscription, oneshot::Sender<()>),
    Remove(String, oneshot::Sender<bool>),
    List(oneshot::Sender<Vec<String>>),
    CaptureCommitted(i64),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door of the scheduler task
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

fn unavailable() -> EpcisError {
    EpcisError::Internal("subscription scheduler is not running".to_string())
}

impl SchedulerHandle {
    pub async fn register(&self, subscription: Subscription) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Register(subscription, reply))
            .await
            .map_err(|_| unavailable())?;
        done.await.map_err(|_| unavailable())
    }

    /// Returns once the subscription can no longer fire; `false` if unknown
    pub async fn remove(&self, subscription_id: &str) -> Result<bool> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Remove(subscription_id.to_string(), reply))
            .await
            .map_err(|_| unavailable())?;
        done.await.map_err(|_| unavailable())
    }

    /// Registered subscription ids, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::List(reply))
            .await
            .map_err(|_| unavailable())?;
        done.await.map_err(|_| unavailable())
    }

    /// Marks data-insert subscriptions due; never fails the capture
    pub async fn notify_capture(&self, request_id: i64) {
        if self
            .commands
            .send(Command::CaptureCommitted(request_id))
            .await
            .is_err()
        {
            log::warn!("⚠️  Scheduler not running, capture {} not signalled", request_id);
        }
    }

    /// Stops the task after the running tick, if any, has finished
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| unavailable())?;
        done.await.map_err(|_| unavailable())
    }
}

/// Retry state of a data-insert subscription
#[derive(Debug)]
struct TriggerState {
    due: bool,
    next_attempt: Option<DateTime<Utc>>,
    backoff: RetryBackoff,
}

struct Entry {
    subscription: Arc<Subscription>,
    removed: Arc<AtomicBool>,
    last_fired_second: Option<i64>,
    trigger: Option<TriggerState>,
}

struct DueSubscription {
    subscription: Arc<Subscription>,
    removed: Arc<AtomicBool>,
}

enum Evaluation {
    Ran(std::result::Result<RunOutcome, SubscriptionRunError>),
    /// Removed before its evaluation started
    Skipped,
}

/// Outcome of one evaluation, tied to the entry that was evaluated
struct Evaluated {
    subscription_id: String,
    removed: Arc<AtomicBool>,
    evaluation: Evaluation,
}

type TickReport = Vec<Evaluated>;

pub struct SubscriptionScheduler {
    config: SchedulerConfig,
    runner: Arc<dyn SubscriptionRunner>,
    clock: Clock,
    entries: HashMap<String, Entry>,
}

impl SubscriptionScheduler {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn SubscriptionRunner>) -> Self {
        Self::with_clock(config, runner, system_clock())
    }

    pub fn with_clock(config: SchedulerConfig, runner: Arc<dyn SubscriptionRunner>, clock: Clock) -> Self {
        Self {
            config,
            runner,
            clock,
            entries: HashMap::new(),
        }
    }

    /// Start the owner task with the persisted subscriptions
    pub fn spawn(mut self, subscriptions: Vec<Subscription>) -> (SchedulerHandle, JoinHandle<()>) {
        for subscription in subscriptions {
            self.insert(subscription);
        }

        let (commands, receiver) = mpsc::channel(self.config.channel_buffer.max(1));
        let task = tokio::spawn(self.run(receiver));
        (SchedulerHandle { commands }, task)
    }

    fn insert(&mut self, subscription: Subscription) {
        let trigger = match subscription.trigger {
            // Starts due so requests left pending before a restart or marked
            // by an initial record time are delivered without a new capture
            SubscriptionTrigger::DataInsert(_) => Some(TriggerState {
                due: true,
                next_attempt: None,
                backoff: RetryBackoff::new(
                    self.config.retry_initial,
                    self.config.retry_max,
                    self.config.retry_limit,
                ),
            }),
            SubscriptionTrigger::Schedule(_) => None,
        };

        let entry = Entry {
            subscription: Arc::new(subscription),
            removed: Arc::new(AtomicBool::new(false)),
            last_fired_second: None,
            trigger,
        };
        let subscription_id = entry.subscription.subscription_id.clone();
        if let Some(replaced) = self.entries.insert(subscription_id, entry) {
            replaced.removed.store(true, Ordering::SeqCst);
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        log::info!(
            "⏰ Starting subscription scheduler ({} subscriptions, interval: {}ms)",
            self.entries.len(),
            self.config.tick_interval.as_millis()
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<JoinHandle<TickReport>> = None;
        let mut removals_waiting: Vec<oneshot::Sender<bool>> = Vec::new();
        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;
        let mut stopping = false;

        loop {
            tokio::select! {
                command = commands.recv(), if !stopping => match command {
                    Some(Command::Register(subscription, reply)) => {
                        log::info!("➕ Registered subscription {}", subscription.subscription_id);
                        self.insert(subscription);
                        let _ = reply.send(());
                    }
                    Some(Command::Remove(subscription_id, reply)) => {
                        match self.entries.remove(&subscription_id) {
                            Some(entry) => {
                                entry.removed.store(true, Ordering::SeqCst);
                                log::info!("➖ Removed subscription {}", subscription_id);
                                if in_flight.is_some() {
                                    removals_waiting.push(reply);
                                } else {
                                    let _ = reply.send(true);
                                }
                            }
                            None => {
                                let _ = reply.send(false);
                            }
                        }
                    }
                    Some(Command::List(reply)) => {
                        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
                        ids.sort();
                        let _ = reply.send(ids);
                    }
                    Some(Command::CaptureCommitted(request_id)) => {
                        self.mark_triggers_due(request_id);
                    }
                    Some(Command::Shutdown(reply)) => {
                        stopping = true;
                        shutdown_reply = Some(reply);
                    }
                    None => stopping = true,
                },
                _ = ticker.tick(), if !stopping => {
                    if in_flight.is_some() {
                        log::debug!("⏭️  Previous tick still running, skipping");
                    } else {
                        in_flight = self.start_tick();
                    }
                }
                report = wait_for(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match report {
                        Some(Ok(report)) => self.apply(report),
                        Some(Err(e)) => log::error!("❌ Subscription tick failed: {}", e),
                        None => {}
                    }
                    for reply in removals_waiting.drain(..) {
                        let _ = reply.send(true);
                    }
                }
            }

            if stopping && in_flight.is_none() {
                break;
            }
        }

        for reply in removals_waiting.drain(..) {
            let _ = reply.send(true);
        }
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        log::info!("🛑 Subscription scheduler stopped");
    }

    fn mark_triggers_due(&mut self, request_id: i64) {
        let mut marked = 0;
        for trigger in self.entries.values_mut().filter_map(|e| e.trigger.as_mut()) {
            if !trigger.due {
                // A fresh capture re-arms a trigger whose retries were spent
                trigger.due = true;
                marked += 1;
            }
        }
        log::debug!("📥 Capture {} marked {} triggers due", request_id, marked);
    }

    fn start_tick(&mut self) -> Option<JoinHandle<TickReport>> {
        let now = (self.clock)();
        let second = now.timestamp();
        let mut due = Vec::new();

        for entry in self.entries.values_mut() {
            if !entry.subscription.active {
                continue;
            }

            let fire = match (&entry.subscription.trigger, entry.trigger.as_mut()) {
                (SubscriptionTrigger::Schedule(schedule), _) => {
                    schedule.matches(now) && entry.last_fired_second != Some(second)
                }
                (SubscriptionTrigger::DataInsert(_), Some(trigger)) => {
                    let ready = trigger.next_attempt.map_or(true, |at| now >= at);
                    if trigger.due && ready {
                        trigger.due = false;
                        true
                    } else {
                        false
                    }
                }
                (SubscriptionTrigger::DataInsert(_), None) => false,
            };

            if fire {
                entry.last_fired_second = Some(second);
                due.push(DueSubscription {
                    subscription: entry.subscription.clone(),
                    removed: entry.removed.clone(),
                });
            }
        }

        if due.is_empty() {
            return None;
        }

        log::debug!("🔔 Tick at {}: {} subscriptions due", now, due.len());
        Some(tokio::spawn(evaluate(
            due,
            self.runner.clone(),
            self.config.max_concurrency,
        )))
    }

    fn apply(&mut self, report: TickReport) {
        let now = (self.clock)();

        for Evaluated {
            subscription_id,
            removed,
            evaluation,
        } in report
        {
            let result = match evaluation {
                Evaluation::Ran(result) => result,
                Evaluation::Skipped => continue,
            };

            // A re-registered id is a new entry and starts with fresh state
            let Some(entry) = self
                .entries
                .get_mut(&subscription_id)
                .filter(|entry| Arc::ptr_eq(&entry.removed, &removed))
            else {
                continue;
            };

            match result {
                Ok(outcome) => {
                    log::debug!("✅ Subscription {}: {:?}", subscription_id, outcome);
                    if let Some(trigger) = entry.trigger.as_mut() {
                        trigger.backoff.reset();
                        trigger.next_attempt = None;
                    }
                }
                Err(e) => {
                    log::warn!("⚠️  Subscription {} failed, data stays pending: {}", subscription_id, e);
                    if let Some(trigger) = entry.trigger.as_mut() {
                        match trigger.backoff.record_failure(now) {
                            Some(next_attempt) => {
                                trigger.due = true;
                                trigger.next_attempt = Some(next_attempt);
                            }
                            None => {
                                log::warn!(
                                    "⛔ Subscription {} gave up until the next capture",
                                    subscription_id
                                );
                                trigger.due = false;
                                trigger.next_attempt = None;
                                trigger.backoff.reset();
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn wait_for(tick: &mut Option<JoinHandle<TickReport>>) -> Option<std::result::Result<TickReport, JoinError>> {
    match tick {
        Some(handle) => Some(handle.await),
        None => None,
    }
}

/// Evaluate due subscriptions with at most `max_concurrency` in parallel
async fn evaluate(
    due: Vec<DueSubscription>,
    runner: Arc<dyn SubscriptionRunner>,
    max_concurrency: usize,
) -> TickReport {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for item in due {
        let semaphore = semaphore.clone();
        let runner = runner.clone();
        tasks.spawn(async move {
            let evaluation = match semaphore.acquire_owned().await {
                Ok(_permit) if !item.removed.load(Ordering::SeqCst) => {
                    Evaluation::Ran(runner.run(&item.subscription).await)
                }
                _ => Evaluation::Skipped,
            };
            Evaluated {
                subscription_id: item.subscription.subscription_id.clone(),
                removed: item.removed,
                evaluation,
            }
        });
    }

    let mut report = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(evaluation) => report.push(evaluation),
            Err(e) => log::error!("❌ Subscription evaluation panicked: {}", e),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuerySchedule;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(5),
            max_concurrency: 4,
            channel_buffer: 16,
            retry_initial: Duration::from_millis(0),
            retry_max: Duration::from_millis(0),
            retry_limit: None,
        }
    }

    /// Counts runs and the highest number of overlapping runs
    struct SlowRunner {
        delay: Duration,
        runs: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl SlowRunner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                runs: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SubscriptionRunner for SlowRunner {
        async fn run(&self, _subscription: &Subscription) -> std::result::Result<RunOutcome, SubscriptionRunError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome::NothingToDeliver { acknowledged: 0 })
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn every_second() -> Subscription {
        let schedule = QuerySchedule::parse(None, None, None, None, None, None).unwrap();
        Subscription::scheduled("every-second", "SimpleEventQuery", "http://localhost/", schedule)
    }

    #[tokio::test]
    async fn test_schedule_fires_once_per_second() {
        let runner = Arc::new(SlowRunner::new(Duration::ZERO));
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let clock_time = now.clone();
        let clock: Clock = Arc::new(move || *clock_time.lock().unwrap());

        let scheduler = SubscriptionScheduler::with_clock(fast_config(), runner.clone(), clock);
        let (handle, task) = scheduler.spawn(vec![every_second()]);

        eventually(|| runner.runs.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        *now.lock().unwrap() = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        eventually(|| runner.runs.load(Ordering::SeqCst) == 2).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ticks_never_overlap() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(40)));
        let scheduler = SubscriptionScheduler::new(fast_config(), runner.clone());
        let trigger = Subscription::triggered("on-insert", "SimpleEventQuery", "http://localhost/", "urn:trigger");
        let (handle, task) = scheduler.spawn(vec![trigger]);

        for request_id in 0..5 {
            handle.notify_capture(request_id).await;
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        eventually(|| runner.runs.load(Ordering::SeqCst) >= 2).await;

        assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_waits_for_running_tick() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(60)));
        let scheduler = SubscriptionScheduler::new(fast_config(), runner.clone());
        let (handle, task) = scheduler.spawn(vec![every_second()]);

        eventually(|| runner.running.load(Ordering::SeqCst) == 1).await;
        assert!(handle.remove("every-second").await.unwrap());

        // The evaluation that was running has finished before removal returned
        assert_eq!(runner.running.load(Ordering::SeqCst), 0);
        let runs = runner.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), runs);

        assert!(!handle.remove("every-second").await.unwrap());
        assert!(handle.list().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    /// Fails every run after `delay`
    struct FailingRunner {
        delay: Duration,
        runs: AtomicUsize,
        running: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionRunner for FailingRunner {
        async fn run(&self, _subscription: &Subscription) -> std::result::Result<RunOutcome, SubscriptionRunError> {
            self.running.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(EpcisError::Internal("destination down".to_string()).into())
        }
    }

    #[tokio::test]
    async fn test_restored_trigger_runs_without_new_capture() {
        let runner = Arc::new(SlowRunner::new(Duration::ZERO));
        let scheduler = SubscriptionScheduler::new(fast_config(), runner.clone());
        let trigger = Subscription::triggered("on-insert", "SimpleEventQuery", "http://localhost/", "urn:trigger");
        let (handle, task) = scheduler.spawn(vec![trigger]);

        eventually(|| runner.runs.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reregistered_trigger_does_not_inherit_backoff() {
        let runner = Arc::new(FailingRunner {
            delay: Duration::from_millis(60),
            runs: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        });
        let config = SchedulerConfig {
            retry_initial: Duration::from_secs(30),
            retry_max: Duration::from_secs(30),
            ..fast_config()
        };
        let scheduler = SubscriptionScheduler::new(config, runner.clone());
        let trigger = || Subscription::triggered("on-insert", "SimpleEventQuery", "http://localhost/", "urn:trigger");
        let (handle, task) = scheduler.spawn(vec![trigger()]);

        eventually(|| runner.running.load(Ordering::SeqCst) == 1).await;
        handle.register(trigger()).await.unwrap();

        // The old entry's failure must not delay the new one by 30s
        eventually(|| runner.runs.load(Ordering::SeqCst) >= 2).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_register_list_and_shutdown() {
        let runner = Arc::new(SlowRunner::new(Duration::ZERO));
        let scheduler = SubscriptionScheduler::new(fast_config(), runner);
        let (handle, task) = scheduler.spawn(Vec::new());

        handle
            .register(Subscription::triggered("b", "SimpleEventQuery", "http://localhost/", "urn:t"))
            .await
            .unwrap();
        handle
            .register(Subscription::triggered("a", "SimpleEventQuery", "http://localhost/", "urn:t"))
            .await
            .unwrap();
        assert_eq!(handle.list().await.unwrap(), vec!["a", "b"]);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.list().await, Err(EpcisError::Internal(_))));
    }
}
