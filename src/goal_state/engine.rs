//! Timer-driven queue of entities. Each entity has a unique id; enqueueing
//! with an earlier deadline wins, a later deadline is ignored. A pool of
//! workers drains due entities and runs their next action; actions for one
//! entity never overlap. Errors re-enqueue with bounded exponential backoff.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Unique key of the entity within its engine.
    fn id(&self) -> String;

    /// Selects and runs the entity's next action. Returns the delay after
    /// which the entity wants to be re-evaluated, or None to dequeue it.
    async fn run(&self) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub failure_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 500,
            failure_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

struct Item {
    entity: Arc<dyn Entity>,
    /// Deadline currently scheduled, None while the action is running.
    deadline: Option<Instant>,
    /// Earliest deadline requested while the action was running.
    pending: Option<Instant>,
    failures: u32,
    running: bool,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // FIFO among equal deadlines via the enqueue sequence
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct EngineState {
    items: HashMap<String, Item>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
    stopped: bool,
}

pub struct Engine {
    name: &'static str,
    config: EngineConfig,
    state: Mutex<EngineState>,
    notify: Notify,
}

impl Engine {
    pub fn new(name: &'static str, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            state: Mutex::new(EngineState::default()),
            notify: Notify::new(),
        })
    }

    /// Schedules the entity to run at `deadline`. For an already queued
    /// entity the earlier of the two deadlines wins.
    pub fn enqueue(&self, entity: Arc<dyn Entity>, deadline: Instant) {
        let id = entity.id();
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            debug!(engine = self.name, entity = %id, "engine stopped, refusing enqueue");
            return;
        }

        let seq = state.seq;
        state.seq += 1;

        match state.items.entry(id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let item = occupied.get_mut();
                if item.running {
                    item.pending = Some(match item.pending {
                        Some(pending) => pending.min(deadline),
                        None => deadline,
                    });
                    return;
                }
                // later deadlines are ignored
                if let Some(current) = item.deadline {
                    if current <= deadline {
                        return;
                    }
                }
                item.deadline = Some(deadline);
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Item {
                    entity,
                    deadline: Some(deadline),
                    pending: None,
                    failures: 0,
                    running: false,
                });
            }
        }
        state.heap.push(Reverse(HeapEntry { deadline, seq, id }));
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the worker pool. Workers exit when `shutdown_rx` fires.
    pub fn start(self: &Arc<Self>, shutdown_rx: watch::Receiver<()>) {
        for worker in 0..self.config.workers {
            let engine = self.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            debug!(engine = engine.name, worker, "goal state worker shutting down");
                            break;
                        }
                        next = engine.next_due() => {
                            let Some((id, entity)) = next else {
                                continue;
                            };
                            engine.run_one(id, entity).await;
                        }
                    }
                }
            });
        }
        info!(
            engine = self.name,
            workers = self.config.workers,
            "goal state engine started"
        );
    }

    /// Drains the queue and refuses further enqueues.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.items.clear();
        state.heap.clear();
        drop(state);
        self.notify.notify_waiters();
        info!(engine = self.name, "goal state engine stopped");
    }

    /// Reopens a previously stopped engine (leadership regained).
    pub fn reopen(&self) {
        self.state.lock().unwrap().stopped = false;
    }

    /// Waits for a due entity and claims it for execution.
    async fn next_due(&self) -> Option<(String, Arc<dyn Entity>)> {
        loop {
            let wait: Option<Duration> = {
                let mut state = self.state.lock().unwrap();
                loop {
                    let Some(Reverse(top)) = state.heap.peek() else {
                        break None;
                    };
                    let now = Instant::now();
                    if top.deadline > now {
                        break Some(top.deadline - now);
                    }
                    let entry = state.heap.pop().expect("peeked entry").0;
                    let claim = match state.items.get_mut(&entry.id) {
                        // only the entry matching the item's current schedule
                        // may claim it; earlier re-enqueues leave stale ones
                        Some(item) if !item.running && item.deadline == Some(entry.deadline) => {
                            item.running = true;
                            item.deadline = None;
                            Some(item.entity.clone())
                        }
                        _ => None,
                    };
                    if let Some(entity) = claim {
                        return Some((entry.id, entity));
                    }
                }
            };

            match wait {
                Some(duration) => {
                    let _ = tokio::time::timeout(duration, self.notify.notified()).await;
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn run_one(&self, id: String, entity: Arc<dyn Entity>) {
        let result = entity.run().await;

        let mut state = self.state.lock().unwrap();
        let Some(item) = state.items.get_mut(&id) else {
            return; // stopped underneath us
        };
        item.running = false;

        let reschedule = match result {
            Ok(delay) => {
                item.failures = 0;
                delay.map(|d| Instant::now() + d)
            }
            Err(err) => {
                item.failures += 1;
                let backoff = self
                    .config
                    .failure_retry_delay
                    .saturating_mul(1u32 << (item.failures - 1).min(16))
                    .min(self.config.max_retry_delay);
                error!(
                    engine = self.name,
                    entity = %id,
                    failures = item.failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "entity action failed, backing off"
                );
                Some(Instant::now() + backoff)
            }
        };

        // the earliest of the action's own reschedule and anything enqueued
        // while it ran
        let next = match (reschedule, item.pending.take()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match next {
            Some(deadline) => {
                item.deadline = Some(deadline);
                let seq = state.seq;
                state.seq += 1;
                state.heap.push(Reverse(HeapEntry {
                    deadline,
                    seq,
                    id,
                }));
                drop(state);
                self.notify.notify_waiters();
            }
            None => {
                state.items.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingEntity {
        id: String,
        runs: AtomicU32,
        reschedule_once: bool,
        fail_times: u32,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
    }

    impl CountingEntity {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                runs: AtomicU32::new(0),
                reschedule_once: false,
                fail_times: 0,
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Entity for CountingEntity {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn run(&self) -> Result<Option<Duration>> {
            let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if run < self.fail_times {
                anyhow::bail!("induced failure");
            }
            if self.reschedule_once && run == 0 {
                return Ok(Some(Duration::from_millis(1)));
            }
            Ok(None)
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            workers: 4,
            failure_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_runs_due_entity_once() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        let entity = CountingEntity::new("e1");
        engine.enqueue(entity.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entity.runs.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        let entity = CountingEntity::new("e1");
        // far future first, then now: the earlier deadline must win
        engine.enqueue(entity.clone(), Instant::now() + Duration::from_secs(60));
        engine.enqueue(entity.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entity.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_later_deadline_ignored() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        let entity = CountingEntity::new("e1");
        let soon = Instant::now() + Duration::from_millis(10);
        engine.enqueue(entity.clone(), soon);
        engine.enqueue(entity.clone(), soon + Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // ran once off the earlier deadline; the later enqueue was dropped
        assert_eq!(entity.runs.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_no_concurrent_runs_per_entity() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        let mut entity = CountingEntity::new("e1");
        Arc::get_mut(&mut entity).unwrap().reschedule_once = true;
        engine.enqueue(entity.clone(), Instant::now());
        // enqueue again while the first run is likely in flight
        engine.enqueue(entity.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(entity.max_concurrent.load(Ordering::SeqCst), 1);
        assert!(entity.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failure_backoff_retries() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        let mut entity = CountingEntity::new("e1");
        Arc::get_mut(&mut entity).unwrap().fail_times = 2;
        engine.enqueue(entity.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(200)).await;
        // two failures then one success
        assert_eq!(entity.runs.load(Ordering::SeqCst), 3);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_stop_refuses_enqueue() {
        let engine = Engine::new("test", test_config());
        let (_tx, rx) = watch::channel(());
        engine.start(rx);

        engine.stop();
        let entity = CountingEntity::new("e1");
        engine.enqueue(entity.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(entity.runs.load(Ordering::SeqCst), 0);
        assert!(engine.is_empty());
    }
}
