//! Local work queue
//!
//! In-process at-least-once queue backed by a tokio channel and a
//! semaphore-bounded worker pool. Failed or panicking deliveries are retried,
//! and a configurable share of successful deliveries is delivered a second
//! time so handlers see the duplicates a real queue produces.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{QueueError, Task, TaskHandler, TaskRequest, WorkQueue};

/// Local queue settings
#[derive(Clone, Debug, PartialEq)]
pub struct LocalQueueSettings {
    /// Tasks handled at the same time
    pub max_concurrent: usize,

    /// Largest batch accepted by `add_batch`
    pub max_batch_size: usize,

    /// Deliveries of a failing task before it is dropped
    pub max_attempts: u32,

    /// Delay before a failed task is delivered again
    pub retry_delay: Duration,

    /// Probability that a handled task is delivered once more
    pub duplicate_delivery_rate: f64,

    /// How long a task name stays reserved after it was added
    pub name_ttl: Duration,
}

impl Default for LocalQueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_batch_size: 100,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            duplicate_delivery_rate: 0.0,
            name_ttl: Duration::from_secs(3600),
        }
    }
}

impl LocalQueueSettings {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_duplicate_delivery_rate(mut self, rate: f64) -> Self {
        self.duplicate_delivery_rate = rate;
        self
    }

    pub fn with_name_ttl(mut self, ttl: Duration) -> Self {
        self.name_ttl = ttl;
        self
    }
}

#[derive(Debug)]
struct Delivery {
    task: Task,
    attempt: u32,
    duplicate: bool,
}

impl Delivery {
    fn first(task: Task) -> Self {
        Self {
            task,
            attempt: 1,
            duplicate: false,
        }
    }
}

struct Shared {
    settings: LocalQueueSettings,
    sender: mpsc::UnboundedSender<Delivery>,
    /// Reserved task names and when they were reserved
    names: Mutex<HashMap<String, Instant>>,
    /// Accepted deliveries not yet fully handled
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    /// Hand a delivery to the worker, after `delay` if non-zero
    fn send_after(self: &Arc<Self>, delivery: Delivery, delay: Duration) {
        if delay.is_zero() {
            self.send(delivery);
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.send(delivery);
        });
    }

    fn send(&self, delivery: Delivery) {
        if let Err(e) = self.sender.send(delivery) {
            warn!("Dropping {}: worker stopped", e.0.task);
            self.complete();
        }
    }

    fn complete(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn deliver(self: Arc<Self>, delivery: Delivery, handler: Arc<dyn TaskHandler>) {
        debug!(
            "Delivering {} (attempt {}{})",
            delivery.task,
            delivery.attempt,
            if delivery.duplicate { ", duplicate" } else { "" }
        );

        let task = delivery.task.clone();
        // Separate task so a panicking handler surfaces as a JoinError
        let outcome = tokio::spawn(async move { handler.handle(task).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(e) if e.is_panic() => Some("handler panicked".to_string()),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                if !delivery.duplicate && self.roll_duplicate() {
                    debug!("Scheduling duplicate delivery of {}", delivery.task);
                    self.pending.fetch_add(1, Ordering::SeqCst);
                    self.send(Delivery {
                        duplicate: true,
                        ..Delivery::first(delivery.task.clone())
                    });
                }
                self.complete();
            }
            Some(reason) if delivery.attempt < self.settings.max_attempts => {
                warn!(
                    "{} failed on attempt {}: {}, retrying",
                    delivery.task, delivery.attempt, reason
                );
                let retry = Delivery {
                    attempt: delivery.attempt + 1,
                    ..delivery
                };
                self.send_after(retry, self.settings.retry_delay);
            }
            Some(reason) => {
                error!(
                    "Giving up on {} after {} attempts: {}",
                    delivery.task, delivery.attempt, reason
                );
                self.complete();
            }
        }
    }

    fn roll_duplicate(&self) -> bool {
        let rate = self.settings.duplicate_delivery_rate;
        rate > 0.0 && rand::random::<f64>() < rate
    }
}

/// In-process at-least-once queue
pub struct LocalQueue {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl LocalQueue {
    pub fn new(settings: LocalQueueSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                settings,
                sender,
                names: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Deliveries accepted but not yet fully handled
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Start delivering tasks to `handler`
    ///
    /// Can only be called once per queue.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) -> Result<JoinHandle<()>, QueueError> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| QueueError::Backend("receiver mutex poisoned".to_string()))?
            .take()
            .ok_or_else(|| QueueError::Backend("queue already started".to_string()))?;

        info!(
            "Starting local queue (max {} concurrent, {} attempts)",
            self.shared.settings.max_concurrent, self.shared.settings.max_attempts
        );
        Ok(tokio::spawn(Self::work(self.shared.clone(), receiver, handler)))
    }

    async fn work(
        shared: Arc<Shared>,
        mut receiver: mpsc::UnboundedReceiver<Delivery>,
        handler: Arc<dyn TaskHandler>,
    ) {
        let semaphore = Arc::new(Semaphore::new(shared.settings.max_concurrent.max(1)));

        loop {
            let delivery = tokio::select! {
                _ = shared.shutdown.notified() => break,
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let shared = shared.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                shared.deliver(delivery, handler).await;
            });
        }

        debug!("Local queue worker stopped");
    }

    /// Wait until every accepted task, including retries and duplicates,
    /// has been handled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reject further tasks and stop the worker
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
    }

    /// Reserve the names of `requests`, all or none
    ///
    /// Names older than the configured TTL are released first.
    fn reserve_names(&self, requests: &[TaskRequest]) -> Result<(), QueueError> {
        let mut names = self
            .shared
            .names
            .lock()
            .map_err(|_| QueueError::Backend("name mutex poisoned".to_string()))?;

        let now = Instant::now();
        let ttl = self.shared.settings.name_ttl;
        let before = names.len();
        names.retain(|_, reserved| now.duration_since(*reserved) < ttl);
        if names.len() < before {
            debug!("Released {} expired task names", before - names.len());
        }

        let mut batch_names = HashSet::new();
        for name in requests.iter().filter_map(|r| r.options.name.as_ref()) {
            if names.contains_key(name) || !batch_names.insert(name) {
                return Err(QueueError::TaskAlreadyExists(name.clone()));
            }
        }
        for name in batch_names {
            names.insert(name.clone(), now);
        }
        Ok(())
    }

    fn enqueue(&self, requests: Vec<TaskRequest>) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.reserve_names(&requests)?;

        self.shared
            .pending
            .fetch_add(requests.len(), Ordering::SeqCst);
        for request in requests {
            self.shared
                .send_after(Delivery::first(request.task), request.options.countdown);
        }
        Ok(())
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new(LocalQueueSettings::default())
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn add(&self, request: TaskRequest) -> Result<(), QueueError> {
        self.enqueue(vec![request])
    }

    async fn add_batch(&self, requests: Vec<TaskRequest>) -> Result<(), QueueError> {
        let max = self.max_batch_size();
        if requests.len() > max {
            return Err(QueueError::BatchTooLarge {
                size: requests.len(),
                max,
            });
        }
        self.enqueue(requests)
    }

    fn max_batch_size(&self) -> usize {
        self.shared.settings.max_batch_size
    }
}
