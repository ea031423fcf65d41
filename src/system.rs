//! The System: owns workers, Bus, Clock, and TopicRegistry; enforces
//! start/stop order and failure escalation (spec.md §4.1 "Supervision",
//! §4.1 "Heartbeat", §5, §7).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::message::ChannelId;
use crate::topic::{Topic, TopicRegistry};
use crate::worker::{
    mailbox, LifecycleSignal, LifecycleState, MailboxPolicy, MailboxSender, Worker, WorkerId,
    WorkerMsg,
};

/// Shared, read-mostly handles a worker uses to talk to the rest of the
/// System (spec.md design notes: "Global singletons (Clock, Bus). Modeled as
/// process-wide state owned by the System value, passed explicitly to
/// workers at initialize. No ambient globals.").
#[derive(Clone)]
pub struct SystemContext {
    bus: Arc<Bus>,
    clock: Clock,
    topics: Arc<TopicRegistry>,
    worker_id: WorkerId,
    mailbox: MailboxSender,
    self_terminate: Arc<std::sync::atomic::AtomicBool>,
}

impl SystemContext {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn publish<T: Any + Send + Sync>(&self, channel: &ChannelId, value: T) -> usize {
        self.bus.publish(channel, value, Some(self.worker_id.clone()))
    }

    /// Publish an already-boxed payload (e.g. one pulled verbatim off an
    /// archive entry) without re-wrapping it in a fresh `Arc`.
    pub fn publish_payload(&self, channel: &ChannelId, value: crate::message::Payload) -> usize {
        self.bus
            .publish_payload(channel, value, Some(self.worker_id.clone()))
    }

    pub fn subscribe(&self, channel: ChannelId) {
        self.bus
            .subscribe(self.worker_id.clone(), channel, self.mailbox.clone());
    }

    pub fn unsubscribe(&self, channel: &ChannelId) {
        self.bus.unsubscribe(&self.worker_id, channel);
    }

    pub async fn request_topic(&self, channel: ChannelId, topic: Topic) -> bool {
        self.topics
            .request(channel, topic, self.worker_id.clone())
            .await
    }

    pub async fn release_topic(&self, channel: ChannelId, topic: Topic) {
        self.topics
            .release(channel, topic, self.worker_id.clone())
            .await
    }

    /// A worker requests its own termination; the System cascades this to
    /// any children registered under it (spec.md §4.1: "A worker can request
    /// self-termination, which cascades to its children").
    pub fn request_self_termination(&self) {
        self.self_terminate.store(true, Ordering::Release);
    }

    pub(crate) fn mailbox_sender(&self) -> MailboxSender {
        self.mailbox.clone()
    }
}

/// How many consecutive failures (handler errors or missed heartbeats) a
/// worker tolerates before the System gives up on it (spec.md §4.1:
/// "restarted by default ... up to a configured attempt count, after which
/// the System treats it as failed").
#[derive(Debug, Clone, Copy)]
pub struct SupervisionPolicy {
    pub max_restart_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        SupervisionPolicy {
            max_restart_attempts: 3,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

struct WorkerEntry {
    state: Mutex<LifecycleState>,
    mailbox: MailboxSender,
    restart_count: AtomicU32,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    children: Mutex<Vec<WorkerId>>,
}

/// Owns the Bus, Clock, TopicRegistry, and every admitted Worker.
pub struct System {
    bus: Arc<Bus>,
    clock: Clock,
    topics: Arc<TopicRegistry>,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerEntry>>>,
    /// Flips once on the first admitted worker, to disarm `Clock::set_adjustable`
    /// once the system has left startup (spec.md §4.3: the base/scale are only
    /// adjustable "at startup or while explicitly paused").
    started: std::sync::atomic::AtomicBool,
}

impl System {
    pub fn new(clock: Clock) -> Arc<Self> {
        // Adjustable at startup, before any worker is admitted; disarmed the
        // moment the first one starts running (see `spawn_worker`) and
        // re-armed only across `pause_simulation`/`resume_simulation`.
        clock.set_adjustable(true);
        Arc::new(System {
            bus: Arc::new(Bus::new()),
            clock,
            topics: Arc::new(TopicRegistry::new()),
            workers: Mutex::new(HashMap::new()),
            started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    pub fn worker_state(&self, id: &WorkerId) -> Option<LifecycleState> {
        self.workers
            .lock()
            .unwrap()
            .get(id)
            .map(|e| *e.state.lock().unwrap())
    }

    /// Admit and start a worker: `initialize` (may fail, not admitted),
    /// subscribe it to its configured `read-from` channels, then `start`,
    /// and spawn its serial mailbox-processing task under supervision.
    pub async fn spawn_worker(
        self: &Arc<Self>,
        mut worker: Box<dyn Worker>,
        config: WorkerConfig,
        policy: MailboxPolicy,
        supervision: SupervisionPolicy,
        parent: Option<WorkerId>,
    ) -> Result<WorkerId> {
        let id = worker.id().clone();
        let (mailbox_tx, mut mailbox_rx) = mailbox(policy);
        let ctx = SystemContext {
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            topics: self.topics.clone(),
            worker_id: id.clone(),
            mailbox: mailbox_tx.clone(),
            self_terminate: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        worker.initialize(&ctx, &config).await.map_err(|e| {
            error!("worker {id} failed to initialize: {e}");
            Error::Init {
                worker: id.clone(),
                reason: e.to_string(),
            }
        })?;

        for raw_channel in config.read_from() {
            ctx.subscribe(ChannelId::from(raw_channel));
        }

        worker.start(&ctx).await?;

        let entry = Arc::new(WorkerEntry {
            state: Mutex::new(LifecycleState::Started),
            mailbox: mailbox_tx.clone(),
            restart_count: AtomicU32::new(0),
            task: AsyncMutex::new(None),
            children: Mutex::new(Vec::new()),
        });

        {
            let mut workers = self.workers.lock().unwrap();
            workers.insert(id.clone(), entry.clone());
            if let Some(parent_id) = parent {
                if let Some(parent_entry) = workers.get(&parent_id) {
                    parent_entry.children.lock().unwrap().push(id.clone());
                }
            }
        }

        // The first worker to start running ends the system's startup
        // window; the clock's base/scale stay fixed from here on except
        // across an explicit pause/resume (spec.md §4.3).
        if !self.started.swap(true, Ordering::AcqRel) {
            self.clock.set_adjustable(false);
        }

        self.spawn_heartbeat_task(id.clone(), entry.clone(), supervision, mailbox_tx.clone());

        let self_terminate = ctx.self_terminate.clone();
        let worker_id_for_task = id.clone();
        let system = self.clone();
        let entry_for_task = entry.clone();
        let task = tokio::spawn(async move {
            let mut worker = worker;
            let ctx = ctx;
            loop {
                if self_terminate.load(Ordering::Acquire) {
                    info!("worker {worker_id_for_task} requested self-termination");
                    break;
                }
                let msg = match mailbox_rx.recv().await {
                    Some(m) => m,
                    None => break,
                };
                match msg {
                    WorkerMsg::Bus(_) | WorkerMsg::Timer(_) | WorkerMsg::Frame(_) => {
                        if let Err(e) = worker.handle(&ctx, msg).await {
                            system.on_handle_failure(&worker_id_for_task, &entry_for_task, e);
                            if entry_for_task.restart_count.load(Ordering::Acquire)
                                > supervision.max_restart_attempts
                            {
                                break;
                            }
                            mailbox_rx.drain();
                        }
                    }
                    WorkerMsg::Lifecycle(signal) => match signal {
                        LifecycleSignal::Pause => {
                            worker.pause(&ctx).await;
                            *entry_for_task.state.lock().unwrap() = LifecycleState::Paused;
                        }
                        LifecycleSignal::Resume => {
                            worker.resume(&ctx).await;
                            *entry_for_task.state.lock().unwrap() = LifecycleState::Started;
                        }
                        LifecycleSignal::Terminate => break,
                        LifecycleSignal::Start => {}
                        LifecycleSignal::Ping { reply } => {
                            let _ = reply.send(std::time::Instant::now());
                        }
                    },
                }
            }
            worker.terminate(&ctx).await;
            *entry_for_task.state.lock().unwrap() = LifecycleState::Terminated;
            system.bus.unsubscribe_all(&worker_id_for_task);
            info!("worker {worker_id_for_task} terminated");
        });

        *entry.task.lock().await = Some(task);
        Ok(id)
    }

    fn on_handle_failure(&self, id: &WorkerId, entry: &WorkerEntry, err: Error) {
        let count = entry.restart_count.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("worker {id} handler failed (attempt {count}): {err}");
    }

    /// Ping one worker's mailbox and wait up to `timeout` for its reply.
    async fn ping(&self, mailbox: &MailboxSender, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        if !mailbox.try_deliver(WorkerMsg::Lifecycle(LifecycleSignal::Ping { reply: tx })) {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(_)))
    }

    /// Periodically ping one worker on its own `heartbeat_interval` and
    /// terminate it if it ever misses `heartbeat_timeout` (spec.md §4.1
    /// "Heartbeat": "a hung mailbox is surfaced as a failure"). Spawned once
    /// per admitted worker, alongside its mailbox-processing task.
    fn spawn_heartbeat_task(
        self: &Arc<Self>,
        id: WorkerId,
        entry: Arc<WorkerEntry>,
        supervision: SupervisionPolicy,
        mailbox: MailboxSender,
    ) {
        let system = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervision.heartbeat_interval);
            ticker.tick().await; // first tick fires immediately; not a missed beat
            loop {
                ticker.tick().await;
                if *entry.state.lock().unwrap() == LifecycleState::Terminated {
                    break;
                }
                if !system.ping(&mailbox, supervision.heartbeat_timeout).await {
                    warn!("worker {id} missed its heartbeat; terminating");
                    system.terminate(&id);
                    break;
                }
            }
        });
    }

    /// Send a lifecycle signal to one worker's mailbox.
    pub fn signal(&self, id: &WorkerId, signal: LifecycleSignal) -> Result<()> {
        let mailbox = {
            let workers = self.workers.lock().unwrap();
            workers
                .get(id)
                .map(|e| e.mailbox.clone())
                .ok_or_else(|| Error::UnknownWorker(id.clone()))?
        };
        if !mailbox.try_deliver(WorkerMsg::Lifecycle(signal)) {
            return Err(Error::Timeout(format!("mailbox full for worker {id}")));
        }
        Ok(())
    }

    pub fn pause(&self, id: &WorkerId) -> Result<()> {
        self.signal(id, LifecycleSignal::Pause)
    }

    pub fn resume(&self, id: &WorkerId) -> Result<()> {
        self.signal(id, LifecycleSignal::Resume)
    }

    /// Pause the shared simulation clock and every admitted worker (spec.md
    /// §4.3, §4.4 "Pause/resume"). Replayers observe the paused clock the
    /// next time one of their timers fires and push their in-flight entry
    /// onto `pendingOnResume` rather than publishing it.
    pub fn pause_simulation(&self) {
        self.clock.pause();
        self.clock.set_adjustable(true);
        let ids: Vec<WorkerId> = self.workers.lock().unwrap().keys().cloned().collect();
        for id in ids {
            let _ = self.pause(&id);
        }
    }

    /// Resume the shared simulation clock and every admitted worker, in that
    /// order, so a replayer's `resume` hook observes an already-running
    /// clock when it recomputes its pending entries' wall delays.
    pub fn resume_simulation(&self) {
        self.clock.resume();
        self.clock.set_adjustable(false);
        let ids: Vec<WorkerId> = self.workers.lock().unwrap().keys().cloned().collect();
        for id in ids {
            let _ = self.resume(&id);
        }
    }

    /// Idempotent: terminating an already-terminated or unknown worker is a
    /// no-op, never an error (spec.md §8: "Terminate is idempotent").
    pub fn terminate(&self, id: &WorkerId) {
        let mailbox = {
            let workers = self.workers.lock().unwrap();
            workers.get(id).map(|e| e.mailbox.clone())
        };
        if let Some(mailbox) = mailbox {
            let _ = mailbox.try_deliver(WorkerMsg::Lifecycle(LifecycleSignal::Terminate));
        }
    }

    /// Ping every admitted worker and wait up to `timeout` for each reply; a
    /// worker that does not answer in time is reported as stuck (spec.md
    /// §4.1 "Heartbeat"). The caller (e.g. a periodic task) decides what
    /// supervisor action to take for stuck workers.
    pub async fn heartbeat_sweep(&self, timeout: Duration) -> Vec<WorkerId> {
        let entries: Vec<(WorkerId, MailboxSender)> = {
            let workers = self.workers.lock().unwrap();
            workers
                .iter()
                .map(|(id, e)| (id.clone(), e.mailbox.clone()))
                .collect()
        };

        let mut stuck = Vec::new();
        for (id, mailbox) in entries {
            if !self.ping(&mailbox, timeout).await {
                stuck.push(id);
            }
        }
        stuck
    }

    /// Terminate every worker in reverse-start order is not tracked
    /// explicitly here (workers are independent by default); this stops all
    /// currently admitted workers and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        let entries: Vec<(WorkerId, Arc<WorkerEntry>)> = {
            let workers = self.workers.lock().unwrap();
            workers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (id, entry) in &entries {
            let _ = entry
                .mailbox
                .try_deliver(WorkerMsg::Lifecycle(LifecycleSignal::Terminate));
            info!("shutdown: signaled {id}");
        }
        for (_, entry) in entries {
            let task = entry.task.lock().await.take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }
}
