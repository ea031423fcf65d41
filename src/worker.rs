//! Worker lifecycle, mailbox, and the sum-type of messages a worker's event
//! loop can receive (spec.md §4.1, design note "dynamic handler dispatch ->
//! tagged payload variants").

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::system::SystemContext;

/// Stable, opaque reference to a worker: its name, unique within the System.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        WorkerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({:?})", self.0)
    }
}

/// Lifecycle states (spec.md §3): `Created -> Initialized -> Started <-> Paused -> Terminated`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Started,
    Paused,
    Terminated,
}

impl LifecycleState {
    /// Whether `to` is a legal transition from `self`. `Terminated` is absorbing.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Created, Initialized) => true,
            (Initialized, Started) => true,
            (Started, Paused) => true,
            (Paused, Started) => true,
            (Started, Terminated) => true,
            (Paused, Terminated) => true,
            (Initialized, Terminated) => true,
            (Created, Terminated) => true,
            (s, t) if s == t => true, // idempotent no-ops (e.g. double terminate)
            _ => false,
        }
    }
}

/// A raw datagram handed from an adapter's dedicated reader thread to the
/// owning worker's mailbox, before any protocol decoding happens (spec.md
/// §4.5, §5: "the thread converts frames into mailbox messages for the
/// worker").
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
    pub received_sim_millis: i64,
}

/// System-originated signals. These follow the convention that they are sent
/// by the System rather than by worker code directly (spec.md design notes).
#[derive(Debug)]
pub enum LifecycleSignal {
    Start,
    Pause,
    Resume,
    Terminate,
    /// Heartbeat: the worker must reply on `reply` soon after dequeuing this
    /// to prove it is not stuck (spec.md §4.1 "Heartbeat").
    Ping { reply: oneshot::Sender<Instant> },
}

#[derive(Debug, Clone, Copy)]
pub struct TimerTick {
    pub id: u64,
}

/// The closed set of shapes a worker's event loop dispatches on (design note:
/// "tagged payload variants" replacing open-world type matching).
#[derive(Debug)]
pub enum WorkerMsg {
    Bus(Message),
    Timer(TimerTick),
    Lifecycle(LifecycleSignal),
    Frame(RawFrame),
}

/// Backpressure policy for one worker's mailbox (spec.md §9 open question:
/// "the mailbox bound and overflow policy per worker is a config decision to
/// be surfaced, not inherited implicitly" -- so every worker must pick one
/// explicitly rather than receive a silently-assumed default).
#[derive(Debug, Clone, Copy)]
pub enum MailboxPolicy {
    /// Publish blocks only the delivery path to *this* subscriber, via that
    /// subscriber's own single long-lived delivery task, never the publisher
    /// and never other subscribers. Deliveries to one `Block` subscriber are
    /// serialized through that one task, so call order into `publish` is
    /// preserved in the order messages reach this subscriber.
    Block { capacity: usize },
    /// On overflow, evict the oldest pending message to make room.
    DropOldest { capacity: usize },
    /// On overflow, drop the incoming message and keep what is already queued.
    DropNewest { capacity: usize },
}

impl MailboxPolicy {
    pub fn capacity(self) -> usize {
        match self {
            MailboxPolicy::Block { capacity }
            | MailboxPolicy::DropOldest { capacity }
            | MailboxPolicy::DropNewest { capacity } => capacity,
        }
    }
}

struct MailboxState {
    queue: std::collections::VecDeque<WorkerMsg>,
    closed: bool,
}

struct MailboxShared {
    state: std::sync::Mutex<MailboxState>,
    capacity: usize,
    not_empty: tokio::sync::Notify,
    not_full: tokio::sync::Notify,
}

/// The receiving half of a worker's mailbox; owned by the worker's own task.
pub struct MailboxReceiver {
    shared: Arc<MailboxShared>,
}

impl MailboxReceiver {
    pub async fn recv(&mut self) -> Option<WorkerMsg> {
        loop {
            let notified = self.shared.not_empty.notified();
            {
                let mut st = self.shared.state.lock().unwrap();
                if let Some(msg) = st.queue.pop_front() {
                    drop(st);
                    self.shared.not_full.notify_waiters();
                    return Some(msg);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop one message if one is already queued, without waiting on
    /// `not_empty` (e.g. for synchronous test assertions).
    pub fn try_recv(&mut self) -> Option<WorkerMsg> {
        let mut st = self.shared.state.lock().unwrap();
        let msg = st.queue.pop_front();
        drop(st);
        if msg.is_some() {
            self.shared.not_full.notify_waiters();
        }
        msg
    }

    /// Drain whatever is queued right now without waiting, e.g. after a
    /// handler failure (spec.md §4.1: "restarted by default (mailbox
    /// discarded)").
    pub fn drain(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.queue.clear();
        drop(st);
        self.shared.not_full.notify_waiters();
    }
}

impl Drop for MailboxReceiver {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.not_full.notify_waiters();
    }
}

/// The sending half of a worker's mailbox, held by the Bus/System and cloned
/// freely; FIFO, per spec.md §3 ("mailbox of pending messages").
#[derive(Clone)]
pub struct MailboxSender {
    shared: Arc<MailboxShared>,
    pub(crate) policy: MailboxPolicy,
    /// `Block`-policy mailboxes only: hand-off to the one delivery task that
    /// serializes calls to `deliver_blocking`, so two enqueues from the same
    /// caller can never race each other into the mailbox out of order.
    order: Option<tokio::sync::mpsc::UnboundedSender<WorkerMsg>>,
}

impl MailboxSender {
    /// Enqueue without ever blocking the caller (spec.md §5: "the Bus
    /// `publish` is non-blocking with respect to the publisher"). Returns
    /// whether the message ended up in the mailbox.
    pub fn try_deliver(&self, msg: WorkerMsg) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        if st.closed {
            return false;
        }
        if st.queue.len() < self.shared.capacity {
            st.queue.push_back(msg);
            drop(st);
            self.shared.not_empty.notify_one();
            return true;
        }
        match self.policy {
            MailboxPolicy::DropNewest { .. } => false,
            MailboxPolicy::DropOldest { .. } => {
                st.queue.pop_front();
                st.queue.push_back(msg);
                drop(st);
                self.shared.not_empty.notify_one();
                true
            }
            MailboxPolicy::Block { .. } => false,
        }
    }

    /// Deliver by waiting for room, without ever blocking the *caller of
    /// `Bus::publish`* -- `mailbox()` spawns this mailbox's single delivery
    /// task to drain `enqueue_blocking`'s hand-off queue through this method
    /// one message at a time, so only that one task is ever backpressured
    /// (spec.md §4.2: "slow subscribers ... block the subscriber only, never
    /// the bus").
    pub async fn deliver_blocking(&self, msg: WorkerMsg) {
        let mut msg = Some(msg);
        loop {
            let notified = self.shared.not_full.notified();
            {
                let mut st = self.shared.state.lock().unwrap();
                if st.closed {
                    return;
                }
                if st.queue.len() < self.shared.capacity {
                    st.queue.push_back(msg.take().expect("message already delivered"));
                    drop(st);
                    self.shared.not_empty.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_block_policy(&self) -> bool {
        matches!(self.policy, MailboxPolicy::Block { .. })
    }

    /// Hand a message to this `Block` mailbox's delivery task, preserving the
    /// order the caller enqueued in relative to every other enqueue onto this
    /// same sender (spec.md §4.2/§5/§8 per-(publisher,channel) ordering).
    /// Never blocks; returns `false` only once the delivery task has exited
    /// (mailbox gone).
    pub fn enqueue_blocking(&self, msg: WorkerMsg) -> bool {
        match &self.order {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Create a bound mailbox pair for a worker per its configured policy.
pub fn mailbox(policy: MailboxPolicy) -> (MailboxSender, MailboxReceiver) {
    let shared = Arc::new(MailboxShared {
        state: std::sync::Mutex::new(MailboxState {
            queue: std::collections::VecDeque::with_capacity(policy.capacity()),
            closed: false,
        }),
        capacity: policy.capacity(),
        not_empty: tokio::sync::Notify::new(),
        not_full: tokio::sync::Notify::new(),
    });

    let order = if matches!(policy, MailboxPolicy::Block { .. }) {
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerMsg>();
        let delivery = MailboxSender {
            shared: shared.clone(),
            policy,
            order: None,
        };
        tokio::spawn(async move {
            while let Some(msg) = order_rx.recv().await {
                delivery.deliver_blocking(msg).await;
            }
        });
        Some(order_tx)
    } else {
        None
    };

    (
        MailboxSender {
            shared: shared.clone(),
            policy,
            order,
        },
        MailboxReceiver { shared },
    )
}

/// A unit of concurrency with configuration, typed message handling, and a
/// supervised lifecycle (spec.md §4.1).
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;

    /// Synchronous (logically) initialization; may open resources. Failure
    /// prevents admission to the System.
    async fn initialize(&mut self, ctx: &SystemContext, config: &WorkerConfig) -> Result<()>;

    /// Transition to `Started`; may publish initial messages.
    async fn start(&mut self, ctx: &SystemContext) -> Result<()>;

    /// Idempotent; releases owned resources.
    async fn terminate(&mut self, ctx: &SystemContext);

    async fn pause(&mut self, _ctx: &SystemContext) {}
    async fn resume(&mut self, _ctx: &SystemContext) {}

    /// Dispatched once per mailbox message, strictly serially. Implementors
    /// match on the variant they care about (bus message, timer tick, raw
    /// adapter frame); lifecycle signals are intercepted by the System
    /// itself and never reach here.
    async fn handle(&mut self, ctx: &SystemContext, msg: WorkerMsg) -> Result<()>;
}

/// JSON-ish typed config value helper shared by `WorkerConfig` accessors
/// (kept here to avoid a dependency cycle between `config` and `worker`).
pub(crate) fn missing_key(key: &str) -> Error {
    Error::Config(format!("missing required option `{key}`"))
}

pub(crate) fn bad_type(key: &str, value: &Value) -> Error {
    Error::Config(format!("option `{key}` has the wrong type: {value}"))
}
