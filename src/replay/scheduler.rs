//! The replay scheduler: drives an [`ArchiveReader`] at a pace governed by
//! the [`Clock`](crate::clock::Clock) (spec.md §4.4). This is the most
//! delicate subsystem in the core; the contract below is preserved exactly.

use std::collections::VecDeque;

use async_trait::async_trait;
use log::{info, warn};
use time::OffsetDateTime;
use tokio::time::Duration as TokioDuration;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::message::ChannelId;
use crate::replay::archive::ArchiveEntry;
use crate::replay::ArchiveReader;
use crate::system::SystemContext;
use crate::worker::{TimerTick, Worker, WorkerId, WorkerMsg};

/// An entry is published immediately, rather than via a scheduled timer, if
/// its firing time is within this many wall-clock milliseconds of now
/// (spec.md §4.4 step 2: "default 30 ms"). Not a configured option -- the
/// spec calls this out as a fixed default, distinct from the `skip-millis`
/// tunable used only during initial positioning.
const IMMEDIATE_THRESHOLD_MILLIS: i64 = 30;

fn millis_of(date: OffsetDateTime) -> i64 {
    (date.unix_timestamp_nanos() / 1_000_000) as i64
}

pub type EntryFilter = Box<dyn Fn(&ArchiveEntry) -> bool + Send + Sync>;

struct SchedulerParams {
    break_after: u32,
    skip_millis: i64,
    max_skip: u32,
    end_time_millis: Option<i64>,
    rebase_dates: bool,
    rebase_offset_millis: i64,
    flatten: bool,
    clock_adjuster: bool,
}

impl SchedulerParams {
    fn from_config(config: &WorkerConfig) -> Result<Self> {
        Ok(SchedulerParams {
            break_after: config.break_after(),
            skip_millis: config.skip_millis(),
            max_skip: config.max_skip(),
            end_time_millis: config.end_time()?.map(millis_of),
            rebase_dates: config.rebase_dates(),
            rebase_offset_millis: config.rebase_offset().as_millis() as i64,
            flatten: config.flatten(),
            clock_adjuster: config.clock_adjuster(),
        })
    }
}

/// A worker that reads an archive and publishes its entries according to
/// the scheduling contract of spec.md §4.4.
pub struct ReplayScheduler {
    id: WorkerId,
    reader: Box<dyn ArchiveReader>,
    publish_channel: ChannelId,
    filter: Option<EntryFilter>,
    params: SchedulerParams,

    next_entry: Option<ArchiveEntry>,
    resume_queue: VecDeque<ArchiveEntry>,
    pending_on_resume: Vec<ArchiveEntry>,
    no_more_data: bool,
    t_last_published_millis: Option<i64>,
    immediate_chain: u32,
    n_scheduled: u64,
    skip_count: u32,
    read_failures: u32,
    rebase_delta_millis: i64,
    timer_id: u64,
    expected_timer_id: Option<u64>,
}

impl ReplayScheduler {
    pub fn new(
        id: WorkerId,
        reader: Box<dyn ArchiveReader>,
        publish_channel: ChannelId,
        filter: Option<EntryFilter>,
        config: &WorkerConfig,
    ) -> Result<Self> {
        Ok(ReplayScheduler {
            id,
            reader,
            publish_channel,
            filter,
            params: SchedulerParams::from_config(config)?,
            next_entry: None,
            resume_queue: VecDeque::new(),
            pending_on_resume: Vec::new(),
            no_more_data: false,
            t_last_published_millis: None,
            immediate_chain: 0,
            n_scheduled: 0,
            skip_count: 0,
            read_failures: 0,
            rebase_delta_millis: 0,
            timer_id: 0,
            expected_timer_id: None,
        })
    }

    /// Pull one entry off the archive reader, applying the failure budget
    /// (spec.md §4.4 "Failure semantics": "up to `max-skip` consecutive read
    /// failures are tolerated ... beyond that the replayer terminates with
    /// error") and the configured rebase delta.
    fn pull_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        loop {
            match self.reader.next_entry() {
                Ok(None) => {
                    if !self.no_more_data {
                        info!("worker {}: archive exhausted", self.id);
                        self.no_more_data = true;
                    }
                    return Ok(None);
                }
                Ok(Some(entry)) => {
                    self.read_failures = 0;
                    return Ok(Some(entry.shifted(self.rebase_delta_millis)));
                }
                Err(e) => {
                    self.read_failures += 1;
                    warn!(
                        "worker {}: archive read failure ({}/{}): {e}",
                        self.id, self.read_failures, self.params.max_skip
                    );
                    if self.read_failures > self.params.max_skip {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn next_timer_id(&mut self) -> u64 {
        self.timer_id += 1;
        self.timer_id
    }

    /// Defer the next step onto the worker's own mailbox rather than
    /// tail-recursing, so other pending messages get a turn (spec.md §4.4
    /// step 2: "break-after consecutive immediate publishes").
    fn defer_via_mailbox(&mut self, ctx: &SystemContext) {
        let id = self.next_timer_id();
        self.expected_timer_id = Some(id);
        ctx.mailbox_sender().try_deliver(WorkerMsg::Timer(TimerTick { id }));
    }

    /// Schedule a one-shot wall-clock timer for `wall_delay_millis`, firing
    /// by enqueueing a `Timer` message on this worker's own mailbox (spec.md
    /// §5: "timer firings are enqueued as messages on the owning worker's
    /// mailbox", not invoked as a direct callback).
    fn schedule_timer(&mut self, ctx: &SystemContext, wall_delay_millis: i64) {
        let id = self.next_timer_id();
        self.expected_timer_id = Some(id);
        let mailbox = ctx.mailbox_sender();
        let delay = TokioDuration::from_millis(wall_delay_millis.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mailbox.try_deliver(WorkerMsg::Timer(TimerTick { id }));
        });
    }

    fn publish_entry(&mut self, ctx: &SystemContext, entry: &ArchiveEntry) {
        if self.params.flatten {
            if let Some(items) = entry
                .payload
                .downcast_ref::<serde_json::Value>()
                .and_then(|v| v.as_array())
            {
                for item in items {
                    ctx.publish(&self.publish_channel, item.clone());
                }
                self.n_scheduled += 1;
                self.t_last_published_millis = Some(entry.date_millis);
                return;
            }
        }
        ctx.publish_payload(&self.publish_channel, entry.payload.clone());
        self.n_scheduled += 1;
        self.t_last_published_millis = Some(entry.date_millis);
    }

    /// The scheduling step shared by `start`, timer fires, and mailbox
    /// deferrals: exactly one entry is ever in flight at a time (spec.md
    /// §4.4 step 3, "Ordering invariant"), which is what makes a single
    /// `advance` loop safe to re-enter from any of those call sites.
    async fn advance(&mut self, ctx: &SystemContext) -> Result<()> {
        loop {
            if self.no_more_data {
                return Ok(());
            }
            if ctx.clock().is_paused() {
                if let Some(entry) = self.next_entry.take() {
                    self.pending_on_resume.push(entry);
                }
                self.expected_timer_id = None;
                return Ok(());
            }

            let entry = match self.next_entry.take() {
                Some(e) => e,
                None => match self.resume_queue.pop_front() {
                    Some(e) => e,
                    None => match self.pull_entry()? {
                        Some(e) => e,
                        None => return Ok(()),
                    },
                },
            };

            if let Some(end) = self.params.end_time_millis {
                if entry.date_millis > end {
                    info!("worker {}: reached end-time, stopping replay", self.id);
                    self.no_more_data = true;
                    return Ok(());
                }
            }

            if let Some(filter) = &self.filter {
                if !filter(&entry) {
                    if self.bump_chain_and_maybe_defer(ctx) {
                        return Ok(());
                    }
                    continue;
                }
            }

            let now_millis = ctx.clock().now_millis();
            let delta_wall = ctx
                .clock()
                .sim_to_wall_millis(entry.date_millis - now_millis);

            if delta_wall <= IMMEDIATE_THRESHOLD_MILLIS {
                self.publish_entry(ctx, &entry);
                if self.bump_chain_and_maybe_defer(ctx) {
                    return Ok(());
                }
                continue;
            }

            self.immediate_chain = 0;
            self.next_entry = Some(entry);
            self.schedule_timer(ctx, delta_wall);
            return Ok(());
        }
    }

    /// Returns `true` if the caller should stop (a deferral was scheduled).
    fn bump_chain_and_maybe_defer(&mut self, ctx: &SystemContext) -> bool {
        self.immediate_chain += 1;
        if self.immediate_chain >= self.params.break_after {
            self.immediate_chain = 0;
            self.defer_via_mailbox(ctx);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Worker for ReplayScheduler {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn initialize(&mut self, _ctx: &SystemContext, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }

    /// Initial positioning (spec.md §4.4 step 1): skip archive history
    /// strictly earlier than the clock's start time, optionally rebasing
    /// dates and/or requesting a clock reset off the first observed entry.
    async fn start(&mut self, ctx: &SystemContext) -> Result<()> {
        let first = match self.pull_entry()? {
            Some(e) => e,
            None => {
                self.no_more_data = true;
                return Ok(());
            }
        };

        if self.params.clock_adjuster {
            let date = OffsetDateTime::from_unix_timestamp_nanos(
                first.date_millis as i128 * 1_000_000,
            )
            .map_err(|e| crate::error::Error::Programming(e.to_string()))?;
            ctx.clock().try_adjust_base_once(date);
        }

        if self.params.rebase_dates {
            self.rebase_delta_millis =
                ctx.clock().now_millis() + self.params.rebase_offset_millis - first.date_millis;
        }

        let mut current = first.shifted(self.rebase_delta_millis);
        let start_millis = ctx.clock().now_millis();

        loop {
            if current.date_millis >= start_millis {
                break;
            }
            let behind = start_millis - current.date_millis;
            if behind <= self.params.skip_millis {
                // Close enough to "now" to catch up immediately; not history.
                break;
            }
            self.skip_count += 1;
            if self.skip_count > self.params.max_skip {
                return Err(crate::error::Error::Init {
                    worker: self.id.clone(),
                    reason: format!(
                        "exceeded max-skip ({}) during initial positioning",
                        self.params.max_skip
                    ),
                });
            }
            match self.pull_entry()? {
                Some(e) => current = e,
                None => return Ok(()),
            }
        }

        self.next_entry = Some(current);
        self.advance(ctx).await
    }

    async fn terminate(&mut self, _ctx: &SystemContext) {
        self.no_more_data = true;
    }

    /// Entries pending at pause time are recomputed in stored order on
    /// resume (spec.md §4.4 step 6); if nothing was pending, the next read
    /// is scheduled fresh.
    async fn resume(&mut self, ctx: &SystemContext) {
        self.resume_queue = self.pending_on_resume.drain(..).collect();
        if self.next_entry.is_none() {
            if let Err(e) = self.advance(ctx).await {
                warn!("worker {}: failed to resume replay: {e}", self.id);
            }
        }
    }

    async fn handle(&mut self, ctx: &SystemContext, msg: WorkerMsg) -> Result<()> {
        match msg {
            WorkerMsg::Timer(tick) => {
                if Some(tick.id) != self.expected_timer_id {
                    return Ok(()); // stale tick from a superseded schedule
                }
                self.expected_timer_id = None;
                self.advance(ctx).await
            }
            WorkerMsg::Bus(_) | WorkerMsg::Frame(_) => Ok(()),
            WorkerMsg::Lifecycle(_) => Ok(()),
        }
    }
}
