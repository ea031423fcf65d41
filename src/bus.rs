//! The named-channel publish/subscribe bus (spec.md §4.2).

use std::collections::HashMap;
use std::sync::RwLock;

use log::{debug, warn};

use crate::message::{payload, ChannelId, Message, Payload};
use crate::worker::{MailboxSender, TimerTick, WorkerId, WorkerMsg};

/// Mapping from channel to the set of subscribed workers' mailboxes.
///
/// The map is guarded by a single `RwLock` (spec.md §5: "the Bus subscription
/// map is the only widely-shared mutable structure"); `publish` takes a read
/// lock just long enough to clone the current subscriber list, so a
/// subscriber observed during publish either receives that publish or
/// cleanly misses it -- never a partial delivery.
pub struct Bus {
    channels: RwLock<HashMap<ChannelId, HashMap<WorkerId, MailboxSender>>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Set semantics: duplicate subscribes are idempotent.
    pub fn subscribe(&self, worker: WorkerId, channel: ChannelId, mailbox: MailboxSender) {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(channel)
            .or_default()
            .insert(worker, mailbox);
    }

    pub fn unsubscribe(&self, worker: &WorkerId, channel: &ChannelId) {
        let mut channels = self.channels.write().unwrap();
        if let Some(subs) = channels.get_mut(channel) {
            subs.remove(worker);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Remove a worker from every channel it is subscribed to (used on
    /// termination).
    pub fn unsubscribe_all(&self, worker: &WorkerId) {
        let mut channels = self.channels.write().unwrap();
        channels.retain(|_, subs| {
            subs.remove(worker);
            !subs.is_empty()
        });
    }

    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .read()
            .unwrap()
            .get(channel)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Enqueue `value` onto the mailbox of every current subscriber of
    /// `channel`. Never blocks the publisher; for a fixed publisher and
    /// channel, each individual subscriber observes messages in the order
    /// this is called (spec.md §4.2, §5, §8) -- `Block`-policy subscribers
    /// get this via their own single delivery task, so two enqueues onto the
    /// same subscriber can never be reordered by task scheduling.
    ///
    /// Returns the number of subscribers the message was *accepted* by --
    /// failures are per-subscriber and do not affect delivery to others
    /// (spec.md §7).
    pub fn publish<T: std::any::Any + Send + Sync>(
        &self,
        channel: &ChannelId,
        value: T,
        originator: Option<WorkerId>,
    ) -> usize {
        self.publish_payload(channel, payload(value), originator)
    }

    pub fn publish_payload(
        &self,
        channel: &ChannelId,
        value: Payload,
        originator: Option<WorkerId>,
    ) -> usize {
        let subs: Vec<(WorkerId, MailboxSender)> = {
            let channels = self.channels.read().unwrap();
            match channels.get(channel) {
                Some(subs) => subs.iter().map(|(w, m)| (w.clone(), m.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0usize;
        for (worker, mailbox) in subs {
            let msg = Message::new(channel.clone(), value.clone(), originator.clone());
            if mailbox.is_block_policy() {
                // Backpressure this one subscriber only, via its own
                // delivery task, never the publisher, never siblings, and
                // never out of order relative to this same subscriber's
                // other deliveries (spec.md §4.2).
                if mailbox.enqueue_blocking(WorkerMsg::Bus(msg)) {
                    delivered += 1;
                } else {
                    warn!("dropped message on channel {channel} for worker {worker} (mailbox gone)");
                }
            } else if mailbox.try_deliver(WorkerMsg::Bus(msg)) {
                delivered += 1;
            } else {
                warn!("dropped message on channel {channel} for worker {worker} (mailbox full)");
            }
        }
        debug!("published to {channel}: {delivered}/{} subscribers", {
            let channels = self.channels.read().unwrap();
            channels.get(channel).map(HashMap::len).unwrap_or(0)
        });
        delivered
    }

    /// Deliver a scheduler/timer tick directly to one worker's mailbox,
    /// bypassing channel fan-out (spec.md §5: "timer firings are enqueued as
    /// messages on the owning worker's mailbox").
    pub fn deliver_timer(&self, channel_owner: &ChannelId, worker: &WorkerId, tick: TimerTick) -> bool {
        let channels = self.channels.read().unwrap();
        channels
            .get(channel_owner)
            .and_then(|subs| subs.get(worker))
            .map(|mailbox| mailbox.try_deliver(WorkerMsg::Timer(tick)))
            .unwrap_or(false)
    }
}
