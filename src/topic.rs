//! Topic-level subscription arbitration on top of the Bus (spec.md §4.6).
//!
//! Producer workers advertise that they can provide topics; consumer workers
//! request topics. On the first request for a `(channel, topic)` pair the
//! registry asks the channel's provider(s) whether they accept; only
//! accepting providers begin generating data. On the last release, providers
//! are told so they can stop.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::message::ChannelId;
use crate::worker::WorkerId;

/// An opaque descriptor a provider uses to decide whether to begin/cease
/// producing. Kept as a `Send + Sync` trait object so domain workers can use
/// any topic shape without the registry knowing it.
pub type Topic = Arc<dyn Any + Send + Sync>;

pub fn topic<T: Any + Send + Sync>(value: T) -> Topic {
    Arc::new(value)
}

#[derive(Clone)]
pub struct TopicRequest {
    pub channel: ChannelId,
    pub topic: Topic,
    pub client: WorkerId,
}

impl fmt::Debug for TopicRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRequest")
            .field("channel", &self.channel)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TopicRelease {
    pub channel: ChannelId,
    pub topic: Topic,
    pub client: WorkerId,
}

/// Implemented by a producer worker that wants on-demand activation.
#[async_trait]
pub trait TopicProvider: Send + Sync {
    fn id(&self) -> &WorkerId;
    async fn is_request_accepted(&self, request: &TopicRequest) -> bool;
    async fn on_accept(&self, request: &TopicRequest);
    async fn on_release(&self, release: &TopicRelease);
}

/// Identifies a topic for the purpose of tracking "first request" / "last
/// release"; topics are compared by pointer identity of their `Arc`, which is
/// enough for the registry (it never inspects topic contents) and avoids
/// requiring `Eq`/`Hash` on arbitrary domain topic types.
#[derive(Clone)]
struct TopicKey {
    channel: ChannelId,
    topic_ptr: usize,
}

impl TopicKey {
    fn new(channel: &ChannelId, topic: &Topic) -> Self {
        TopicKey {
            channel: channel.clone(),
            topic_ptr: Arc::as_ptr(topic) as *const () as usize,
        }
    }
}

impl PartialEq for TopicKey {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel && self.topic_ptr == other.topic_ptr
    }
}
impl Eq for TopicKey {}
impl std::hash::Hash for TopicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.channel.hash(state);
        self.topic_ptr.hash(state);
    }
}

struct Subscription {
    topic: Topic,
    clients: HashSet<WorkerId>,
}

pub struct TopicRegistry {
    providers: RwLock<HashMap<ChannelId, Vec<Arc<dyn TopicProvider>>>>,
    subscriptions: RwLock<HashMap<TopicKey, Subscription>>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        TopicRegistry {
            providers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_provider(&self, channel: ChannelId, provider: Arc<dyn TopicProvider>) {
        self.providers
            .write()
            .unwrap()
            .entry(channel)
            .or_default()
            .push(provider);
    }

    /// Request `topic` on `channel` on behalf of `client`. On the first
    /// request for this `(channel, topic)`, every registered provider for the
    /// channel is asked whether it accepts; only accepting providers are
    /// told to start. Returns `true` if at least one provider accepted (or
    /// this is not the first request and a provider already accepted it).
    pub async fn request(&self, channel: ChannelId, topic: Topic, client: WorkerId) -> bool {
        let key = TopicKey::new(&channel, &topic);
        let is_first = {
            let mut subs = self.subscriptions.write().unwrap();
            match subs.get_mut(&key) {
                Some(sub) => {
                    sub.clients.insert(client.clone());
                    false
                }
                None => {
                    let mut clients = HashSet::new();
                    clients.insert(client.clone());
                    subs.insert(
                        key.clone(),
                        Subscription {
                            topic: topic.clone(),
                            clients,
                        },
                    );
                    true
                }
            }
        };

        if !is_first {
            return true;
        }

        let request = TopicRequest {
            channel: channel.clone(),
            topic: topic.clone(),
            client: client.clone(),
        };
        let providers = self
            .providers
            .read()
            .unwrap()
            .get(&channel)
            .cloned()
            .unwrap_or_default();

        let mut any_accepted = false;
        for provider in &providers {
            if provider.is_request_accepted(&request).await {
                provider.on_accept(&request).await;
                any_accepted = true;
            }
        }

        if !any_accepted {
            // No provider wanted it: don't leave a dangling subscription.
            self.subscriptions.write().unwrap().remove(&key);
        }
        any_accepted
    }

    /// Release `topic` on `channel` for `client`. On the last release,
    /// providers are notified so they may stop generating.
    pub async fn release(&self, channel: ChannelId, topic: Topic, client: WorkerId) {
        let key = TopicKey::new(&channel, &topic);
        let was_last = {
            let mut subs = self.subscriptions.write().unwrap();
            match subs.get_mut(&key) {
                Some(sub) => {
                    sub.clients.remove(&client);
                    if sub.clients.is_empty() {
                        subs.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => return,
            }
        };

        if !was_last {
            return;
        }

        let release = TopicRelease {
            channel: channel.clone(),
            topic,
            client,
        };
        let providers = self
            .providers
            .read()
            .unwrap()
            .get(&channel)
            .cloned()
            .unwrap_or_default();
        for provider in &providers {
            provider.on_release(&release).await;
        }
    }

    pub fn has_subscribers(&self, channel: &ChannelId, topic: &Topic) -> bool {
        let key = TopicKey::new(channel, topic);
        self.subscriptions.read().unwrap().contains_key(&key)
    }
}
