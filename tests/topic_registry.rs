use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use race_core::clock::Clock;
use race_core::message::ChannelId;
use race_core::system::{SupervisionPolicy, System, SystemContext};
use race_core::topic::{topic, Topic, TopicProvider, TopicRelease, TopicRequest};
use race_core::worker::{MailboxPolicy, Worker, WorkerId, WorkerMsg};
use race_core::{Error, Result, WorkerConfig};
use time::macros::datetime;

struct OnDemandProvider {
    id: WorkerId,
    producing: Arc<AtomicBool>,
}

#[async_trait]
impl TopicProvider for OnDemandProvider {
    fn id(&self) -> &WorkerId {
        &self.id
    }
    async fn is_request_accepted(&self, _request: &TopicRequest) -> bool {
        true
    }
    async fn on_accept(&self, _request: &TopicRequest) {
        self.producing.store(true, Ordering::SeqCst);
    }
    async fn on_release(&self, _release: &TopicRelease) {
        self.producing.store(false, Ordering::SeqCst);
    }
}

/// A consumer worker that requests a topic on `start` and releases it on
/// `terminate`, the way a domain worker drives on-demand activation through
/// `SystemContext` rather than touching the registry directly.
struct ConsumerWorker {
    id: WorkerId,
    channel: ChannelId,
    topic: Topic,
}

#[async_trait]
impl Worker for ConsumerWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }
    async fn initialize(&mut self, _ctx: &SystemContext, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }
    async fn start(&mut self, ctx: &SystemContext) -> Result<()> {
        if !ctx.request_topic(self.channel.clone(), self.topic.clone()).await {
            return Err(Error::Init {
                worker: self.id.clone(),
                reason: "topic request was rejected".into(),
            });
        }
        Ok(())
    }
    async fn terminate(&mut self, ctx: &SystemContext) {
        ctx.release_topic(self.channel.clone(), self.topic.clone()).await;
    }
    async fn handle(&mut self, _ctx: &SystemContext, _msg: WorkerMsg) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn topic_on_demand_activation() {
    let clock = Clock::new(datetime!(2025-01-01 00:00:00 UTC), 1.0);
    let system = System::new(clock);

    let channel: ChannelId = "/feed".into();
    let producing = Arc::new(AtomicBool::new(false));
    system.topics().register_provider(
        channel.clone(),
        Arc::new(OnDemandProvider {
            id: WorkerId::new("provider"),
            producing: producing.clone(),
        }),
    );
    assert!(!producing.load(Ordering::SeqCst), "no consumer yet: provider idle");

    let shared_topic = topic("live");
    let consumer = Box::new(ConsumerWorker {
        id: WorkerId::new("consumer"),
        channel: channel.clone(),
        topic: shared_topic.clone(),
    });
    let config = WorkerConfig::from_json_str(r#"{"name":"consumer","class":"test"}"#).unwrap();
    let consumer_id = system
        .spawn_worker(
            consumer,
            config,
            MailboxPolicy::DropNewest { capacity: 4 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    assert!(
        producing.load(Ordering::SeqCst),
        "first request must activate the provider"
    );

    system.terminate(&consumer_id);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(
        !producing.load(Ordering::SeqCst),
        "last release must stop the provider"
    );

    system.shutdown().await;
}
