use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use race_core::clock::Clock;
use race_core::message::ChannelId;
use race_core::system::{SupervisionPolicy, System, SystemContext};
use race_core::worker::{LifecycleState, MailboxPolicy, Worker, WorkerId, WorkerMsg};
use race_core::{Error, Result, WorkerConfig};
use time::macros::datetime;

fn new_system() -> Arc<System> {
    let clock = Clock::new(datetime!(2025-01-01 00:00:00 UTC), 1.0);
    System::new(clock)
}

struct CountingWorker {
    id: WorkerId,
    pauses: Arc<AtomicU32>,
    resumes: Arc<AtomicU32>,
}

#[async_trait]
impl Worker for CountingWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }
    async fn initialize(&mut self, _ctx: &SystemContext, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }
    async fn start(&mut self, _ctx: &SystemContext) -> Result<()> {
        Ok(())
    }
    async fn terminate(&mut self, _ctx: &SystemContext) {}
    async fn pause(&mut self, _ctx: &SystemContext) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }
    async fn resume(&mut self, _ctx: &SystemContext) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
    async fn handle(&mut self, _ctx: &SystemContext, _msg: WorkerMsg) -> Result<()> {
        Ok(())
    }
}

async fn spawn_counting(system: &Arc<System>, name: &str) -> (WorkerId, Arc<AtomicU32>, Arc<AtomicU32>) {
    let pauses = Arc::new(AtomicU32::new(0));
    let resumes = Arc::new(AtomicU32::new(0));
    let worker = Box::new(CountingWorker {
        id: WorkerId::new(name),
        pauses: pauses.clone(),
        resumes: resumes.clone(),
    });
    let config = WorkerConfig::from_json_str(&format!(r#"{{"name":"{name}","class":"test"}}"#)).unwrap();
    let id = system
        .spawn_worker(
            worker,
            config,
            MailboxPolicy::DropNewest { capacity: 4 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();
    (id, pauses, resumes)
}

#[tokio::test]
async fn pause_and_resume_simulation_reach_every_worker_exactly_once() {
    let system = new_system();
    let (id_a, pauses_a, resumes_a) = spawn_counting(&system, "a").await;
    let (id_b, pauses_b, resumes_b) = spawn_counting(&system, "b").await;

    system.pause_simulation();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(system.clock().is_paused());
    assert_eq!(pauses_a.load(Ordering::SeqCst), 1);
    assert_eq!(pauses_b.load(Ordering::SeqCst), 1);
    assert_eq!(system.worker_state(&id_a), Some(LifecycleState::Paused));
    assert_eq!(system.worker_state(&id_b), Some(LifecycleState::Paused));

    system.resume_simulation();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!system.clock().is_paused());
    assert_eq!(resumes_a.load(Ordering::SeqCst), 1);
    assert_eq!(resumes_b.load(Ordering::SeqCst), 1);
    assert_eq!(system.worker_state(&id_a), Some(LifecycleState::Started));
    assert_eq!(system.worker_state(&id_b), Some(LifecycleState::Started));

    system.shutdown().await;
}

#[tokio::test]
async fn terminate_is_idempotent_and_final() {
    let system = new_system();
    let (id, _pauses, _resumes) = spawn_counting(&system, "once").await;

    system.terminate(&id);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(system.worker_state(&id), Some(LifecycleState::Terminated));

    // A second terminate on an already-terminated worker must not error or panic.
    system.terminate(&id);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(system.worker_state(&id), Some(LifecycleState::Terminated));
}

struct FailingWorker {
    id: WorkerId,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Worker for FailingWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }
    async fn initialize(&mut self, _ctx: &SystemContext, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }
    async fn start(&mut self, _ctx: &SystemContext) -> Result<()> {
        Ok(())
    }
    async fn terminate(&mut self, _ctx: &SystemContext) {}
    async fn handle(&mut self, _ctx: &SystemContext, _msg: WorkerMsg) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Programming("handler always fails".into()))
    }
}

#[tokio::test]
async fn repeated_handler_failures_exceed_supervision_and_the_worker_stops() {
    let system = new_system();
    let attempts = Arc::new(AtomicU32::new(0));
    let worker = Box::new(FailingWorker {
        id: WorkerId::new("flaky"),
        attempts: attempts.clone(),
    });
    let config = WorkerConfig::from_json_str(r#"{"name":"flaky","class":"test","read-from":"/in"}"#)
        .unwrap();
    let supervision = SupervisionPolicy {
        max_restart_attempts: 2,
        ..SupervisionPolicy::default()
    };
    let id = system
        .spawn_worker(
            worker,
            config,
            MailboxPolicy::DropNewest { capacity: 8 },
            supervision,
            None,
        )
        .await
        .unwrap();

    // Publish one at a time, with room for each to be handled (and the
    // resulting failed-mailbox drain to run) before the next arrives --
    // otherwise a burst would be wiped out in a single drain after the
    // first failure, understating how many attempts actually ran.
    let channel: ChannelId = "/in".into();
    for _ in 0..5 {
        system.bus().publish(&channel, 1u32, None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if system.worker_state(&id) == Some(LifecycleState::Terminated) {
            break;
        }
    }

    assert_eq!(system.worker_state(&id), Some(LifecycleState::Terminated));
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        supervision.max_restart_attempts + 1,
        "must stop on the attempt whose failure count first exceeds max_restart_attempts"
    );
}

#[tokio::test]
async fn heartbeat_sweep_does_not_flag_a_healthy_worker() {
    let system = new_system();
    let worker = Box::new(CountingWorker {
        id: WorkerId::new("healthy"),
        pauses: Arc::new(AtomicU32::new(0)),
        resumes: Arc::new(AtomicU32::new(0)),
    });
    let config = WorkerConfig::from_json_str(r#"{"name":"healthy","class":"test"}"#).unwrap();
    let id = system
        .spawn_worker(
            worker,
            config,
            MailboxPolicy::DropNewest { capacity: 1 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    let stuck = system.heartbeat_sweep(Duration::from_millis(200)).await;
    assert!(!stuck.contains(&id));

    system.shutdown().await;
}

#[tokio::test]
async fn heartbeat_sweep_flags_a_worker_whose_mailbox_is_gone() {
    let system = new_system();
    let (id, _pauses, _resumes) = spawn_counting(&system, "gone").await;
    system.terminate(&id);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The worker's task has exited and dropped its mailbox receiver, so a
    // ping can no longer be delivered -- the sweep must report it rather
    // than hang waiting for a reply that will never come.
    let stuck = system.heartbeat_sweep(Duration::from_millis(200)).await;
    assert!(stuck.contains(&id));
}
