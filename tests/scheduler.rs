use std::io::Write;
use std::time::Duration;

use race_core::clock::Clock;
use race_core::message::ChannelId;
use race_core::replay::{JsonLinesArchiveReader, ReplayScheduler};
use race_core::system::{SupervisionPolicy, System};
use race_core::worker::{mailbox, MailboxPolicy, WorkerId, WorkerMsg};
use race_core::WorkerConfig;
use time::macros::datetime;

fn write_archive(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(f, "{line}").unwrap();
    }
    f
}

#[tokio::test]
async fn replay_monotonicity() {
    let start = datetime!(2025-01-01 00:00:00 UTC);
    let clock = Clock::new(start, 50.0);
    let system = System::new(clock);

    let archive = write_archive(&[
        r#"{"date":"2025-01-01T00:00:00Z","payload":1}"#,
        r#"{"date":"2025-01-01T00:00:01Z","payload":2}"#,
        r#"{"date":"2025-01-01T00:00:02Z","payload":3}"#,
    ]);
    let reader = JsonLinesArchiveReader::open(archive.path()).unwrap();

    let channel: ChannelId = "/out".into();
    let (tx, mut rx) = mailbox(MailboxPolicy::DropNewest { capacity: 8 });
    system.bus().subscribe(WorkerId::new("sink"), channel.clone(), tx);

    let config = WorkerConfig::from_json_str(r#"{"name":"r","class":"replay"}"#).unwrap();
    let worker = ReplayScheduler::new(
        WorkerId::new("replayer"),
        Box::new(reader),
        channel,
        None,
        &config,
    )
    .unwrap();

    system
        .spawn_worker(
            Box::new(worker),
            config,
            MailboxPolicy::DropNewest { capacity: 8 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(WorkerMsg::Bus(m))) => {
                seen.push(*m.downcast::<serde_json::Value>().unwrap())
            }
            other => panic!("expected a bus message, got {other:?}"),
        }
    }
    assert_eq!(seen, vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]);
    system.shutdown().await;
}

#[tokio::test]
async fn rebase_shifts_recorded_dates() {
    // The archive's own dates are far in the past; `rebase-dates` must shift
    // every entry so the first lands at (roughly) the clock's current time
    // rather than being skipped as ancient history.
    let start = datetime!(2025-06-01 00:00:00 UTC);
    let clock = Clock::new(start, 50.0);
    let system = System::new(clock);

    let archive = write_archive(&[
        r#"{"date":"2020-08-19T10:00:00Z","payload":"a"}"#,
        r#"{"date":"2020-08-19T10:00:01Z","payload":"b"}"#,
    ]);
    let reader = JsonLinesArchiveReader::open(archive.path()).unwrap();

    let channel: ChannelId = "/out".into();
    let (tx, mut rx) = mailbox(MailboxPolicy::DropNewest { capacity: 8 });
    system.bus().subscribe(WorkerId::new("sink"), channel.clone(), tx);

    let config =
        WorkerConfig::from_json_str(r#"{"name":"r","class":"replay","rebase-dates":true}"#)
            .unwrap();
    let worker = ReplayScheduler::new(
        WorkerId::new("replayer"),
        Box::new(reader),
        channel,
        None,
        &config,
    )
    .unwrap();

    system
        .spawn_worker(
            Box::new(worker),
            config,
            MailboxPolicy::DropNewest { capacity: 8 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    // Without rebasing, entries from 2020 would never be "caught up to" and
    // would be skipped as history past max-skip; rebasing means both arrive.
    for expected in ["a", "b"] {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(WorkerMsg::Bus(m))) => {
                assert_eq!(*m.downcast::<serde_json::Value>().unwrap(), serde_json::json!(expected))
            }
            other => panic!("expected a bus message, got {other:?}"),
        }
    }
    system.shutdown().await;
}
