use race_core::message::ChannelId;
use race_core::worker::{mailbox, MailboxPolicy, WorkerMsg};
use race_core::{Bus, WorkerId};

#[test]
fn each_subscriber_sees_its_own_channel_only() {
    let bus = Bus::new();
    let a: ChannelId = "/a".into();
    let b: ChannelId = "/b".into();
    let (tx_a, mut rx_a) = mailbox(MailboxPolicy::DropNewest { capacity: 4 });
    let (tx_b, mut rx_b) = mailbox(MailboxPolicy::DropNewest { capacity: 4 });
    bus.subscribe(WorkerId::new("a"), a.clone(), tx_a);
    bus.subscribe(WorkerId::new("b"), b.clone(), tx_b);

    bus.publish(&a, 1u32, None);
    bus.publish(&b, 2u32, None);

    let got_a = rx_a.try_recv();
    let got_b = rx_b.try_recv();
    match (got_a, got_b) {
        (Some(WorkerMsg::Bus(m1)), Some(WorkerMsg::Bus(m2))) => {
            assert_eq!(*m1.downcast::<u32>().unwrap(), 1);
            assert_eq!(*m2.downcast::<u32>().unwrap(), 2);
        }
        other => panic!("expected one bus message each, got {other:?}"),
    }
}

#[test]
fn unsubscribe_stops_further_delivery() {
    let bus = Bus::new();
    let channel: ChannelId = "/t".into();
    let worker = WorkerId::new("w");
    let (tx, mut rx) = mailbox(MailboxPolicy::DropNewest { capacity: 4 });
    bus.subscribe(worker.clone(), channel.clone(), tx);

    bus.publish(&channel, 1u32, None);
    bus.unsubscribe(&worker, &channel);
    bus.publish(&channel, 2u32, None);

    assert_eq!(bus.subscriber_count(&channel), 0);
    match rx.try_recv() {
        Some(WorkerMsg::Bus(m)) => assert_eq!(*m.downcast::<u32>().unwrap(), 1),
        other => panic!("expected the pre-unsubscribe message, got {other:?}"),
    }
    assert!(rx.try_recv().is_none(), "no message should follow unsubscribe");
}

#[tokio::test]
async fn block_policy_eventually_delivers_without_blocking_the_publisher() {
    let bus = Bus::new();
    let channel: ChannelId = "/slow".into();
    let (tx, mut rx) = mailbox(MailboxPolicy::Block { capacity: 1 });
    bus.subscribe(WorkerId::new("slow"), channel.clone(), tx);

    // Fill the one slot, then publish a second time: publish() must return
    // immediately even though the subscriber's mailbox is full, because the
    // Block policy backpressures the delivery task, never the publisher.
    bus.publish(&channel, 1u32, None);
    let accepted = bus.publish(&channel, 2u32, None);
    assert_eq!(accepted, 1, "publish counts the delivery as accepted once spawned");

    // Both deliveries are serialized through this subscriber's own delivery
    // task, so they must arrive in the order they were published.
    for expected in [1u32, 2u32] {
        match rx.recv().await.unwrap() {
            WorkerMsg::Bus(m) => assert_eq!(*m.downcast::<u32>().unwrap(), expected),
            other => panic!("expected a bus message, got {other:?}"),
        }
    }
}

#[test]
fn failed_delivery_to_one_subscriber_does_not_affect_others() {
    let bus = Bus::new();
    let channel: ChannelId = "/fanout".into();
    let (tx_full, _rx_full) = mailbox(MailboxPolicy::DropNewest { capacity: 1 });
    let (tx_ok, mut rx_ok) = mailbox(MailboxPolicy::DropNewest { capacity: 4 });
    bus.subscribe(WorkerId::new("full"), channel.clone(), tx_full);
    bus.subscribe(WorkerId::new("ok"), channel.clone(), tx_ok);

    bus.publish(&channel, 1u32, None); // fills "full"'s one slot
    let delivered = bus.publish(&channel, 2u32, None); // "full" rejects, "ok" accepts
    assert_eq!(delivered, 1);

    assert!(rx_ok.try_recv().is_some());
    assert!(rx_ok.try_recv().is_some());
}
