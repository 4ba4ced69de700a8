//! Publish / receive behaviour: fidelity, ordering, independent cursors and
//! concurrent access from many handles.

mod common;

use common::{create_or_skip, stamped_payload, topic_name, verify_payload};
use shale_topic::{MismatchPolicy, Topic};
use std::sync::{Arc, Barrier};
use std::thread;

fn u32_msg(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

fn recv_u32(topic: &mut Topic) -> u32 {
    let mut out = [0u8; 4];
    topic.receive(&mut out).expect("receive");
    u32::from_le_bytes(out)
}

#[test]
fn published_bytes_arrive_unchanged() {
    let name = topic_name("fidelity");
    let Some(publisher) = create_or_skip(&name, 16, 4, "published_bytes_arrive_unchanged") else {
        return;
    };

    let payloads: [[u8; 16]; 4] = [
        [0u8; 16],
        [0xFF; 16],
        *b"0123456789abcdef",
        std::array::from_fn(|i| (i * 17) as u8),
    ];
    for payload in payloads {
        let mut subscriber = Topic::attach_only(&name, 16, 4, MismatchPolicy::Reject).unwrap();
        subscriber.follow_writer().unwrap();
        publisher.publish(&payload).unwrap();

        let mut out = [0u8; 16];
        subscriber.receive(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    publisher.remove_self().unwrap();
}

#[test]
fn a_full_ring_is_received_in_fifo_order() {
    const N: u32 = 8;
    let name = topic_name("fifo");
    let Some(publisher) = create_or_skip(&name, 4, N, "a_full_ring_is_received_in_fifo_order")
    else {
        return;
    };
    let mut subscriber = Topic::attach_only(&name, 4, N, MismatchPolicy::Reject).unwrap();

    for v in 100..100 + N {
        publisher.publish(&u32_msg(v)).unwrap();
    }
    let received: Vec<u32> = (0..N).map(|_| recv_u32(&mut subscriber)).collect();
    assert_eq!(received, (100..100 + N).collect::<Vec<_>>());
    assert_eq!(subscriber.read_cursor(), 0);

    drop(subscriber);
    publisher.remove_self().unwrap();
}

#[test]
fn subscribers_keep_independent_cursors() {
    let name = topic_name("cursors");
    let Some(publisher) = create_or_skip(&name, 4, 6, "subscribers_keep_independent_cursors")
    else {
        return;
    };
    let mut a = Topic::attach_only(&name, 4, 6, MismatchPolicy::Reject).unwrap();
    let mut b = Topic::attach_any(&name).unwrap();

    for v in 1..=5 {
        publisher.publish(&u32_msg(v)).unwrap();
    }

    let mut seen_a: Vec<u32> = (0..2).map(|_| recv_u32(&mut a)).collect();
    let seen_b: Vec<u32> = (0..5).map(|_| recv_u32(&mut b)).collect();
    seen_a.extend((0..3).map(|_| recv_u32(&mut a)));

    assert_eq!(seen_a, vec![1, 2, 3, 4, 5]);
    assert_eq!(seen_b, seen_a);
    assert_eq!(a.read_cursor(), 5);
    assert_eq!(b.read_cursor(), 5);

    drop((a, b));
    publisher.remove_self().unwrap();
}

#[test]
fn five_messages_through_three_slots_arrive_in_order() {
    let name = topic_name("five3");
    let Some(publisher) =
        create_or_skip(&name, 4, 3, "five_messages_through_three_slots_arrive_in_order")
    else {
        return;
    };
    let mut subscriber = Topic::attach_only(&name, 4, 3, MismatchPolicy::Reject).unwrap();

    let mut received = Vec::new();
    for v in 1..=3 {
        publisher.publish(&u32_msg(v)).unwrap();
    }
    received.push(recv_u32(&mut subscriber));
    // Slot 0 has been vacated by the first read; the fourth publish reuses it.
    publisher.publish(&u32_msg(4)).unwrap();
    received.push(recv_u32(&mut subscriber));
    publisher.publish(&u32_msg(5)).unwrap();
    received.extend((0..3).map(|_| recv_u32(&mut subscriber)));

    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    drop(subscriber);
    publisher.remove_self().unwrap();
}

#[test]
fn publishers_share_one_rotation() {
    let name = topic_name("rotation");
    let Some(first) = create_or_skip(&name, 4, 4, "publishers_share_one_rotation") else {
        return;
    };
    let second = Topic::attach_only(&name, 4, 4, MismatchPolicy::Reject).unwrap();
    let mut subscriber = Topic::attach_any(&name).unwrap();

    first.publish(&u32_msg(10)).unwrap();
    second.publish(&u32_msg(20)).unwrap();
    first.publish(&u32_msg(30)).unwrap();
    assert_eq!(second.writer_cursor().unwrap(), 3);

    let received: Vec<u32> = (0..3).map(|_| recv_u32(&mut subscriber)).collect();
    assert_eq!(received, vec![10, 20, 30]);

    drop((second, subscriber));
    first.remove_self().unwrap();
}

#[test]
fn follow_writer_skips_to_the_next_publish() {
    let name = topic_name("follow");
    let Some(publisher) = create_or_skip(&name, 4, 4, "follow_writer_skips_to_the_next_publish")
    else {
        return;
    };
    for v in 1..=6 {
        publisher.publish(&u32_msg(v)).unwrap();
    }

    let mut late = Topic::attach_any(&name).unwrap();
    late.follow_writer().unwrap();
    assert_eq!(late.read_cursor(), 2);

    publisher.publish(&u32_msg(7)).unwrap();
    assert_eq!(recv_u32(&mut late), 7);

    drop(late);
    publisher.remove_self().unwrap();
}

/// Writers and readers hammer a small ring from separate handles. Every
/// message read must be one that some writer published, intact.
#[test]
fn concurrent_publishers_and_subscribers_never_see_torn_payloads() {
    const WRITERS: u32 = 3;
    const READERS: usize = 3;
    const PER_WRITER: u64 = 400;
    const READS: usize = 1_200;
    const MSG_SIZE: u32 = 96;
    const SLOTS: u32 = 4;

    let name = topic_name("hammer");
    let Some(owner) = create_or_skip(
        &name,
        MSG_SIZE,
        SLOTS,
        "concurrent_publishers_and_subscribers_never_see_torn_payloads",
    ) else {
        return;
    };

    let start = Arc::new(Barrier::new(WRITERS as usize + READERS));
    let mut writers = Vec::new();
    for producer in 0..WRITERS {
        let name = name.clone();
        let start = Arc::clone(&start);
        writers.push(thread::spawn(move || {
            let topic =
                Topic::attach_only(&name, MSG_SIZE, SLOTS, MismatchPolicy::Reject).unwrap();
            start.wait();
            for seq in 0..PER_WRITER {
                topic
                    .publish(&stamped_payload(seq, producer, MSG_SIZE as usize))
                    .unwrap();
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..READERS {
        let name = name.clone();
        let start = Arc::clone(&start);
        readers.push(thread::spawn(move || {
            let mut topic = Topic::attach_any(&name).unwrap();
            let mut out = vec![0u8; MSG_SIZE as usize];
            let mut intact = 0usize;
            start.wait();
            for _ in 0..READS {
                topic.receive(&mut out).unwrap();
                if out.iter().all(|&b| b == 0) {
                    continue;
                }
                let (seq, producer) = verify_payload(&out).expect("torn payload");
                assert!(seq < PER_WRITER);
                assert!(producer < WRITERS);
                intact += 1;
            }
            intact
        }));
    }

    for w in writers {
        w.join().expect("writer thread panicked");
    }
    let intact: usize = readers
        .into_iter()
        .map(|r| r.join().expect("reader thread panicked"))
        .sum();
    eprintln!("concurrent test: {intact} intact non-empty reads");

    // Every slot ends up holding a complete final-round message.
    let mut check = Topic::attach_any(&name).unwrap();
    for _ in 0..SLOTS {
        let payload = check.receive_vec().unwrap();
        let (seq, _) = verify_payload(&payload).expect("slot left torn");
        assert!(seq < PER_WRITER);
    }
    let total = u64::from(WRITERS) * PER_WRITER;
    assert_eq!(check.writer_cursor().unwrap(), (total % u64::from(SLOTS)) as u32);

    drop(check);
    owner.remove_self().unwrap();
}
