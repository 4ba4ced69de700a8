#![allow(dead_code)]

use shale_topic::Topic;

/// Topic name unique to this test process and `tag`.
pub fn topic_name(tag: &str) -> String {
    format!("/shale-it-{tag}-{}", std::process::id())
}

/// Creates a fresh topic, or returns `None` when the sandbox denies POSIX
/// shared memory.
pub fn create_or_skip(name: &str, msg_size: u32, msg_count: u32, test: &str) -> Option<Topic> {
    let _ = Topic::remove(name);
    match Topic::create_or_fail(name, msg_size, msg_count) {
        Ok(topic) => Some(topic),
        Err(err) if err.is_permission_denied() => {
            eprintln!("Skipping {test}: {err}");
            None
        }
        Err(err) => panic!("create_or_fail({name}) failed: {err}"),
    }
}

/// Payload carrying a sequence number, the producer id and a checksum over
/// both, padded to `msg_size` with a byte pattern derived from `seq`.
pub fn stamped_payload(seq: u64, producer: u32, msg_size: usize) -> Vec<u8> {
    assert!(msg_size >= 20);
    let mut out = vec![0u8; msg_size];
    out[0..8].copy_from_slice(&seq.to_le_bytes());
    out[8..12].copy_from_slice(&producer.to_le_bytes());
    for (i, b) in out[20..].iter_mut().enumerate() {
        *b = (seq as u8).wrapping_add(i as u8);
    }
    let sum = checksum(&out);
    out[12..20].copy_from_slice(&sum.to_le_bytes());
    out
}

/// Decodes `(seq, producer)` if the payload is intact, `None` if torn.
pub fn verify_payload(payload: &[u8]) -> Option<(u64, u32)> {
    let seq = u64::from_le_bytes(payload[0..8].try_into().ok()?);
    let producer = u32::from_le_bytes(payload[8..12].try_into().ok()?);
    let stored = u64::from_le_bytes(payload[12..20].try_into().ok()?);
    let mut copy = payload.to_vec();
    copy[12..20].fill(0);
    (checksum(&copy) == stored).then_some((seq, producer))
}

fn checksum(bytes: &[u8]) -> u64 {
    // FNV-1a
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, &b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
