//! Fuzz harness for inbound link frame validation.
//!
//! Feeds arbitrary bytes through `FrameValidator::accept` as a stream of
//! frames, split on a one-byte length prefix. Checks that nothing panics and
//! that accepted sequence numbers strictly increase.

#![no_main]
use libfuzzer_sys::fuzz_target;
use rbgate_core::link::{FrameValidator, LinkMessage};

fuzz_target!(|data: &[u8]| {
    let mut validator = FrameValidator::new();
    let issued = validator.issue(LinkMessage::Heartbeat);

    let mut last = None;
    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let take = usize::from(len).min(tail.len());
        let (chunk, next) = tail.split_at(take);
        rest = next;

        // Half the inputs get the issued token spliced in so validation
        // reaches the sequence check.
        let mut frame = chunk.to_vec();
        if len & 1 == 0 && frame.len() >= 24 {
            frame[8..24].copy_from_slice(issued.token.as_bytes());
        }

        if let Ok(accepted) = validator.accept(&frame) {
            if let Some(prev) = last {
                assert!(accepted.sequence > prev);
            }
            last = Some(accepted.sequence);
        }
    }

    let stats = validator.stats();
    assert_eq!(stats.accepted + stats.dropped(), {
        let mut n = 0u64;
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            rest = &tail[usize::from(len).min(tail.len())..];
            n += 1;
        }
        n
    });
});
