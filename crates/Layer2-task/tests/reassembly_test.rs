//! Line reassembly must not depend on how the input is chunked

use ioc_foundation::OverflowPolicy;
use ioc_task::{StreamBuffer, StreamKind};
use proptest::prelude::*;

/// Large enough that no generated input overflows
const CAPACITY: usize = 1024;

fn expected(data: &[u8]) -> (Vec<String>, Vec<u8>) {
    let mut parts: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    let fragment = parts.pop().unwrap_or_default().to_vec();
    let lines = parts
        .into_iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    (lines, fragment)
}

fn line_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop_oneof![
            3 => prop::sample::select(b"abcXYZ019 :_-".to_vec()),
            1 => Just(b'\n'),
        ],
        0..400,
    )
}

proptest! {
    #[test]
    fn reassembly_is_chunk_size_invariant(
        data in line_bytes(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let mut points: Vec<usize> = cuts.iter().map(|c| c.index(data.len() + 1)).collect();
        points.push(0);
        points.push(data.len());
        points.sort_unstable();
        points.dedup();

        let mut buffer = StreamBuffer::new(StreamKind::Stdout, CAPACITY);
        let mut total = 0;
        for pair in points.windows(2) {
            let feed = buffer.feed(&data[pair[0]..pair[1]]);
            prop_assert_eq!(feed.consumed, pair[1] - pair[0]);
            total += feed.lines;
        }

        let (lines, fragment) = expected(&data);
        prop_assert_eq!(total, lines.len());
        prop_assert_eq!(buffer.lines(), lines.as_slice());
        prop_assert_eq!(buffer.pending(), fragment.as_slice());
    }

    #[test]
    fn split_policy_never_loses_bytes(
        data in line_bytes(),
        chunk in 1usize..64,
        capacity in 4usize..32,
    ) {
        let mut buffer = StreamBuffer::new(StreamKind::Stdout, capacity)
            .with_overflow(OverflowPolicy::Split);
        for piece in data.chunks(chunk) {
            let feed = buffer.feed(piece);
            prop_assert_eq!(feed.consumed, piece.len());
        }

        let newlines = data.iter().filter(|&&b| b == b'\n').count();
        let kept: usize = buffer.history_bytes() + buffer.pending().len();
        prop_assert_eq!(kept + newlines, data.len());
        prop_assert!(buffer.lines().iter().all(|l| l.len() <= capacity));
    }
}
