use proptest::prelude::*;
use std::collections::BTreeMap;

use strata::codec::{decode_chunk, encode_chunk, merge_chunk};
use strata::encoding::{compress_points, decompress_points, BlockCompression};
use strata::types::{AggSet, Bucket};

fn buckets_from(pairs: &[(i64, f64)], slots: usize) -> Vec<Bucket> {
    pairs
        .iter()
        .map(|&(start, seed)| Bucket {
            start,
            values: (0..slots).map(|i| seed + i as f64).collect(),
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_chunk_round_trip(
        mask_bits in 1u8..=0b11_1111,
        starts in prop::collection::btree_set(0i64..100_000, 1..200),
        seed in prop::num::f64::NORMAL,
    ) {
        let mask = AggSet(mask_bits);
        let pairs: Vec<(i64, f64)> = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| (s * 60, seed + i as f64))
            .collect();
        let buckets = buckets_from(&pairs, mask.len());

        let blob = encode_chunk(60, mask, &buckets, BlockCompression::Zstd { level: 0 }).unwrap();
        let decoded = decode_chunk(&blob).unwrap();
        prop_assert_eq!(decoded.resolution, 60);
        prop_assert_eq!(decoded.mask, mask);
        prop_assert_eq!(decoded.buckets, buckets);
    }

    #[test]
    fn prop_merge_is_later_wins_dedup_union(
        existing in prop::collection::btree_map(0i64..500, prop::num::f64::NORMAL, 1..60),
        incoming in prop::collection::btree_map(0i64..500, prop::num::f64::NORMAL, 1..60),
    ) {
        let mask = AggSet(0b11_1111);
        let existing_pairs: Vec<(i64, f64)> =
            existing.iter().map(|(&k, &v)| (k * 60, v)).collect();
        let incoming_pairs: Vec<(i64, f64)> =
            incoming.iter().map(|(&k, &v)| (k * 60, v)).collect();

        let base = encode_chunk(
            60,
            mask,
            &buckets_from(&existing_pairs, mask.len()),
            BlockCompression::None,
        )
        .unwrap();
        let merged_blob = merge_chunk(
            &base,
            &buckets_from(&incoming_pairs, mask.len()),
            60,
            mask,
            BlockCompression::None,
        )
        .unwrap();
        let merged = decode_chunk(&merged_blob).unwrap();

        // Reference model: map union where the incoming side wins.
        let mut model: BTreeMap<i64, f64> = existing_pairs.iter().copied().collect();
        for (k, v) in incoming_pairs {
            model.insert(k, v);
        }
        let expected = buckets_from(
            &model.into_iter().collect::<Vec<_>>(),
            mask.len(),
        );
        prop_assert_eq!(merged.buckets, expected);
    }

    #[test]
    fn prop_point_stream_round_trip(
        deltas in prop::collection::vec(0i64..100_000, 1..300),
        values in prop::collection::vec(prop::num::f64::ANY, 1..300),
    ) {
        let n = deltas.len().min(values.len());
        let mut ts = 1_700_000_000i64;
        let points: Vec<(i64, f64)> = (0..n)
            .map(|i| {
                ts += deltas[i];
                (ts, values[i])
            })
            .collect();

        let blob = compress_points(&points, BlockCompression::Zstd { level: 0 }).unwrap();
        let decoded = decompress_points(&blob, n).unwrap();
        prop_assert_eq!(decoded.len(), n);
        for (a, b) in points.iter().zip(decoded.iter()) {
            prop_assert_eq!(a.0, b.0);
            prop_assert_eq!(a.1.to_bits(), b.1.to_bits());
        }
    }
}
