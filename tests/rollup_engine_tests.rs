use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use strata::{Aggregate, Labels, ManualClock, Matcher, Schema, StoreConfig, TierSpec, TsStore};

const T0: i64 = 1_700_000_000;
const WINDOW: i64 = 14_400;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn manual_config(dir: &std::path::Path, clock: Arc<ManualClock>) -> StoreConfig {
    StoreConfig {
        data_dir: dir.to_path_buf(),
        shards: 1,
        flush_interval: Duration::from_secs(3_600),
        pending_flush_interval: Duration::from_secs(3_600),
        rollup_interval: Duration::from_secs(3_600),
        retention_check_interval: Duration::from_secs(3_600),
        rollup_safety_margin: 120,
        schema: Schema {
            tiers: vec![
                TierSpec::new("hourly", 3_600, 24, Some(90 * 86_400)),
                TierSpec::new("daily", 86_400, 30, None),
            ],
        },
        clock,
        ..StoreConfig::default()
    }
}

/// Writes `ts in [T0, T0 + n)` with `value = ts mod 100`, seals, rolls up.
fn fill_and_roll(store: &TsStore, clock: &ManualClock, n: i64) {
    let l = labels(&[("host", "a")]);
    for i in 0..n {
        let ts = T0 + i;
        store.write("cpu", &l, (ts % 100) as f64, ts).unwrap();
        if i % 5_000 == 4_999 {
            store.flush().unwrap();
        }
    }
    store.flush().unwrap();

    // Move past the window end plus grace so everything seals, then roll up.
    let window_end = (T0 / WINDOW) * WINDOW + 2 * WINDOW;
    clock.set(window_end + 200);
    store.flush().unwrap();
    store.rollup_now().unwrap();
}

#[test]
fn hourly_rollup_of_one_hour_averages_to_49_5() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    fill_and_roll(&store, &clock, 3_600);

    let out = store
        .query_range(
            "cpu",
            &[Matcher::eq("host", "a")],
            T0,
            T0 + 3_600,
            3_600,
            Aggregate::Avg,
        )
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, T0);
    assert!((out[0].1 - 49.5).abs() < 1e-9, "avg was {}", out[0].1);

    // The same range summed and counted agrees with the raw data.
    let count = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Count)
        .unwrap();
    assert_eq!(count[0].1, 3_600.0);
    let sum = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Sum)
        .unwrap();
    assert_eq!(sum[0].1, 3_600.0 * 49.5);
}

#[test]
fn watermark_reaches_every_written_bucket_end() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    fill_and_roll(&store, &clock, 3_600);

    let info = store.info();
    let hourly_wm = info.tier_watermarks[0][0];
    let last_bucket_end = ((T0 + 3_599) / 3_600) * 3_600 + 3_600;
    assert!(
        hourly_wm >= last_bucket_end,
        "watermark {} below last bucket end {}",
        hourly_wm,
        last_bucket_end
    );
}

#[test]
fn late_point_updates_its_rolled_up_bucket_exactly_once() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    fill_and_roll(&store, &clock, 3_600);

    let before = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Count)
        .unwrap();
    assert_eq!(before[0].1, 3_600.0);

    // A duplicate-timestamp late write behind the watermark.
    store.write("cpu", &labels(&[("host", "a")]), 999.0, T0).unwrap();
    store.flush().unwrap();
    store.rollup_now().unwrap();

    let count = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Count)
        .unwrap();
    assert_eq!(count[0].1, 3_601.0, "late point counted exactly once");
    let max = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Max)
        .unwrap();
    assert_eq!(max[0].1, 999.0);
    let last = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Last)
        .unwrap();
    assert_eq!(last[0].1, 99.0, "last still belongs to the newest timestamp in range");

    // Rolling up again without new data must not double count.
    store.rollup_now().unwrap();
    let count = store
        .query_range("cpu", &[], T0, T0 + 3_600, 3_600, Aggregate::Count)
        .unwrap();
    assert_eq!(count[0].1, 3_601.0);
}

#[test]
fn daily_tier_builds_from_hourly_and_respects_source_watermark() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    // Two days of sparse data: one point per hour.
    let l = labels(&[]);
    let start_day = (T0 / 86_400) * 86_400;
    for h in 0..48 {
        let ts = start_day + h * 3_600 + 10;
        store.write("cpu", &l, h as f64, ts).unwrap();
    }
    store.flush().unwrap();
    clock.set(start_day + 3 * 86_400);
    store.flush().unwrap();
    store.rollup_now().unwrap();

    let info = store.info();
    let hourly_wm = info.tier_watermarks[0][0];
    let daily_wm = info.tier_watermarks[0][1];
    assert!(daily_wm <= hourly_wm, "daily watermark may not outrun hourly");
    assert!(daily_wm >= start_day + 2 * 86_400, "both full days rolled");

    // Day 0 at daily resolution: hours 0..24, avg 11.5, count 24.
    let avg = store
        .query_range("cpu", &[], start_day, start_day + 86_400, 86_400, Aggregate::Avg)
        .unwrap();
    assert_eq!(avg.len(), 1);
    assert_eq!(avg[0].1, 11.5);
    let count = store
        .query_range("cpu", &[], start_day, start_day + 86_400, 86_400, Aggregate::Count)
        .unwrap();
    assert_eq!(count[0].1, 24.0);
    let min = store
        .query_range("cpu", &[], start_day, start_day + 86_400, 86_400, Aggregate::Min)
        .unwrap();
    assert_eq!(min[0].1, 0.0);
    let max = store
        .query_range("cpu", &[], start_day, start_day + 86_400, 86_400, Aggregate::Max)
        .unwrap();
    assert_eq!(max[0].1, 23.0);
}

#[test]
fn rolled_aggregates_match_directly_computed_values_on_random_data() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xC0FFEE);

    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    let l = labels(&[]);
    let mut expected_sum = 0.0f64;
    let mut expected_min = f64::INFINITY;
    let mut expected_max = f64::NEG_INFINITY;
    let n = 600i64;
    for i in 0..n {
        let v: f64 = rng.gen_range(-1_000.0..1_000.0);
        expected_sum += v;
        expected_min = expected_min.min(v);
        expected_max = expected_max.max(v);
        store.write("cpu", &l, v, T0 + i * 3).unwrap();
    }
    store.flush().unwrap();
    clock.set((T0 / WINDOW) * WINDOW + 2 * WINDOW);
    store.flush().unwrap();
    store.rollup_now().unwrap();

    let q = |agg| {
        store
            .query_range("cpu", &[], T0, T0 + 3_600, 3_600, agg)
            .unwrap()[0]
            .1
    };
    assert!((q(Aggregate::Sum) - expected_sum).abs() < 1e-6);
    assert_eq!(q(Aggregate::Min), expected_min);
    assert_eq!(q(Aggregate::Max), expected_max);
    assert_eq!(q(Aggregate::Count), n as f64);
    assert!((q(Aggregate::Avg) - expected_sum / n as f64).abs() < 1e-9);
}

#[test]
fn rollup_never_advances_into_unsealed_pending_data() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock))).unwrap();

    // Sealed history plus an open window with pending points.
    let l = labels(&[]);
    store.write("cpu", &l, 1.0, T0).unwrap();
    store.flush().unwrap();
    let window_end = (T0 / WINDOW) * WINDOW + WINDOW;
    clock.set(window_end + 200);
    store.flush().unwrap();

    store.write("cpu", &l, 2.0, window_end + 100).unwrap();
    store.flush().unwrap();
    clock.set(window_end + 50_000);
    store.rollup_now().unwrap();

    let info = store.info();
    let hourly_wm = info.tier_watermarks[0][0];
    assert!(
        hourly_wm <= ((window_end + 100) / 3_600) * 3_600,
        "watermark {} crossed the pending point",
        hourly_wm
    );
}
