use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use strata::{
    Aggregate, Labels, ManualClock, Matcher, Sample, Schema, StoreConfig, StoreError, TierSpec,
    TsStore,
};

const T0: i64 = 1_700_000_000;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// A config with all background cadences effectively disabled so tests drive
/// flushing, rollup and retention explicitly.
fn manual_config(dir: &std::path::Path, clock: Arc<ManualClock>, shards: usize) -> StoreConfig {
    StoreConfig {
        data_dir: dir.to_path_buf(),
        shards,
        flush_interval: Duration::from_secs(3_600),
        pending_flush_interval: Duration::from_secs(3_600),
        rollup_interval: Duration::from_secs(3_600),
        retention_check_interval: Duration::from_secs(3_600),
        clock,
        ..StoreConfig::default()
    }
}

#[test]
fn basic_round_trip() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), clock, 2)).unwrap();

    store.write("cpu", &labels(&[("host", "a")]), 10.0, T0).unwrap();
    store.write("cpu", &labels(&[("host", "a")]), 20.0, T0 + 60).unwrap();
    store.flush().unwrap();

    let out = store
        .query_range("cpu", &[Matcher::eq("host", "a")], T0, T0 + 120, 60, Aggregate::Avg)
        .unwrap();
    assert_eq!(out, vec![(T0, 10.0), (T0 + 60, 20.0)]);
}

#[test]
fn query_against_unknown_metric_is_empty_not_an_error() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), clock, 1)).unwrap();

    let out = store
        .query_range("nope", &[], T0, T0 + 60, 60, Aggregate::Last)
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn invalid_inputs_are_rejected() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), clock, 1)).unwrap();

    let l = labels(&[("host", "a")]);
    assert!(matches!(
        store.write("", &l, 1.0, T0),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        store.write("cpu", &l, f64::NAN, T0),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        store.write("cpu", &l, 1.0, 0),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        store.query_range("cpu", &[], T0 + 10, T0, 60, Aggregate::Avg),
        Err(StoreError::InvalidTimeRange { .. })
    ));
}

#[test]
fn write_batch_counts_partial_failures() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), clock, 1)).unwrap();

    let samples = vec![
        Sample { metric: "cpu".into(), labels: labels(&[]), value: 1.0, timestamp: T0 },
        Sample { metric: "".into(), labels: labels(&[]), value: 1.0, timestamp: T0 },
        Sample { metric: "cpu".into(), labels: labels(&[]), value: f64::NAN, timestamp: T0 },
        Sample { metric: "cpu".into(), labels: labels(&[]), value: 2.0, timestamp: T0 + 1 },
    ];
    let result = store.write_batch(&samples);
    assert_eq!(result.accepted, 2);
    assert_eq!(result.rejected, 2);
}

#[test]
fn full_buffer_surfaces_backpressure() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = manual_config(dir.path(), clock, 1);
    config.buffer_capacity = 2;
    config.flush_threshold = 1_000_000;
    let store = TsStore::open(config).unwrap();

    let l = labels(&[]);
    store.write("cpu", &l, 1.0, T0).unwrap();
    store.write("cpu", &l, 2.0, T0 + 1).unwrap();
    assert!(matches!(
        store.write("cpu", &l, 3.0, T0 + 2),
        Err(StoreError::Backpressure { .. })
    ));

    // An explicit flush drains the buffer and the caller can retry.
    store.flush().unwrap();
    store.write("cpu", &l, 3.0, T0 + 2).unwrap();
}

#[test]
fn listings_reflect_registered_series() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), clock, 2)).unwrap();

    store.write("cpu", &labels(&[("host", "a")]), 1.0, T0).unwrap();
    store.write("cpu", &labels(&[("host", "b")]), 1.0, T0).unwrap();
    store.write("mem", &labels(&[("host", "a")]), 1.0, T0).unwrap();

    assert_eq!(store.list_metrics().unwrap(), vec!["cpu", "mem"]);
    assert_eq!(store.list_label_values("host").unwrap(), vec!["a", "b"]);
    assert_eq!(store.list_series("cpu").unwrap().len(), 2);
}

#[test]
fn instant_query_sees_pending_and_sealed_data() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = manual_config(dir.path(), Arc::clone(&clock), 1);
    config.seal_grace = 60;
    let store = TsStore::open(config).unwrap();

    let l = labels(&[("host", "a")]);
    store.write("cpu", &l, 1.0, T0).unwrap();
    store.write("cpu", &l, 2.0, T0 + 30).unwrap();
    store.flush().unwrap();

    // Still pending (window open).
    let out = store.query_instant("cpu", &[], None).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp, T0 + 30);
    assert_eq!(out[0].value, 2.0);
    assert_eq!(out[0].labels, l);

    // Seal the window, then add a newer pending point; instant picks the max.
    clock.set(T0 + 14_400 + 120);
    store.flush().unwrap();
    store.write("cpu", &l, 9.0, T0 + 14_400 + 60).unwrap();
    store.flush().unwrap();

    let out = store.query_instant("cpu", &[], None).unwrap();
    assert_eq!(out[0].timestamp, T0 + 14_400 + 60);
    assert_eq!(out[0].value, 9.0);

    // An `at` bound in the past resolves against sealed data.
    let out = store.query_instant("cpu", &[], Some(T0 + 40)).unwrap();
    assert_eq!(out[0].timestamp, T0 + 30);
    assert_eq!(out[0].value, 2.0);
}

#[test]
fn info_reports_series_points_and_per_shard_storage() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock), 2)).unwrap();

    for i in 0..10 {
        store
            .write("cpu", &labels(&[("host", &format!("h{}", i))]), i as f64, T0 + i)
            .unwrap();
    }
    clock.set(T0 + 14_400 + 14_400);
    store.flush().unwrap();

    let info = store.info();
    assert_eq!(info.series_count, 10);
    assert_eq!(info.points_estimate, 10);
    assert_eq!(info.storage_bytes_by_shard.len(), 2);
    assert!(info.storage_bytes_by_shard.iter().sum::<u64>() > 0);
    assert_eq!(info.tier_watermarks.len(), 2);
    assert_eq!(info.tier_watermarks[0].len(), Schema::default().tiers.len());
    assert!(info.paused_shards.is_empty());
    assert!(info.metadata_bytes > 0);
}

#[test]
fn shard_count_change_is_a_config_error() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    {
        let store = TsStore::open(manual_config(dir.path(), Arc::clone(&clock), 2)).unwrap();
        store.write("cpu", &labels(&[]), 1.0, T0).unwrap();
        store.flush().unwrap();
    }
    let err = TsStore::open(manual_config(dir.path(), clock, 3)).unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));
}

#[test]
fn schema_regression_is_a_config_error_but_appending_a_tier_is_not() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let base = vec![TierSpec::new("hourly", 3_600, 24, None)];
    {
        let mut config = manual_config(dir.path(), Arc::clone(&clock), 1);
        config.schema = Schema { tiers: base.clone() };
        TsStore::open(config).unwrap();
    }

    // Changing an existing tier's resolution fails.
    {
        let mut config = manual_config(dir.path(), Arc::clone(&clock), 1);
        config.schema = Schema { tiers: vec![TierSpec::new("hourly", 7_200, 24, None)] };
        assert!(matches!(TsStore::open(config), Err(StoreError::Config(_))));
    }

    // Appending a coarser tier is allowed.
    {
        let mut tiers = base;
        tiers.push(TierSpec::new("daily", 86_400, 30, None));
        let mut config = manual_config(dir.path(), clock, 1);
        config.schema = Schema { tiers };
        TsStore::open(config).unwrap();
    }
}

#[test]
fn query_deadline_of_zero_times_out() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = manual_config(dir.path(), clock, 1);
    config.query_deadline = Some(Duration::from_millis(0));
    let store = TsStore::open(config).unwrap();

    store.write("cpu", &labels(&[]), 1.0, T0).unwrap();
    store.flush().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert!(matches!(
        store.query_range("cpu", &[], T0, T0 + 60, 60, Aggregate::Avg),
        Err(StoreError::Timeout)
    ));
}
