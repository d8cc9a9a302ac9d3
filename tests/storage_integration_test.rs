//! Region store and series reconciliation sharing one database file.

use rust_fec::config::FecConfig;
use rust_fec::data::{
    new_cursor, Database, RegionKey, RegionStore, SeriesReconciler, Signal, UpsertStrategy, Whence,
};

#[test]
fn test_region_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("buffer.sqlite3")).unwrap();
    let store = RegionStore::new(db);
    let key = RegionKey::new(0, 0, 1, 2);

    store.store_data_in_region_buffer(key, b"abc").unwrap();
    store.store_data_in_region_buffer(key, b"def").unwrap();
    assert_eq!(store.get_region_data(key).unwrap(), (b"abcdef".to_vec(), false));

    store.clear().unwrap();
    assert_eq!(store.get_region_data(key).unwrap(), (Vec::new(), true));

    let info = store.region_info(key).unwrap().unwrap();
    assert_eq!(info.fetches, 0);
    assert!(info.append_time.is_none());
}

#[test]
fn test_content_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports/run_1/buffer.sqlite3");
    let key = RegionKey::new(3, 4, 5, 0);
    {
        let store = RegionStore::with_strategy(Database::open(&path).unwrap(), UpsertStrategy::TwoStep);
        store.store_data_in_region_buffer(key, &[1, 2, 3]).unwrap();
    }
    let store = RegionStore::new(Database::open(&path).unwrap());
    store.store_data_in_region_buffer(key, &[4]).unwrap();
    assert_eq!(store.get_region_data(key).unwrap().0, vec![1, 2, 3, 4]);
}

#[test]
fn test_clear_drops_series_but_keeps_catalog() {
    let db = Database::open_in_memory().unwrap();
    let store = RegionStore::new(db.clone());
    let series = SeriesReconciler::new(db);
    let signal = Signal::new("pop", "v");

    series.register_source("pop", Some("population")).unwrap();
    series.insert_matrix(&signal, &[0], &[vec![0, 1], vec![1, 2]]).unwrap();
    series.insert_matrix(&signal, &[1], &[vec![0, 3]]).unwrap();
    series.reconcile(&signal).unwrap();
    assert!(!series.views().unwrap().is_empty());
    store.store_data_in_region_buffer(RegionKey::new(0, 0, 1, 0), b"x").unwrap();

    store.clear().unwrap();

    assert!(series.views().unwrap().is_empty());
    assert!(series.variable_map().unwrap().is_empty());
    assert!(series.get_data(&signal).unwrap().missing);
    assert_eq!(series.source_description("pop").unwrap().as_deref(), Some("population"));

    // the signal can be recorded again from scratch
    series.insert_matrix(&signal, &[0], &[vec![5, 6]]).unwrap();
    assert_eq!(series.get_data(&signal).unwrap().rows, vec![vec![Some(5), Some(6)]]);
}

#[test]
fn test_three_cores_with_identical_timestamps() {
    let db = Database::open_in_memory().unwrap();
    let series = SeriesReconciler::new(db);
    let signal = Signal::new("excitatory", "gsyn");

    for (core, ids) in [[0u32, 1], [2, 3], [4, 5]].iter().enumerate() {
        let rows: Vec<Vec<i64>> = (0..10).map(|t| vec![t, core as i64, t * 10]).collect();
        series.insert_matrix(&signal, ids, &rows).unwrap();
    }

    let data = series.get_data(&signal).unwrap();
    assert_eq!(data.rows.len(), 10);
    assert_eq!(data.columns, vec!["timestamp", "0", "1", "2", "3", "4", "5"]);
    assert!(data.rows.iter().flatten().all(Option::is_some));
    assert!(series.views().unwrap().iter().all(|v| !v.contains("_full")));
}

#[test]
fn test_core_missing_one_timestamp_yields_nulls() {
    let db = Database::open_in_memory().unwrap();
    let series = SeriesReconciler::new(db);
    let signal = Signal::new("excitatory", "v");

    series
        .insert_matrix(&signal, &[0], &[vec![0, 1], vec![1, 2], vec![2, 3]])
        .unwrap();
    series.insert_matrix(&signal, &[1], &[vec![0, 4], vec![2, 6]]).unwrap();
    series
        .insert_matrix(&signal, &[2], &[vec![0, 7], vec![1, 8], vec![2, 9]])
        .unwrap();

    let data = series.get_data(&signal).unwrap();
    assert_eq!(
        data.rows,
        vec![
            vec![Some(0), Some(1), Some(4), Some(7)],
            vec![Some(1), Some(2), None, Some(8)],
            vec![Some(2), Some(3), Some(6), Some(9)],
        ]
    );
}

#[test]
fn test_cursor_concatenates_for_any_backing() {
    let inputs: [(&[u8], &[u8]); 3] = [(b"", b""), (b"abc", b""), (b"\x00\x01", b"\xFF\x00\x7F")];
    for threshold in [0, usize::MAX] {
        for (a, b) in inputs {
            let mut cursor = new_cursor(a.len() + b.len(), threshold).unwrap();
            cursor.write(a).unwrap();
            cursor.write(b).unwrap();
            assert_eq!(cursor.read_all().unwrap(), [a, b].concat());

            cursor.seek_read(i64::MAX, Whence::Start);
            assert_eq!(cursor.tell_read(), cursor.len());
            cursor.seek_write(i64::MIN + 1, Whence::Current);
            assert_eq!(cursor.tell_write(), 0);
        }
    }
}

#[test]
fn test_config_storage_path_opens() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FecConfig::default();
    config.storage.database_path = dir.path().join("nested/buffer.sqlite3");
    config.validate().unwrap();

    let db = Database::open(&config.storage.database_path).unwrap();
    assert_eq!(db.path(), Some(config.storage.database_path.as_path()));
}

#[test]
fn test_signals_with_colliding_names_keep_their_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.sqlite3");
    let a = Signal::new("a_b", "c");
    let b = Signal::new("a", "b_c");
    {
        let series = SeriesReconciler::new(Database::open(&path).unwrap());
        series.insert_matrix(&a, &[0], &[vec![0, 11]]).unwrap();
        series.insert_matrix(&b, &[0], &[vec![0, 99]]).unwrap();
    }

    let series = SeriesReconciler::new(Database::open(&path).unwrap());
    let a_data = series.get_data(&a).unwrap();
    let b_data = series.get_data(&b).unwrap();
    assert!(!a_data.missing && !b_data.missing);
    assert_eq!(a_data.rows, vec![vec![Some(0), Some(11)]]);
    assert_eq!(b_data.rows, vec![vec![Some(0), Some(99)]]);
    assert_eq!(series.variable_map().unwrap().len(), 2);
}

#[test]
fn test_unrecorded_signal_reads_as_missing() {
    let series = SeriesReconciler::new(Database::open_in_memory().unwrap());
    let data = series.get_data(&Signal::new("pop", "v")).unwrap();
    assert!(data.missing);
    assert!(data.columns.is_empty());
    series.create_all_views().unwrap();
}
