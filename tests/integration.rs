//! End-to-end scenarios from the engine's operation surface: append/read,
//! rollover, cross-topic dedup, metadata type inference, corruption
//! detection, and portability across working directories.

use silobang::engine::Engine;
use silobang::verifier::Control;
use silobang::{EngineConfig, SiloError};
use tempfile::tempdir;

fn config_with_max_container_size(max: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.max_container_size = max;
    config
}

#[test]
fn s1_append_and_read() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();

    let result = engine.upload_to("t1", b"hello", None, None).unwrap();
    assert!(!result.skipped);
    assert_eq!(result.container, "000001.dat");

    let container_path = dir.path().join("t1").join("000001.dat");
    assert_eq!(container_path.metadata().unwrap().len(), 110 + 5);

    let bytes = engine.read_asset(&result.digest).unwrap();
    assert_eq!(bytes, b"hello");
}

#[test]
fn s2_rollover_places_entries_at_exact_boundaries() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), config_with_max_container_size(1024)).unwrap();
    engine.create_topic("t1").unwrap();

    let p1 = vec![1u8; 400];
    let p2 = vec![2u8; 400];
    let p3 = vec![3u8; 400];
    let r1 = engine.upload_to("t1", &p1, None, None).unwrap();
    let r2 = engine.upload_to("t1", &p2, None, None).unwrap();
    let r3 = engine.upload_to("t1", &p3, None, None).unwrap();

    assert_eq!(r1.container, "000001.dat");
    assert_eq!(r2.container, "000001.dat");
    assert_eq!(r3.container, "000002.dat");

    let containers = silobang::datset::list(&dir.path().join("t1")).unwrap();
    assert_eq!(containers, vec!["000001.dat".to_string(), "000002.dat".to_string()]);
}

#[test]
fn s3_dedup_across_topics_keeps_first_owner() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();
    engine.create_topic("t2").unwrap();

    let r1 = engine.upload_to("t1", b"hello", None, None).unwrap();
    assert!(!r1.skipped);

    let r2 = engine.upload_to("t2", b"hello", None, None).unwrap();
    assert!(r2.skipped);
    assert_eq!(r2.digest, r1.digest);
    assert_eq!(r2.existing_topic.as_deref(), Some("t1"));

    assert!(silobang::datset::list(&dir.path().join("t2")).unwrap().is_empty());
}

#[test]
fn s4_metadata_type_inference_matrix() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();
    let asset = engine.upload_to("t1", b"hello", None, None).unwrap();

    engine.set_metadata(&asset.digest, "count", "42", "tester", "1").unwrap();
    engine.set_metadata(&asset.digest, "code", "00123", "tester", "1").unwrap();
    engine.set_metadata(&asset.digest, "ratio", "1.0", "tester", "1").unwrap();
    engine.set_metadata(&asset.digest, "flag", "true", "tester", "1").unwrap();

    let computed = engine.get_metadata(&asset.digest).unwrap().unwrap();
    assert_eq!(computed.get("count").unwrap(), &serde_json::json!(42));
    assert_eq!(computed.get("code").unwrap(), &serde_json::json!("00123"));
    assert_eq!(computed.get("ratio").unwrap(), &serde_json::json!("1.0"));
    assert_eq!(computed.get("flag").unwrap(), &serde_json::json!("true"));

    engine.delete_metadata(&asset.digest, "count", "tester", "1").unwrap();
    let computed = engine.get_metadata(&asset.digest).unwrap().unwrap();
    assert!(computed.get("count").is_none());
}

#[test]
fn s5_full_verify_detects_payload_corruption_and_quarantines_topic() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();
    engine.upload_to("t1", b"first-entry", None, None).unwrap();
    let second = engine.upload_to("t1", b"second-entry", None, None).unwrap();

    // Flip a byte inside the second entry's payload only.
    let container_path = dir.path().join("t1").join(&second.container);
    let mut bytes = std::fs::read(&container_path).unwrap();
    let payload_start = bytes.len() - "second-entry".len();
    bytes[payload_start] ^= 0xFF;
    std::fs::write(&container_path, bytes).unwrap();

    let results = engine.verify(None, true, |_, _| Control::Continue).unwrap();
    assert_eq!(results.len(), 1);
    let (topic_name, result) = &results[0];
    assert_eq!(topic_name, "t1");
    assert!(matches!(result, Err(SiloError::PayloadCorrupt { .. })));

    // A full verify that finds corruption marks the topic unhealthy
    // immediately; no restart required.
    let err = engine.upload_to("t1", b"more", None, None).unwrap_err();
    assert!(matches!(err, SiloError::TopicUnhealthy(_)));
}

#[test]
fn s6_portability_after_moving_topic_directory() {
    let origin = tempdir().unwrap();
    {
        let engine = Engine::open(origin.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        engine.upload_to("t1", b"one", None, None).unwrap();
        engine.upload_to("t1", b"two", None, None).unwrap();
        engine.upload_to("t1", b"three", None, None).unwrap();
    }

    let moved = tempdir().unwrap();
    std::fs::create_dir_all(moved.path().join("t1")).unwrap();
    for entry in std::fs::read_dir(origin.path().join("t1")).unwrap() {
        let entry = entry.unwrap();
        let dest = moved.path().join("t1").join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            std::fs::create_dir_all(&dest).unwrap();
            for inner in std::fs::read_dir(entry.path()).unwrap() {
                let inner = inner.unwrap();
                std::fs::copy(inner.path(), dest.join(inner.file_name())).unwrap();
            }
        } else {
            std::fs::copy(entry.path(), &dest).unwrap();
        }
    }

    let engine = Engine::open(moved.path(), EngineConfig::default()).unwrap();
    let statuses = engine.list_topics().unwrap();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].healthy);

    let digest_of_one = silobang::hasher::hex(&silobang::hasher::digest(b"one"));
    let bytes = engine.read_asset(&digest_of_one).unwrap();
    assert_eq!(bytes, b"one");
}

#[test]
fn parent_lineage_must_already_be_indexed() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();

    let missing_parent = "a".repeat(64);
    let err = engine.upload_to("t1", b"child", Some(&missing_parent), None).unwrap_err();
    assert!(matches!(err, SiloError::ParentNotFound(_)));

    let parent = engine.upload_to("t1", b"parent-bytes", None, None).unwrap();
    let child = engine.upload_to("t1", b"child", Some(&parent.digest), None).unwrap();
    assert!(!child.skipped);
}

#[test]
fn query_executor_tags_rows_with_origin_topic() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.create_topic("t1").unwrap();
    engine.create_topic("t2").unwrap();
    engine.upload_to("t1", b"alpha", None, Some("a.txt")).unwrap();
    engine.upload_to("t2", b"beta", None, Some("b.txt")).unwrap();

    let mut params = std::collections::HashMap::new();
    params.insert(
        "ext".to_string(),
        rusqlite::types::Value::Text("txt".to_string()),
    );
    let rows = engine
        .run_query("SELECT asset_id, extension FROM assets WHERE extension = :ext", &params, None)
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(row.contains_key("_topic"));
    }
}
