//! Integration tests for checkpoint-store
//!
//! These tests drive the public store API against temp directories:
//! - Save/load round trips and chain continuity
//! - Tamper detection and backup recovery
//! - Rollback and pruning, including the skip rules
//! - Registry degradation and orphan handling

use checkpoint_store::{CheckpointError, CheckpointStore, StageState, StoreConfig};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn open(dir: &TempDir) -> CheckpointStore {
    CheckpointStore::open(StoreConfig::new(dir.path()).with_sync_writes(false))
        .expect("Failed to open store")
}

fn file_of(store: &CheckpointStore, id: &str) -> PathBuf {
    let entry = store.registry().get(id).expect("registered");
    store.layout().live_path(&entry.file)
}

fn tamper(path: &Path, from: &str, to: &str) {
    let text = fs::read_to_string(path).unwrap();
    assert!(text.contains(from), "{from} not in {}", path.display());
    fs::write(path, text.replacen(from, to, 1)).unwrap();
}

#[test]
fn test_parse_stage_scenario() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let a = store.save("parse", json!({"n": 1}), None).unwrap();
    let b = store.save("parse", json!({"n": 2}), None).unwrap();
    assert_eq!(b.previous_checkpoint.as_deref(), Some(a.id.as_str()));

    // File on disk carries B's checksum
    let b_path = file_of(&store, &b.id);
    let on_disk: serde_json::Value = serde_json::from_slice(&fs::read(&b_path).unwrap()).unwrap();
    assert_eq!(on_disk["checksum"], json!(b.checksum));
    assert_eq!(checkpoint_store::checksum(&b).unwrap(), b.checksum);

    // Corrupt B: the load restores a backup once, then refuses B's bytes
    tamper(&b_path, "\"n\": 2", "\"n\": 3");
    let err = store.load_latest("parse").unwrap_err();
    match err {
        CheckpointError::CorruptCheckpoint {
            stage,
            checkpoint_id,
            path,
            ..
        } => {
            assert_eq!(stage, "parse");
            assert_eq!(checkpoint_id, b.id);
            assert_eq!(path, b_path);
        }
        other => panic!("expected CorruptCheckpoint, got {other:?}"),
    }

    // A is untouched and still loadable
    assert_eq!(store.load_by_id(&a.id).unwrap().data, json!({"n": 1}));
}

#[test]
fn test_load_restores_own_backup() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    store.save("thread", json!({"v": 1}), None).unwrap();
    let b = store.save("thread", json!({"v": 2}), None).unwrap();
    store.save("thread", json!({"v": 3}), None).unwrap();

    // B was backed up when the third checkpoint was written
    let b_path = file_of(&store, &b.id);
    tamper(&b_path, "\"v\": 2", "\"v\": 9");

    let loaded = store.load_by_id(&b.id).unwrap();
    assert_eq!(loaded.data, json!({"v": 2}));
    assert_eq!(loaded, b);

    fs::remove_file(&b_path).unwrap();
    assert_eq!(store.load_by_id(&b.id).unwrap(), b);
}

#[test]
fn test_corrupt_without_backup_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let only = store.save("setup", json!({"ok": true}), None).unwrap();
    fs::write(file_of(&store, &only.id), b"{ truncated").unwrap();

    let err = store.load_latest("setup").unwrap_err();
    assert!(err.is_corrupt());
    assert!(err.to_string().contains("no backup available"));
}

#[test]
fn test_chain_continuity() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let saved: Vec<_> = (0..6)
        .map(|i| store.save("analyze", json!({"step": i}), None).unwrap())
        .collect();

    let chain = store.build_chain("analyze").unwrap();
    assert_eq!(chain.len(), 6);
    assert!(chain.is_complete());
    let ids: Vec<&str> = saved.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(chain.ids(), ids);

    let status = store.stage_status("analyze").unwrap();
    assert_eq!(status.status, StageState::InProgress);
    assert_eq!(status.checkpoint_count, 6);
    assert_eq!(status.latest_id.as_deref(), Some(saved[5].id.as_str()));
    assert_eq!(status.last_updated, Some(saved[5].timestamp));
    assert!(status.chain_complete);
}

#[test]
fn test_stages_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let p = store.save("pdf_parsing", json!({"pages": 3}), None).unwrap();
    let t = store.save("threading", json!({"threads": 1}), None).unwrap();
    assert!(p.is_root());
    assert!(t.is_root());

    assert_eq!(store.build_chain("pdf_parsing").unwrap().len(), 1);
    assert_eq!(store.stages().len(), 2);
}

#[test]
fn test_corrupt_link_marks_chain_incomplete() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    store.save("parse", json!({"n": 1}), None).unwrap();
    let b = store.save("parse", json!({"n": 2}), None).unwrap();
    store.save("parse", json!({"n": 3}), None).unwrap();

    tamper(&file_of(&store, &b.id), "\"n\": 2", "\"n\": 4");

    let chain = store.build_chain("parse").unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain.unresolved.as_deref(), Some(b.id.as_str()));
    assert!(!chain.is_complete());

    let status = store.stage_status("parse").unwrap();
    assert_eq!(status.status, StageState::InProgress);
    assert!(!status.chain_complete);
}

#[test]
fn test_rollback_exactness() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    store.save("parse", json!({"n": 1}), None).unwrap();
    let second = store.save("parse", json!({"n": 2}), None).unwrap();
    let third = store.save("parse", json!({"n": 3}), None).unwrap();
    let third_path = file_of(&store, &third.id);
    let third_file = store.registry().get(&third.id).unwrap().file.clone();
    let third_bytes = fs::read(&third_path).unwrap();
    assert!(!store.layout().backup_path(&third_file).exists());

    assert!(store.rollback_to(&second.id).unwrap());

    // The superseded latest is backed up verbatim before it is detached
    let backup = store.layout().backup_path(&third_file);
    assert_eq!(fs::read(&backup).unwrap(), third_bytes);
    assert_eq!(store.load_latest("parse").unwrap().data, json!({"n": 2}));

    // Detached checkpoint stays on disk but leaves the registry
    assert!(third_path.exists());
    assert!(store.registry().get(&third.id).is_none());
    assert!(store.load_by_id(&third.id).unwrap_err().is_not_found());

    let fourth = store.save("parse", json!({"n": 4}), None).unwrap();
    assert_eq!(fourth.previous_checkpoint.as_deref(), Some(second.id.as_str()));
    assert!(store.build_chain("parse").unwrap().is_complete());
}

#[test]
fn test_rollback_refuses_unverifiable_target() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let first = store.save("parse", json!({"n": 1}), None).unwrap();
    let second = store.save("parse", json!({"n": 2}), None).unwrap();
    let registry_before = fs::read(store.layout().registry_path()).unwrap();

    assert!(!store.rollback_to("does-not-exist").unwrap());

    tamper(&file_of(&store, &first.id), "\"n\": 1", "\"n\": 5");
    assert!(!store.rollback_to(&first.id).unwrap());

    assert_eq!(fs::read(store.layout().registry_path()).unwrap(), registry_before);
    assert_eq!(store.registry().latest("parse").unwrap().0, &second.id);
}

#[test]
fn test_pruning_retention() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let saved: Vec<_> = (0..5)
        .map(|i| store.save("thread", json!({"i": i}), None).unwrap())
        .collect();
    let originals: Vec<(String, Vec<u8>)> = saved[..3]
        .iter()
        .map(|c| {
            let file = store.registry().get(&c.id).unwrap().file.clone();
            let bytes = fs::read(store.layout().live_path(&file)).unwrap();
            (file, bytes)
        })
        .collect();

    let report = store.prune(2).unwrap();
    assert_eq!(report.archived.len(), 3);
    assert!(report.skipped.is_empty());
    assert_eq!(report.kept.get("thread"), Some(&2));
    assert_eq!(store.registry().entries_for_stage("thread").len(), 2);

    for (file, bytes) in &originals {
        assert!(!store.layout().live_path(file).exists());
        assert_eq!(&fs::read(store.layout().pruned_path(file)).unwrap(), bytes);
    }

    // History stays reachable through the archive
    let chain = store.build_chain("thread").unwrap();
    assert_eq!(chain.len(), 5);
    assert_eq!(chain.archived_links, 3);
    assert!(chain.is_complete());
    assert_eq!(store.load_latest("thread").unwrap(), saved[4]);
}

#[test]
fn test_prune_orders_by_modification_time() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let saved: Vec<_> = (0..5)
        .map(|i| store.save("analyze", json!({"i": i}), None).unwrap())
        .collect();

    // The oldest checkpoint becomes the most recently modified file
    let touched = fs::File::options()
        .write(true)
        .open(file_of(&store, &saved[0].id))
        .unwrap();
    touched
        .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(3600))
        .unwrap();
    drop(touched);

    let report = store.prune(2).unwrap();
    let mut archived: Vec<&str> = report
        .archived
        .iter()
        .map(|a| a.checkpoint_id.as_str())
        .collect();
    archived.sort_unstable();
    let mut expected: Vec<&str> = saved[1..4].iter().map(|c| c.id.as_str()).collect();
    expected.sort_unstable();
    assert_eq!(archived, expected);

    // Registry-latest survives even though another file is newer on disk
    assert!(store.registry().contains(&saved[4].id));
    assert!(store.registry().contains(&saved[0].id));
    assert_eq!(store.load_latest("analyze").unwrap(), saved[4]);

    let chain = store.build_chain("analyze").unwrap();
    assert_eq!(chain.len(), 5);
    assert!(chain.is_complete());
}

#[test]
fn test_float_payload_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let data = json!({"score": 1.0715660391465826e-75, "ratio": 0.1, "big": 1.7976931348623157e308});
    let saved = store.save("analyze", data.clone(), None).unwrap();

    let loaded = store.load_by_id(&saved.id).unwrap();
    assert_eq!(loaded.data, data);
    assert_eq!(loaded, saved);
    assert!(store.verify_all().unwrap().is_clean());
}

#[test]
fn test_prune_with_policy_and_small_stages() {
    let dir = TempDir::new().unwrap();
    let mut store = CheckpointStore::open(
        StoreConfig::new(dir.path())
            .with_sync_writes(false)
            .with_max_per_stage(1),
    )
    .unwrap();

    store.save("setup", json!({}), None).unwrap();
    let older = store.save("parse", json!({"n": 1}), None).unwrap();
    store.save("parse", json!({"n": 2}), None).unwrap();

    let report = store.prune_with_policy().unwrap();
    assert_eq!(report.archived.len(), 1);
    assert_eq!(report.archived[0].checkpoint_id, older.id);
    assert_eq!(report.kept.get("setup"), Some(&1));
    assert_eq!(report.kept.get("parse"), Some(&1));

    // Nothing left to prune
    assert!(store.prune(1).unwrap().archived.is_empty());
}

#[test]
fn test_prune_skips_ambiguous_candidates() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let a = store.save("parse", json!({"n": 1}), None).unwrap();
    let b = store.save("parse", json!({"n": 2}), None).unwrap();
    let c = store.save("parse", json!({"n": 3}), None).unwrap();
    store.save("parse", json!({"n": 4}), None).unwrap();

    // A's file is gone, B is corrupt while C still links to it
    fs::remove_file(file_of(&store, &a.id)).unwrap();
    tamper(&file_of(&store, &b.id), "\"n\": 2", "\"n\": 7");

    let report = store.prune(1).unwrap();
    let skipped: Vec<&str> = report.skipped.iter().map(|s| s.checkpoint_id.as_str()).collect();
    assert!(skipped.contains(&a.id.as_str()));
    assert!(skipped.contains(&b.id.as_str()));
    assert_eq!(report.archived.len(), 1);
    assert_eq!(report.archived[0].checkpoint_id, c.id);

    assert!(store.registry().contains(&a.id));
    assert!(store.registry().contains(&b.id));
    assert!(!store.registry().contains(&c.id));
}

#[test]
fn test_prune_skips_archive_conflict() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let a = store.save("final", json!({"n": 1}), None).unwrap();
    store.save("final", json!({"n": 2}), None).unwrap();

    let file = store.registry().get(&a.id).unwrap().file.clone();
    fs::write(store.layout().pruned_path(&file), b"someone else").unwrap();

    let report = store.prune(1).unwrap();
    assert!(report.archived.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert!(store.layout().live_path(&file).exists());
}

#[test]
fn test_verify_all_audits_files() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let a = store.save("parse", json!({"n": 1}), None).unwrap();
    store.save("parse", json!({"n": 2}), None).unwrap();
    tamper(&file_of(&store, &a.id), "\"n\": 1", "\"n\": 0");

    let checkpoint_dir = store.layout().checkpoint_dir().to_path_buf();
    fs::write(checkpoint_dir.join("notes.txt"), b"not a checkpoint").unwrap();
    fs::write(checkpoint_dir.join(".parse_x.json.1234.tmp"), b"partial").unwrap();
    fs::write(checkpoint_dir.join("stray_20200101_000000.json"), b"[]").unwrap();

    let report = store.verify_all().unwrap();
    assert_eq!(report.valid.len(), 1);
    assert_eq!(report.invalid.len(), 2);
    assert_eq!(report.total(), 3);
    assert!(report
        .invalid
        .iter()
        .any(|f| f.reason == "checksum mismatch" && f.stage.as_deref() == Some("parse")));

    // Audit only; the registry is unchanged
    assert_eq!(store.registry().len(), 2);
}

#[test]
fn test_orphans_are_not_adopted() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    let saved = store.save("parse", json!({"n": 1}), None).unwrap();

    // Copy a valid checkpoint under an unregistered name
    let orphan = store.layout().live_path("thread_20200101_000000.json");
    fs::copy(file_of(&store, &saved.id), &orphan).unwrap();

    let reopened = open(&dir);
    assert!(reopened.load_latest("thread").unwrap_err().is_not_found());
    assert_eq!(reopened.verify_all().unwrap().valid.len(), 2);
    assert_eq!(reopened.registry().len(), 1);
}

#[test]
fn test_unreadable_registry_starts_empty() {
    let dir = TempDir::new().unwrap();
    let registry_path = {
        let mut store = open(&dir);
        store.save("parse", json!({"n": 1}), None).unwrap();
        store.layout().registry_path().to_path_buf()
    };
    fs::write(&registry_path, b"{\"half\": ").unwrap();

    let store = open(&dir);
    assert!(store.registry().is_empty());
    let diagnostic = store.registry_diagnostic().unwrap();
    assert_eq!(diagnostic.path, registry_path);
    assert!(store.load_latest("parse").unwrap_err().is_not_found());
    assert_eq!(
        store.stage_status("parse").unwrap().status,
        StageState::NotStarted
    );
}

#[test]
fn test_reopen_continues_chain() {
    let dir = TempDir::new().unwrap();
    let first = {
        let mut store = open(&dir);
        store.save("analyze", json!({"n": 1}), None).unwrap()
    };

    let mut store = open(&dir);
    let second = store.save("analyze", json!({"n": 2}), None).unwrap();
    assert_eq!(second.previous_checkpoint.as_deref(), Some(first.id.as_str()));
    assert!(store.build_chain("analyze").unwrap().is_complete());
}

#[test]
fn test_restore_latest_backup_and_listing() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let a = store.save("parse", json!({"n": 1}), None).unwrap();
    store.save("parse", json!({"n": 2}), None).unwrap();

    let backups = store.list_backups(Some("parse")).unwrap();
    assert_eq!(backups.len(), 1);
    let a_path = file_of(&store, &a.id);
    assert_eq!(backups[0].original_name, a_path.file_name().unwrap().to_string_lossy());

    fs::remove_file(&a_path).unwrap();
    let restored = store.restore_latest_backup("parse").unwrap().unwrap();
    assert_eq!(restored, a_path);
    assert_eq!(store.load_by_id(&a.id).unwrap(), a);

    assert!(store.restore_latest_backup("final").unwrap().is_none());
}
