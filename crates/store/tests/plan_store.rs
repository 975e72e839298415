use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use serde_json::{json, Value};
use storyloom_core::error::CoreError;
use storyloom_core::plan::{EntityKey, PlanVersion};
use storyloom_core::status::Status;
use storyloom_store::{PlanStore, StoreError};

fn write_plan(dir: &Path, value: &Value) -> PathBuf {
    let path = dir.join("plan.json");
    std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

fn read_plan(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn v3_plan() -> Value {
    json!({
        "project_name": "demo",
        "assets": {"characters": {"alice": {"prompt": "a", "output": "alice.png"}}},
        "scenes": [{
            "id": "A",
            "output_video": "A.mp4",
            "first_keyframe": {"id": "A-start", "prompt": "p", "output": "A.png"},
            "segments": [
                {"id": "A1", "prompt": "walk", "output_video": "A1.mp4", "output_keyframe": "A1.png"},
                {"id": "A2", "prompt": "run", "output_video": "A2.mp4"}
            ]
        }],
        "final_video": {"output": "final.mp4"},
        "reviewer": "kim"
    })
}

#[test]
fn open_classifies_and_resolves_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());

    let store = PlanStore::open(&path).unwrap();
    assert_eq!(store.version(), PlanVersion::V3);
    assert_eq!(store.base_dir(), dir.path());
    assert_eq!(store.resolve("A.mp4"), dir.path().join("A.mp4"));
    assert!(store.validate().passed);
}

#[test]
fn every_setter_writes_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());
    let mut store = PlanStore::open(&path).unwrap();

    store.set_segment_status("A1", Status::InProgress).unwrap();
    assert_eq!(read_plan(&path)["scenes"][0]["segments"][0]["status"], "in_progress");

    store.set_asset_status("alice", Status::InProgress).unwrap();
    assert_eq!(read_plan(&path)["assets"]["characters"]["alice"]["status"], "in_progress");

    store.set_keyframe_status("A-start", Status::InProgress).unwrap();
    assert_eq!(read_plan(&path)["scenes"][0]["first_keyframe"]["status"], "in_progress");

    store.set_final_video_status(Status::Failed).unwrap();
    assert_eq!(read_plan(&path)["final_video"]["status"], "failed");

    // Unknown keys and the version field survive the rewrite.
    let on_disk = read_plan(&path);
    assert_eq!(on_disk["reviewer"], "kim");
    assert_eq!(on_disk["version"], 3);
    assert!(on_disk["scenes"][0].get("status").is_none());
}

#[test]
fn reload_sees_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());
    {
        let mut store = PlanStore::open(&path).unwrap();
        store.set_segment_status("A2", Status::InProgress).unwrap();
        store.set_segment_status("A2", Status::Generated).unwrap();
    }
    let store = PlanStore::open(&path).unwrap();
    let key = EntityKey::Segment {
        scene: "A".into(),
        segment: "A2".into(),
    };
    assert_eq!(store.document().status_of(&key), Some(Status::Generated));
}

#[test]
fn invalid_transition_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());
    let before = std::fs::read_to_string(&path).unwrap();
    let mut store = PlanStore::open(&path).unwrap();

    assert_matches!(
        store.set_segment_status("A1", Status::Approved),
        Err(StoreError::Core(CoreError::InvalidTransition { .. }))
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn reset_forces_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = v3_plan();
    plan["scenes"][0]["segments"][1]["status"] = json!("approved");
    let path = write_plan(dir.path(), &plan);
    let mut store = PlanStore::open(&path).unwrap();

    store
        .reset(&EntityKey::Segment {
            scene: "A".into(),
            segment: "A2".into(),
        })
        .unwrap();
    assert_eq!(read_plan(&path)["scenes"][0]["segments"][1]["status"], "pending");
}

#[test]
fn unknown_ids_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());
    let mut store = PlanStore::open(&path).unwrap();

    assert_matches!(
        store.set_segment_status("A", Status::InProgress),
        Err(StoreError::Core(CoreError::NotFound { entity: "segment", .. }))
    );
    assert_matches!(
        store.set_asset_status("bob", Status::InProgress),
        Err(StoreError::Core(CoreError::NotFound { entity: "asset", .. }))
    );
}

#[test]
fn v3_scene_status_is_not_settable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(dir.path(), &v3_plan());
    let mut store = PlanStore::open(&path).unwrap();
    assert_matches!(
        store.set_scene_status("A", Status::Generated),
        Err(StoreError::Core(CoreError::Unsupported { .. }))
    );
}

#[test]
fn v2_scene_status_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plan(
        dir.path(),
        &json!({
            "project_name": "v2",
            "first_keyframe": {"prompt": "p", "output": "k.png"},
            "scenes": [{"id": "S1", "prompt": "p", "output_video": "s1.mp4"}]
        }),
    );
    let mut store = PlanStore::open(&path).unwrap();
    assert_eq!(store.version(), PlanVersion::V2);

    store.set_keyframe_status("first_keyframe", Status::InProgress).unwrap();
    store.set_scene_status("S1", Status::InProgress).unwrap();
    let on_disk = read_plan(&path);
    assert_eq!(on_disk["first_keyframe"]["status"], "in_progress");
    assert_eq!(on_disk["scenes"][0]["status"], "in_progress");
}

#[test]
fn malformed_plan_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(PlanStore::open(&path), Err(StoreError::Parse { .. }));
    assert_matches!(
        PlanStore::open(dir.path().join("missing.json")),
        Err(StoreError::Read { .. })
    );
}
