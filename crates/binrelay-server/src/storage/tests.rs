//! Storage layer tests for judgments.

use super::*;
use binrelay_core::db::unix_timestamp_millis;

async fn test_db() -> JudgmentDatabase {
    JudgmentDatabase::open_in_memory().await.unwrap()
}

fn judgment(recorded_at: i64, message: Option<&str>) -> NewJudgment {
    NewJudgment {
        user_id: DEFAULT_USER_ID.into(),
        recorded_at,
        image_path: IMAGE_SESSION_PATH.into(),
        detected_items: vec!["PET bottle".into()],
        is_valid: true,
        rejection_reason: None,
        has_change: true,
        message: message.map(str::to_owned),
    }
}

#[tokio::test]
async fn insert_and_read_back() {
    let db = test_db().await;
    let now = unix_timestamp_millis();
    let id = db.insert_judgment(&judgment(now, Some("Nice!"))).await.unwrap();

    let row = db.get_judgment(id).await.unwrap();
    assert_eq!(row.recorded_at, now);
    assert_eq!(row.image_path, IMAGE_SESSION_PATH);
    assert_eq!(row.detected_items, r#"["PET bottle"]"#);
    assert!(row.is_valid);
    assert!(row.has_change);
    assert_eq!(row.message.as_deref(), Some("Nice!"));

    let raw: serde_json::Value = serde_json::from_str(&row.raw_json).unwrap();
    assert_eq!(raw["is_valid"], true);
    assert_eq!(raw["message"], "Nice!");
}

#[tokio::test]
async fn patch_only_touches_message() {
    let db = test_db().await;
    let id = db.insert_judgment(&judgment(1_000, Some("draft"))).await.unwrap();
    let other = db.insert_judgment(&judgment(2_000, Some("keep"))).await.unwrap();

    let store: &dyn JudgmentStore = &db;
    assert!(store
        .patch_message(DEFAULT_USER_ID, 1_000, "spoken words")
        .await
        .unwrap());

    let row = db.get_judgment(id).await.unwrap();
    assert_eq!(row.message.as_deref(), Some("spoken words"));
    assert!(row.is_valid);
    let raw: serde_json::Value = serde_json::from_str(&row.raw_json).unwrap();
    assert_eq!(raw["message"], "spoken words");

    assert_eq!(
        db.get_judgment(other).await.unwrap().message.as_deref(),
        Some("keep")
    );
}

#[tokio::test]
async fn patch_without_match_reports_false() {
    let db = test_db().await;
    assert!(!db.update_message(DEFAULT_USER_ID, 42, "nothing").await.unwrap());
}

#[tokio::test]
async fn missing_judgment_is_not_found() {
    let db = test_db().await;
    assert!(matches!(
        db.get_judgment(99).await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn recent_judgments_are_newest_first() {
    let db = test_db().await;
    for ts in [10, 30, 20] {
        db.insert_judgment(&judgment(ts, None)).await.unwrap();
    }
    let rows = db.recent_judgments(2).await.unwrap();
    let stamps: Vec<i64> = rows.iter().map(|r| r.recorded_at).collect();
    assert_eq!(stamps, vec![30, 20]);
}

#[tokio::test]
async fn file_database_persists_across_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judgments.db");
    {
        let db = JudgmentDatabase::open(&path).await.unwrap();
        db.insert_judgment(&judgment(5, None)).await.unwrap();
    }
    let db = JudgmentDatabase::open(&path).await.unwrap();
    assert_eq!(db.recent_judgments(10).await.unwrap().len(), 1);
}
