use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mailsync_core::config::{ProviderConfig, SyncConfig};
use mailsync_core::migrations::run_migrations;
use mailsync_core::threads::ThreadRepository;
use mailsync_core::{
    AccountRepository, Database, DeltaTokenStore, FolderLabel, NewAccount, SyncError, SyncService,
    ThreadFolders,
};
use reqwest::Client;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

async fn setup() -> (Database, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join(format!("db_{}.sqlite", uuid::Uuid::new_v4()));
    let db = Database::new(&db_path).await.expect("create db");
    run_migrations(&db).await.expect("migrations");
    (db, dir)
}

fn service(db: &Database, server: &MockServer) -> SyncService {
    SyncService::new(
        db.clone(),
        Client::new(),
        ProviderConfig {
            api_base: server.uri(),
            ..ProviderConfig::default()
        },
        SyncConfig {
            readiness_poll_ms: 5,
            ..SyncConfig::default()
        },
    )
}

async fn link(db: &Database) {
    AccountRepository::new(db.clone())
        .upsert_linked(NewAccount {
            id: "acc-1".into(),
            user_id: "user-1".into(),
            email_address: "me@x.com".into(),
            name: Some("Me".into()),
            access_token: "secret".into(),
        })
        .await
        .expect("link account");
}

fn message(id: &str, thread: &str, labels: &[&str], sent_at: &str) -> Value {
    json!({
        "id": id,
        "threadId": thread,
        "subject": format!("About {thread}"),
        "from": {"address": "a@x.com", "name": "Ann"},
        "to": [{"address": "me@x.com"}],
        "cc": [{"address": "b@x.com"}],
        "sysLabels": labels,
        "sentAt": sent_at,
        "body": "<p>Hello</p>",
        "attachments": [{
            "id": format!("att-{id}"),
            "name": "notes.txt",
            "mimeType": "text/plain",
            "size": 5
        }]
    })
}

/// Serves the snapshot chain: not ready once, then ready; pages are served in order.
struct ProviderScript {
    snapshot_calls: Arc<AtomicUsize>,
}

impl Respond for ProviderScript {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.snapshot_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(200).set_body_json(json!({"ready": false}))
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "ready": true,
                "syncUpdatedToken": "snapshot",
                "syncDeletedToken": "deleted"
            }))
        }
    }
}

async fn mount_page(server: &MockServer, key: &str, value: &str, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path("/email/sync/updated"))
        .and(query_param(key, value))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn bootstrap_then_incremental_sync_round_trip() {
    let (db, _dir) = setup().await;
    link(&db).await;
    let server = MockServer::start().await;
    let snapshot_calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/email/sync"))
        .and(query_param("daysWithin", "1"))
        .and(query_param("bodyType", "html"))
        .respond_with(ProviderScript {
            snapshot_calls: snapshot_calls.clone(),
        })
        .expect(2)
        .mount(&server)
        .await;
    mount_page(
        &server,
        "deltaToken",
        "snapshot",
        json!({
            "records": [message("e1", "t1", &["draft"], "2024-01-01T00:00:00Z")],
            "nextPageToken": "page-2"
        }),
        1,
    )
    .await;
    mount_page(
        &server,
        "pageToken",
        "page-2",
        json!({
            "records": [message("e2", "t1", &["inbox"], "2024-01-02T00:00:00Z")],
            "nextDeltaToken": "delta-1"
        }),
        1,
    )
    .await;
    mount_page(
        &server,
        "deltaToken",
        "delta-1",
        json!({
            "records": [message("e3", "t2", &["sent"], "2024-01-03T00:00:00Z")],
            "nextDeltaToken": "delta-2"
        }),
        1,
    )
    .await;

    let service = service(&db, &server);
    let session = service.session_for("acc-1").await.expect("session");

    let batch = session.perform_initial_sync().await.expect("initial sync");
    assert_eq!(batch.emails.len(), 2);
    assert_eq!(batch.delta_token, "delta-1");
    let report = session.ingest_batch(&batch).await;
    assert_eq!(report.stored(), 2);

    let accounts = AccountRepository::new(db.clone());
    assert_eq!(
        accounts.load("acc-1").await.expect("load").as_deref(),
        Some("delta-1")
    );

    let threads = ThreadRepository::new(db.clone());
    let t1 = threads.get("t1").await.expect("t1");
    assert_eq!(t1.folders, ThreadFolders::only(FolderLabel::Inbox));
    assert_eq!(t1.participant_ids.len(), 3);

    let incremental = session.sync_emails().await.expect("incremental sync");
    assert_eq!(incremental.report.stored(), 1);
    assert_eq!(incremental.batch.delta_token, "delta-2");
    assert_eq!(
        accounts.load("acc-1").await.expect("load").as_deref(),
        Some("delta-2")
    );
    let t2 = threads.get("t2").await.expect("t2");
    assert_eq!(t2.folders, ThreadFolders::only(FolderLabel::Sent));
    assert_eq!(snapshot_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn incremental_sync_before_bootstrap_is_rejected_without_provider_calls() {
    let (db, _dir) = setup().await;
    link(&db).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ready": true})))
        .expect(0)
        .mount(&server)
        .await;

    let session = service(&db, &server)
        .session_for("acc-1")
        .await
        .expect("session");
    let err = session.sync_emails().await.expect_err("not ready");
    assert!(matches!(err, SyncError::NotReady(_)));
}

#[tokio::test]
async fn replaying_the_same_delta_is_idempotent() {
    let (db, _dir) = setup().await;
    link(&db).await;
    let accounts = AccountRepository::new(db.clone());
    accounts.save("acc-1", "same").await.expect("token");

    let server = MockServer::start().await;
    mount_page(
        &server,
        "deltaToken",
        "same",
        json!({
            "records": [
                message("e1", "t1", &["inbox"], "2024-01-01T00:00:00Z"),
                message("e2", "t1", &["sent"], "2024-01-02T00:00:00Z")
            ]
        }),
        2,
    )
    .await;

    let session = service(&db, &server)
        .session_for("acc-1")
        .await
        .expect("session");
    session.sync_emails().await.expect("first sync");
    let before = snapshot_rows(&db).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    session.sync_emails().await.expect("replay");
    let after = snapshot_rows(&db).await;

    assert_eq!(before, after);
    assert_eq!(
        accounts.load("acc-1").await.expect("load").as_deref(),
        Some("same"),
        "no page carried a new cursor"
    );
}

async fn snapshot_rows(db: &Database) -> Vec<String> {
    let conn = db.connection().await.expect("conn");
    let mut out = Vec::new();
    for sql in [
        "SELECT id || '|' || thread_id || '|' || subject || '|' || last_modified_time || '|' || email_label || '|' || from_id FROM emails ORDER BY id",
        "SELECT id || '|' || subject || '|' || last_message_at || '|' || participant_ids_json || '|' || inbox_status || draft_status || sent_status || '|' || done || '|' || created_at || '|' || updated_at FROM threads ORDER BY id",
        "SELECT id || '|' || email_id || '|' || size FROM attachments ORDER BY id",
        "SELECT email_id || '|' || kind || '|' || position || '|' || address_id FROM email_recipients ORDER BY email_id, kind, position",
        "SELECT id || '|' || address || '|' || COALESCE(name, '') || '|' || COALESCE(raw, '') || '|' || created_at || '|' || updated_at FROM email_addresses ORDER BY address",
    ] {
        let mut rows = conn.query(sql, ()).await.expect("query");
        while let Some(row) = rows.next().await.expect("row") {
            out.push(row.get::<String>(0).expect("value"));
        }
    }
    out
}
