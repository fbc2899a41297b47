//! End-to-end coverage of the webhook -> orchestrator -> store pipeline:
//! a signed delivery reaches `POST /webhook`, is dispatched onto its own
//! worker, and the task it spawns runs to completion and is durably
//! persisted — without any of the three layers being stubbed out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;

use rig_core::config::EngineConfig;
use rig_core::model::Phase;
use rig_core::store::StateStore;
use rig_core::webhook::{router, ExecuteDispatcher};
use rig_test_utils::happy_path_engine;

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn issue_opened_body(repo: &str, number: u64, title: &str) -> Vec<u8> {
    serde_json::json!({
        "action": "opened",
        "issue": {
            "number": number,
            "title": title,
            "labels": [],
            "html_url": format!("https://example.com/issues/{number}"),
            "body": "fix it please",
        },
        "repository": { "full_name": repo },
    })
    .to_string()
    .into_bytes()
}

async fn wait_until_completed(store: &StateStore, task_id: u64) -> Phase {
    for _ in 0..200 {
        let state = store.load().await.unwrap();
        if let Some(task) = state.find_task(task_id) {
            if task.phase.is_inactive() {
                return task.phase;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached an inactive phase");
}

#[tokio::test]
async fn webhook_delivery_drives_a_real_engine_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let engine = Arc::new(happy_path_engine(store.clone()));

    let dispatch_engine = Arc::clone(&engine);
    let dispatcher = move |issue: rig_core::model::Issue| {
        let engine = Arc::clone(&dispatch_engine);
        async move {
            tokio::spawn(async move {
                let _ = engine.execute(issue).await;
            });
            Ok(())
        }
    };

    let secret = "s3cret".to_string();
    let app = router(secret.clone(), vec![], store.clone(), Arc::new(dispatcher));

    let body = issue_opened_body("acme/widgets", 42, "widgets are on fire");
    let signature = sign(&secret, &body);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let state = store.load().await.unwrap();
    assert_eq!(state.tasks.len(), 1);
    let task_id = state.tasks[0].id;

    let final_phase = wait_until_completed(&store, task_id).await;
    assert_eq!(final_phase, Phase::Completed);

    let state = store.load().await.unwrap();
    let task = state.find_task(task_id).unwrap();
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.attempts[0].status, rig_core::model::AttemptStatus::Passed);
}

#[tokio::test]
async fn a_second_delivery_for_the_same_issue_is_deduped_while_the_first_is_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    // Seed a task already in flight for issue "7", as if a prior delivery
    // had dispatched it moments ago.
    store
        .with_state(|state| {
            let id = state.alloc_task_id();
            let issue = rig_test_utils::sample_issue("7");
            let mut task = rig_core::model::Task::new(id, issue, chrono::Utc::now());
            task.phase = Phase::Coding;
            state.tasks.push(task);
        })
        .await
        .unwrap();

    struct PanicIfCalled;
    #[async_trait::async_trait]
    impl ExecuteDispatcher for PanicIfCalled {
        async fn dispatch(&self, _issue: rig_core::model::Issue) -> anyhow::Result<()> {
            panic!("dispatcher should not run for a deduped delivery");
        }
    }

    let secret = "s3cret".to_string();
    let app = router(secret.clone(), vec![], store.clone(), Arc::new(PanicIfCalled));

    let body = issue_opened_body("acme/widgets", 7, "widgets are on fire, again");
    let signature = sign(&secret, &body);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let state = store.load().await.unwrap();
    assert_eq!(state.tasks.len(), 1, "no second task should have been created");
}

#[tokio::test]
async fn engine_config_loaded_from_disk_wires_triggers_into_the_router() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("rig.toml"),
        r#"
        [[triggers]]
        event = "issues.opened"
        labels = ["rig"]
        "#,
    )
    .unwrap();
    let config = EngineConfig::load(dir.path().join("rig.toml")).unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    struct RecordingDispatcher(tokio::sync::Mutex<Vec<rig_core::model::Issue>>);
    #[async_trait::async_trait]
    impl ExecuteDispatcher for RecordingDispatcher {
        async fn dispatch(&self, issue: rig_core::model::Issue) -> anyhow::Result<()> {
            self.0.lock().await.push(issue);
            Ok(())
        }
    }
    let dispatcher = Arc::new(RecordingDispatcher(tokio::sync::Mutex::new(Vec::new())));

    let secret = "s3cret".to_string();
    let app = router(secret.clone(), config.triggers.clone(), store, dispatcher.clone());

    // No "rig" label: the configured trigger should reject it.
    let body = issue_opened_body("acme/widgets", 1, "untagged issue");
    let signature = sign(&secret, &body);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(dispatcher.0.lock().await.is_empty());
}
