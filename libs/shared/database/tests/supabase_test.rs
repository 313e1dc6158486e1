use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use reqwest::Method;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_config::AppConfig;
use shared_database::{DistributedLock, SupabaseClient, SupabaseError, SupabaseLock};

fn test_config(uri: String) -> AppConfig {
    AppConfig {
        supabase_url: uri,
        supabase_anon_key: "test-anon-key".to_string(),
        supabase_service_role_key: "test-service-key".to_string(),
        ..AppConfig::default()
    }
}

// ==============================================================================
// CLIENT
// ==============================================================================

#[tokio::test]
async fn test_request_sends_service_role_bearer_without_user_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/schools"))
        .and(header("apikey", "test-anon-key"))
        .and(header("authorization", "Bearer test-service-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = SupabaseClient::new(&test_config(mock_server.uri()));
    let rows: Vec<Value> = client
        .request(Method::GET, "/rest/v1/schools", None, None)
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_empty_body_decodes_as_null() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/lessons"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let client = SupabaseClient::new(&test_config(mock_server.uri()));
    let value: Value = client
        .request(Method::DELETE, "/rest/v1/lessons", None, None)
        .await
        .unwrap();

    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn test_insert_unique_reports_conflict_as_false() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"code": "23505"})))
        .mount(&mock_server)
        .await;

    let client = SupabaseClient::new(&test_config(mock_server.uri()));
    let inserted = client
        .insert_unique("/rest/v1/scheduling_locks", json!({"lock_key": "teacher:1"}))
        .await
        .unwrap();

    assert!(!inserted);
}

#[tokio::test]
async fn test_server_errors_keep_their_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/commit_lesson_change"))
        .respond_with(ResponseTemplate::new(400).set_body_string("stale_state: lesson moved"))
        .mount(&mock_server)
        .await;

    let client = SupabaseClient::new(&test_config(mock_server.uri()));
    let err = client
        .rpc::<Value>("commit_lesson_change", json!({}))
        .await
        .unwrap_err();

    let supabase_error = err.downcast_ref::<SupabaseError>();
    assert_matches!(supabase_error, Some(SupabaseError::Api { status: 400, .. }));
    assert!(supabase_error.unwrap().body().contains("stale_state"));
}

#[tokio::test]
async fn test_insert_chunked_splits_batches() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/lessons"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = SupabaseClient::new(&test_config(mock_server.uri()));
    let rows: Vec<Value> = (0..250).map(|i| json!({"n": i})).collect();

    let written = client.insert_chunked("/rest/v1/lessons", rows, 100).await.unwrap();
    assert_eq!(written, 250);
}

// ==============================================================================
// LOCK TABLE
// ==============================================================================

#[tokio::test]
async fn test_supabase_lock_acquires_after_purging_expired_row() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(409))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"lock_key": "teacher:1"}])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    let lock = SupabaseLock::new(Arc::new(SupabaseClient::new(&test_config(mock_server.uri()))));
    let acquired = lock.try_acquire("teacher:1", Duration::from_secs(30)).await.unwrap();

    assert_matches!(acquired, Some(lease) if lease.key == "teacher:1");
}

#[tokio::test]
async fn test_supabase_lock_held_by_live_owner() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let lock = SupabaseLock::new(Arc::new(SupabaseClient::new(&test_config(mock_server.uri()))));
    let acquired = lock.try_acquire("teacher:1", Duration::from_secs(30)).await.unwrap();

    assert!(acquired.is_none());
}

#[tokio::test]
async fn test_supabase_lock_release_targets_its_own_lease() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    let lock = SupabaseLock::new(Arc::new(SupabaseClient::new(&test_config(mock_server.uri()))));
    let first = lock.try_acquire("teacher:1", Duration::from_secs(30)).await.unwrap().unwrap();
    let second = lock.try_acquire("teacher:2", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_ne!(first.token, second.token);

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/scheduling_locks"))
        .and(query_param("lock_key", "eq.teacher:1"))
        .and(query_param("owner", format!("eq.{}", first.token)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    lock.release(&first).await.unwrap();
}

#[tokio::test]
async fn test_supabase_lock_extend_reports_lost_lease() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    let lock = SupabaseLock::new(Arc::new(SupabaseClient::new(&test_config(mock_server.uri()))));
    let lease = lock.try_acquire("job:planner", Duration::from_secs(30)).await.unwrap().unwrap();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/scheduling_locks"))
        .and(query_param("owner", format!("eq.{}", lease.token)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"lock_key": "job:planner"}])))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/scheduling_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    assert!(lock.extend(&lease, Duration::from_secs(30)).await.unwrap());
    assert!(!lock.extend(&lease, Duration::from_secs(30)).await.unwrap());
}
