use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use availability_cell::{AvailabilityStore, SupabaseAvailabilityStore, UnavailabilityException};
use shared_database::supabase::SupabaseClient;
use shared_models::AppError;
use shared_utils::test_utils::{date, time, TestConfig};

fn store_for(mock_server: &MockServer) -> SupabaseAvailabilityStore {
    let config = TestConfig::with_supabase_url(mock_server.uri()).to_app_config();
    SupabaseAvailabilityStore::new(Arc::new(SupabaseClient::new(&config)))
}

#[tokio::test]
async fn test_weekly_rows_decode_from_postgrest() {
    let mock_server = MockServer::start().await;
    let teacher_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/weekly_availability"))
        .and(query_param("teacher_id", format!("eq.{}", teacher_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": Uuid::new_v4(),
            "teacher_id": teacher_id,
            "day": 1,
            "start": "09:00:00",
            "stop": "12:00:00",
            "code": "AbCdEfGhIjKl"
        }])))
        .mount(&mock_server)
        .await;

    let weekly = store_for(&mock_server).weekly_for_teacher(teacher_id).await.unwrap();

    assert_eq!(weekly.len(), 1);
    assert_eq!(weekly[0].start, time(9, 0));
    assert_eq!(weekly[0].stop, time(12, 0));
}

#[tokio::test]
async fn test_exception_merge_goes_through_rpc() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/replace_unavailability_exceptions"))
        .and(body_partial_json(json!({"absorbed_codes": ["old1", "old2"]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let merged = UnavailabilityException {
        id: Uuid::new_v4(),
        teacher_id: Uuid::new_v4(),
        date: date(2024, 5, 6),
        start: time(9, 0),
        stop: time(12, 0),
        code: "merged123456".to_string(),
    };

    store_for(&mock_server)
        .replace_exceptions(&["old1".to_string(), "old2".to_string()], &merged)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_store_failures_surface_as_database_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/unavailability_exceptions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let result = store_for(&mock_server)
        .exceptions_for_teacher(Uuid::new_v4(), date(2024, 5, 6), date(2024, 5, 7))
        .await;

    assert!(matches!(result, Err(AppError::Database(_))));
}
