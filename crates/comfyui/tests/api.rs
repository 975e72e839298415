//! HTTP surface tests for `ComfyUIApi` against a mock server.

use assert_matches::assert_matches;
use serde_json::json;
use storyloom_comfyui::api::{ComfyBackend, ComfyUIApi, ComfyUIApiError};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn api() -> (MockServer, ComfyUIApi) {
    let server = MockServer::start().await;
    let api = ComfyUIApi::new(format!("{}/", server.uri()));
    (server, api)
}

#[tokio::test]
async fn submit_returns_prompt_id() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .and(body_json(json!({"prompt": {"1": {}}, "client_id": "c1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"prompt_id": "p1", "number": 3, "node_errors": {}})),
        )
        .mount(&server)
        .await;

    let response = api.submit_workflow(&json!({"1": {}}), "c1").await.unwrap();
    assert_eq!(response.prompt_id, "p1");
    assert_eq!(response.number, 3);
}

#[tokio::test]
async fn submit_rejection_is_structured() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "type": "prompt_outputs_failed_validation",
                "message": "Prompt outputs failed validation",
                "details": ""
            },
            "node_errors": {
                "3": {
                    "class_type": "KSampler",
                    "errors": [{"message": "Required input is missing", "details": "model"}]
                }
            }
        })))
        .mount(&server)
        .await;

    let err = api.submit_workflow(&json!({}), "c1").await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Rejected(rejection) => {
        assert_eq!(rejection.error_type, "prompt_outputs_failed_validation");
        assert_eq!(rejection.node_errors[0].node_id, "3");
        assert_eq!(rejection.node_errors[0].errors, ["Required input is missing: model"]);
    });
}

#[tokio::test]
async fn error_key_on_success_status_is_a_rejection() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "no outputs"})))
        .mount(&server)
        .await;

    let err = api.submit_workflow(&json!({}), "c1").await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Rejected(_));
}

#[tokio::test]
async fn server_error_keeps_status_and_body() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/history/p1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let err = api.get_history("p1").await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Status { status: 500, body } => {
        assert_eq!(body, "internal");
    });
}

#[tokio::test]
async fn queue_lists_running_and_pending() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_running": [[1, "p1", {}, {}, []]],
            "queue_pending": [[2, "p2", {}, {}, []]]
        })))
        .mount(&server)
        .await;

    let queue = api.get_queue().await.unwrap();
    assert_eq!(queue.running, ["p1"]);
    assert_eq!(queue.pending, ["p2"]);
}

#[tokio::test]
async fn upload_image_returns_server_name() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/upload/image"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"name": "start (1).png", "subfolder": "", "type": "input"})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("start.png");
    std::fs::write(&file, b"png").unwrap();

    let uploaded = api.upload_image(&file).await.unwrap();
    assert_eq!(uploaded.name, "start (1).png");
    assert_eq!(uploaded.folder_type, "input");

    let err = api
        .upload_image(&dir.path().join("missing.png"))
        .await
        .unwrap_err();
    assert_matches!(err, ComfyUIApiError::File { .. });
}

#[tokio::test]
async fn view_passes_file_coordinates() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/view"))
        .and(query_param("filename", "clip.mp4"))
        .and(query_param("subfolder", "run1"))
        .and(query_param("type", "output"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"MP4".to_vec()))
        .mount(&server)
        .await;

    let bytes = api.view("clip.mp4", "run1", "output").await.unwrap();
    assert_eq!(bytes, b"MP4");
}

#[tokio::test]
async fn free_memory_and_cancel_post_expected_bodies() {
    let (server, api) = api().await;
    Mock::given(method("POST"))
        .and(path("/free"))
        .and(body_json(json!({"unload_models": true, "free_memory": true})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .and(body_json(json!({"delete": ["p1"]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    api.free_memory().await.unwrap();
    api.cancel_execution("p1").await.unwrap();
}

#[tokio::test]
async fn system_stats_probe() {
    let (server, api) = api().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system": {"os": "posix"}})))
        .mount(&server)
        .await;

    let stats = api.system_stats().await.unwrap();
    assert_eq!(stats["system"]["os"], "posix");
}
