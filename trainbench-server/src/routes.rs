//! HTTP routes for the experiment API.
//!
//! Every JSON endpoint answers with the same envelope:
//! `{timestamp, success, message, data}`; caller mistakes are 400s with a
//! readable message, never an unhandled fault.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use trainbench_core::status::now_string;
use trainbench_core::{CoreError, ExperimentConfig, ExperimentStore, RunSupervisor};

/// Shared handler state, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ExperimentStore>,
    pub supervisor: Arc<RunSupervisor>,
}

#[derive(Debug, serde::Serialize)]
struct Envelope {
    timestamp: String,
    success: bool,
    message: Option<String>,
    data: Option<Value>,
}

type ApiResponse = (StatusCode, Json<Envelope>);

fn success(message: impl Into<String>, data: Option<Value>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(Envelope {
            timestamp: now_string(),
            success: true,
            message: Some(message.into()),
            data,
        }),
    )
}

fn reject(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(Envelope {
            timestamp: now_string(),
            success: false,
            message: Some(message.into()),
            data: None,
        }),
    )
}

fn failure(err: &CoreError) -> ApiResponse {
    let status = if err.is_rejection() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    reject(status, err.to_string())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, Box<ApiResponse>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|_| Box::new(reject(StatusCode::BAD_REQUEST, "Data format must be JSON!")))?;
    serde_json::from_value(value).map_err(|err| {
        Box::new(reject(
            StatusCode::BAD_REQUEST,
            format!("Invalid request body: {err}"),
        ))
    })
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: String,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/exp/create", post(create))
        .route("/exp/list", get(list))
        .route("/exp/start", post(start))
        .route("/exp/delete", delete(remove))
        .route("/exp/info", post(info))
        .route("/exp/ping", get(ping))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ping() -> &'static str {
    "PONG"
}

async fn create(State(state): State<AppState>, body: String) -> ApiResponse {
    tracing::info!("[Experiment][Create] Received request");
    let config: ExperimentConfig = match parse_body(&body) {
        Ok(config) => config,
        Err(response) => return *response,
    };

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.create(config)).await {
        Ok(Ok(id)) => success("Create experiment success!", Some(json!({ "id": id }))),
        Ok(Err(err)) => failure(&err),
        Err(err) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("create task failed: {err}"),
        ),
    }
}

async fn list(State(state): State<AppState>) -> ApiResponse {
    tracing::info!("[Experiment][List] Received request");
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.list()).await {
        Ok(Ok(statuses)) => match serde_json::to_value(statuses) {
            Ok(data) => success("List experiment success!", Some(data)),
            Err(err) => reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("status serialization failed: {err}"),
            ),
        },
        Ok(Err(err)) => failure(&err),
        Err(err) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("list task failed: {err}"),
        ),
    }
}

async fn start(State(state): State<AppState>, body: String) -> ApiResponse {
    tracing::info!("[Experiment][Start] Received request");
    let IdBody { id } = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(response) => return *response,
    };

    let store = state.store.clone();
    let supervisor = state.supervisor.clone();
    let check_id = id.clone();
    let prepared =
        tokio::task::spawn_blocking(move || store.prepare_start(&check_id, &supervisor)).await;

    match prepared {
        Ok(Ok(exp)) => match state.supervisor.launch(exp) {
            Ok(()) => {
                tracing::info!("[Experiment][Start] Experiment {id} started");
                success(format!("Experiment {id} started!"), None)
            }
            Err(err) => failure(&err),
        },
        Ok(Err(err)) => failure(&err),
        Err(err) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("start task failed: {err}"),
        ),
    }
}

async fn remove(State(state): State<AppState>, body: String) -> ApiResponse {
    tracing::info!("[Experiment][Delete] Received request");
    let IdBody { id } = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(response) => return *response,
    };

    let store = state.store.clone();
    let supervisor = state.supervisor.clone();
    let delete_id = id.clone();
    match tokio::task::spawn_blocking(move || store.delete(&delete_id, &supervisor)).await {
        Ok(Ok(())) => success(format!("Delete {id} success"), Some(json!({ "id": id }))),
        Ok(Err(err)) => failure(&err),
        Err(err) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("delete task failed: {err}"),
        ),
    }
}

async fn info(State(state): State<AppState>, body: String) -> ApiResponse {
    tracing::info!("[Experiment][Info] Received request");
    let IdBody { id } = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(response) => return *response,
    };

    let store = state.store.clone();
    let info_id = id.clone();
    match tokio::task::spawn_blocking(move || store.info(&info_id)).await {
        Ok(Ok(info)) => match serde_json::to_value(&info) {
            Ok(data) => success(format!("Get experiment {id} info success"), Some(data)),
            Err(err) => reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("info serialization failed: {err}"),
            ),
        },
        Ok(Err(err)) => failure(&err),
        Err(err) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("info task failed: {err}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, header};
    use tempfile::TempDir;
    use tower::ServiceExt;
    use trainbench_core::AppConfig;
    use trainbench_core::config::ExperimentsConfig;

    fn test_state(dir: &TempDir) -> AppState {
        let config = AppConfig {
            experiments: ExperimentsConfig {
                dir: dir.path().join("exps"),
                id_len: 12,
            },
            ..Default::default()
        };
        AppState {
            store: Arc::new(ExperimentStore::new(&config).unwrap()),
            supervisor: Arc::new(RunSupervisor::new()),
        }
    }

    fn experiment_json() -> Value {
        json!({
            "model": {
                "layers": [
                    { "name": "flatten" },
                    { "name": "linear", "in_shape": 784, "out_shape": 10 },
                    { "name": "log_softmax" }
                ]
            },
            "data": {
                "source": { "name": "synthetic", "train_len": 32, "valid_len": 16, "seed": 5 },
                "transforms": [ { "name": "to_tensor" } ]
            },
            "train": {
                "lr": 0.05,
                "batch_size": 16,
                "num_epochs": 1,
                "log_every": 1,
                "loss": "cross_entropy",
                "optim": "gradient_descent"
            }
        })
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.unwrap_or_default()))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/exp/ping")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"PONG");
    }

    #[tokio::test]
    async fn test_create_rejects_non_json_body() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/create",
            Some("not json".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope["success"], json!(false));
        assert_eq!(envelope["message"], json!("Data format must be JSON!"));
        assert!(envelope["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_catalog_name() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let mut body = experiment_json();
        body["model"]["layers"][0] = json!({ "name": "conv2d" });
        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/create",
            Some(body.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope["success"], json!(false));
    }

    #[tokio::test]
    async fn test_create_list_info_delete_flow() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/create",
            Some(experiment_json().to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["success"], json!(true));
        let id = envelope["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 12);

        // Duplicate config is rejected and names the existing experiment.
        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/create",
            Some(experiment_json().to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(envelope["message"].as_str().unwrap().contains(&id));

        let (status, envelope) = call(&state, Method::GET, "/exp/list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["data"][&id]["run"]["status"], json!("create"));

        let info_body = json!({ "id": id }).to_string();
        let (status, envelope) =
            call(&state, Method::POST, "/exp/info", Some(info_body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            envelope["data"]["model"]
                .as_str()
                .unwrap()
                .contains("Linear")
        );
        assert_eq!(envelope["data"]["status"]["run"]["status"], json!("create"));

        let (status, envelope) =
            call(&state, Method::DELETE, "/exp/delete", Some(info_body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["data"]["id"], json!(id));

        let (_, envelope) = call(&state, Method::GET, "/exp/list", None).await;
        assert_eq!(envelope["data"], json!({}));
    }

    #[tokio::test]
    async fn test_start_unknown_id() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/start",
            Some(json!({ "id": "zzzzzzzzzzzz" }).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope["success"], json!(false));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_runs_to_done() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (_, envelope) = call(
            &state,
            Method::POST,
            "/exp/create",
            Some(experiment_json().to_string()),
        )
        .await;
        let id = envelope["data"]["id"].as_str().unwrap().to_string();

        let (status, envelope) = call(
            &state,
            Method::POST,
            "/exp/start",
            Some(json!({ "id": id }).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["success"], json!(true));

        state.supervisor.wait(&id).await;

        let (_, envelope) = call(
            &state,
            Method::POST,
            "/exp/info",
            Some(json!({ "id": id }).to_string()),
        )
        .await;
        assert_eq!(envelope["data"]["status"]["run"]["status"], json!("done"));
        let accuracy = envelope["data"]["status"]["result"]["valid"]["accuracy"]
            .as_f64()
            .unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }
}
