// HTTP route handlers for the labrunner API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn module_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^module-\d+$").expect("valid regex"))
}

pub fn is_valid_module_id(module_id: &str) -> bool {
    module_id_pattern().is_match(module_id)
}

/// Validates the path id and body; returns the code to execute.
fn validate_submission(module_id: &str, payload: Option<Json<CodeRequest>>) -> Result<String, Response> {
    if !is_valid_module_id(module_id) {
        warn!(module_id, "Rejected invalid module id");
        return Err(error_response(StatusCode::BAD_REQUEST, "Invalid module ID format"));
    }
    let code = payload.map(|Json(body)| body.code).unwrap_or_default();
    if code.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Code is required"));
    }
    Ok(code)
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "healthy" })))
}

/// GET /api/modules
pub async fn list_modules(State(state): State<Arc<AppState>>) -> Response {
    match state.executor.catalog().list_modules() {
        Ok(modules) => (StatusCode::OK, Json(modules)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list modules");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load modules")
        }
    }
}

/// GET /api/modules/:module_id
pub async fn get_module(State(state): State<Arc<AppState>>, Path(module_id): Path<String>) -> Response {
    if !is_valid_module_id(&module_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid module ID format");
    }
    match state.executor.catalog().module_content(&module_id) {
        Ok(content) => (StatusCode::OK, Json(content)).into_response(),
        Err(e) => {
            warn!(module_id = %module_id, error = %e, "Module lookup failed");
            error_response(StatusCode::NOT_FOUND, "Module not found")
        }
    }
}

/// POST /api/run/:module_id
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
    payload: Option<Json<CodeRequest>>,
) -> Response {
    let code = match validate_submission(&module_id, payload) {
        Ok(code) => code,
        Err(response) => return response,
    };

    let result = state.executor.run_code(&module_id, &code).await;
    info!(
        module_id = %module_id,
        success = result.success,
        execution_time_ms = result.execution_time_ms,
        "Run request served"
    );
    (StatusCode::OK, Json(result)).into_response()
}

/// POST /api/test/:module_id
pub async fn run_tests(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
    payload: Option<Json<CodeRequest>>,
) -> Response {
    let code = match validate_submission(&module_id, payload) {
        Ok(code) => code,
        Err(response) => return response,
    };

    let suite = state.executor.run_tests(&module_id, &code).await;
    info!(
        module_id = %module_id,
        total = suite.total_tests,
        passed = suite.passed_tests,
        "Test request served"
    );
    (StatusCode::OK, Json(suite)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrunner_common::config::{EngineConfig, SandboxConfig};
    use labrunner_engine::Executor;
    use std::fs;
    use tempfile::TempDir;

    async fn state_with_modules() -> (TempDir, Arc<AppState>) {
        let root = TempDir::new().unwrap();
        let module = root.path().join("module-1");
        fs::create_dir_all(module.join("exercise")).unwrap();
        fs::write(
            module.join("module.json"),
            r#"{"id":"module-1","title":"Functions","files":{"exercise":{"test":"exercise/test.js"}}}"#,
        )
        .unwrap();
        fs::write(module.join("exercise/test.js"), "describe()").unwrap();

        let engine = EngineConfig {
            modules_path: root.path().to_path_buf(),
            runtime_bin: "sh".to_string(),
            ..EngineConfig::default()
        };
        let sandbox = SandboxConfig {
            enabled: false,
            ..SandboxConfig::default()
        };
        let executor = Executor::initialize(sandbox, engine).await;
        (root, Arc::new(AppState { executor }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn code(body: &str) -> Option<Json<CodeRequest>> {
        Some(Json(CodeRequest {
            code: body.to_string(),
        }))
    }

    #[test]
    fn test_module_id_format() {
        assert!(is_valid_module_id("module-1"));
        assert!(is_valid_module_id("module-42"));
        assert!(!is_valid_module_id("module-"));
        assert!(!is_valid_module_id("module-1/../../etc"));
        assert!(!is_valid_module_id("lesson-1"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_run_rejects_bad_module_id() {
        let (_root, state) = state_with_modules().await;
        let response = run_code(State(state), Path("bad-id".to_string()), code("echo hi")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid module ID format");
    }

    #[tokio::test]
    async fn test_run_requires_code() {
        let (_root, state) = state_with_modules().await;

        let empty = run_tests(State(state.clone()), Path("module-1".to_string()), code("  ")).await;
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(empty).await["error"], "Code is required");

        let missing = run_code(State(state), Path("module-1".to_string()), None).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let (_root, state) = state_with_modules().await;
        let response = run_code(State(state), Path("module-1".to_string()), code("echo hi")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["output"], "hi");
        assert_eq!(body["exerciseType"], "function");
        assert!(body["executionTime"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_module_is_a_result() {
        let (_root, state) = state_with_modules().await;
        let response = run_code(State(state), Path("module-99".to_string()), code("echo hi")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_module_listing_and_content() {
        let (_root, state) = state_with_modules().await;

        let list = list_modules(State(state.clone())).await;
        assert_eq!(list.status(), StatusCode::OK);
        assert_eq!(body_json(list).await[0]["id"], "module-1");

        let content = get_module(State(state.clone()), Path("module-1".to_string())).await;
        assert_eq!(content.status(), StatusCode::OK);
        assert_eq!(body_json(content).await["exerciseContent"]["editorFiles"]["test"], "describe()");

        let missing = get_module(State(state), Path("module-8".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
