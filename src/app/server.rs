//! HTTP surface over the task manager.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::manager::task_manager::TaskManager;
use crate::models::module::Module;
use crate::models::tab::Tab;
use crate::models::task::{OutputSnapshot, TaskSummary};

type AppState = Arc<TaskManager>;
type ApiResult<T> = Result<Json<T>, EngineError>;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidState(_) => StatusCode::CONFLICT,
            EngineError::MissingInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::SpawnFailure(_)
            | EngineError::RuntimeFailure(_)
            | EngineError::Internal(_) => {
                error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", delete(delete_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/tasks/:id/output", get(read_output))
        .route("/tasks/:id/download", get(download_output))
        .route("/tabs", get(list_tabs).post(create_tab))
        .route("/tabs/:id", get(get_tab).put(rename_tab).delete(delete_tab))
        .route("/tabs/:id/tasks", get(list_tasks))
        .route("/modules", get(list_modules))
        .route("/modules/reload", post(reload_modules))
        .route("/vars", get(list_vars).post(set_var))
        .route("/vars/:key", delete(delete_var))
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(alias = "tab_id")]
    pub tab_id: u64,
    #[serde(alias = "module_id")]
    pub module_id: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct TabRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct VarRequest {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    pub offset: Option<usize>,
}

fn empty() -> Json<Value> {
    Json(json!({}))
}

async fn create_task(
    State(manager): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Created>), EngineError> {
    let id = manager.create_task(req.tab_id, &req.module_id, &req.inputs)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn start_task(State(manager): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    manager.start_task(id)?;
    Ok(empty())
}

async fn stop_task(State(manager): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    manager.stop_task(id)?;
    Ok(empty())
}

async fn delete_task(State(manager): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    manager.delete_task(id)?;
    Ok(empty())
}

async fn read_output(
    State(manager): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<OutputSnapshot> {
    let snapshot = match query.offset {
        Some(offset) => manager.read_output_from(id, offset)?,
        None => manager.read_output(id)?,
    };
    Ok(Json(snapshot))
}

async fn download_output(
    State(manager): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Response, EngineError> {
    let task = manager.get_task(id)?;
    let filename = format!("task_{}_{}.txt", task.id, task.module_id);
    let disposition = format!("attachment; filename=\"{}\"", filename);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        task.output,
    )
        .into_response())
}

async fn list_tabs(State(manager): State<AppState>) -> ApiResult<Vec<Tab>> {
    Ok(Json(manager.list_tabs()?))
}

async fn get_tab(State(manager): State<AppState>, Path(id): Path<u64>) -> ApiResult<Tab> {
    Ok(Json(manager.get_tab(id)?))
}

async fn create_tab(
    State(manager): State<AppState>,
    Json(req): Json<TabRequest>,
) -> Result<(StatusCode, Json<Created>), EngineError> {
    let tab = manager.create_tab(&req.name)?;
    Ok((StatusCode::CREATED, Json(Created { id: tab.id })))
}

async fn rename_tab(
    State(manager): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<TabRequest>,
) -> ApiResult<Value> {
    manager.rename_tab(id, &req.name)?;
    Ok(empty())
}

async fn delete_tab(State(manager): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    manager.delete_tab(id)?;
    Ok(empty())
}

async fn list_tasks(
    State(manager): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<TaskSummary>> {
    Ok(Json(manager.list_tasks(id)?))
}

async fn list_modules(State(manager): State<AppState>) -> Json<Vec<Module>> {
    Json(manager.list_modules().as_ref().clone())
}

async fn reload_modules(State(manager): State<AppState>) -> Json<Value> {
    Json(json!({ "count": manager.reload_modules() }))
}

async fn list_vars(State(manager): State<AppState>) -> ApiResult<BTreeMap<String, String>> {
    Ok(Json(manager.global_vars()?))
}

async fn set_var(
    State(manager): State<AppState>,
    Json(req): Json<VarRequest>,
) -> ApiResult<Value> {
    manager.set_global_var(&req.key, &req.value)?;
    Ok(empty())
}

async fn delete_var(State(manager): State<AppState>, Path(key): Path<String>) -> ApiResult<Value> {
    manager.delete_global_var(&key)?;
    Ok(empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::task_manager::EngineSettings;
    use crate::models::task::TaskStatus;
    use crate::registry::{parse_module, ModuleRegistry};
    use crate::store::Store;
    use crate::test_support::{eventually, FakeBehavior, FakeLauncher};
    use std::time::Duration;
    use tempfile::TempDir;

    fn state(launcher: Arc<FakeLauncher>, workspace: &TempDir) -> AppState {
        let module =
            parse_module("id: ping-sweep\nname: Ping sweep\ncommand: nmap -sn {{target}}\n")
                .unwrap();
        let settings = EngineSettings {
            workspace: workspace.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_millis(200),
            ..EngineSettings::default()
        };
        Arc::new(
            TaskManager::new(
                Arc::new(Store::open_in_memory().unwrap()),
                Arc::new(ModuleRegistry::from_modules(vec![module])),
                launcher,
                settings,
            )
            .unwrap(),
        )
    }

    async fn new_tab(state: &AppState) -> u64 {
        let (status, Json(created)) = create_tab(
            State(state.clone()),
            Json(TabRequest {
                name: "lan".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        created.id
    }

    async fn create(state: &AppState, tab: u64, target: &str) -> Result<u64, EngineError> {
        let req: CreateTaskRequest = serde_json::from_value(json!({
            "tabId": tab,
            "moduleId": "ping-sweep",
            "inputs": { "target": target },
        }))
        .unwrap();
        let (_, Json(created)) = create_task(State(state.clone()), Json(req)).await?;
        Ok(created.id)
    }

    #[test]
    fn create_request_accepts_both_spellings() {
        let camel: CreateTaskRequest =
            serde_json::from_value(json!({"tabId": 1, "moduleId": "m"})).unwrap();
        let snake: CreateTaskRequest =
            serde_json::from_value(json!({"tab_id": 1, "module_id": "m", "inputs": {"ip": "x"}}))
                .unwrap();
        assert_eq!(camel.tab_id, snake.tab_id);
        assert_eq!(camel.module_id, snake.module_id);
        assert!(camel.inputs.is_empty());
        assert_eq!(snake.inputs.get("ip").map(String::as_str), Some("x"));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (EngineError::task_not_found(1), StatusCode::NOT_FOUND),
            (EngineError::InvalidState("x".into()), StatusCode::CONFLICT),
            (
                EngineError::MissingInput("target".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EngineError::Internal("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn task_lifecycle_over_handlers() {
        let workspace = TempDir::new().unwrap();
        let launcher = FakeLauncher::new();
        launcher.push(FakeBehavior::exits(0, &["Host 10.0.0.1 is up\n"]));
        let state = state(launcher.clone(), &workspace);
        let tab = new_tab(&state).await;

        let id = create(&state, tab, "10.0.0.0/24").await.unwrap();
        start_task(State(state.clone()), Path(id)).await.unwrap();

        let manager = state.clone();
        let done = tokio::task::spawn_blocking(move || {
            eventually(Duration::from_secs(5), || {
                manager.read_output(id).unwrap().status == TaskStatus::Completed
            })
        })
        .await
        .unwrap();
        assert!(done);

        let Json(snapshot) = read_output(
            State(state.clone()),
            Path(id),
            Query(OutputQuery { offset: None }),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.output, "Host 10.0.0.1 is up\n");
        let body = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["nextOffset"], 20);

        let Json(tail) = read_output(
            State(state.clone()),
            Path(id),
            Query(OutputQuery { offset: Some(5) }),
        )
        .await
        .unwrap();
        assert_eq!(tail.output, "10.0.0.1 is up\n");

        let Json(listed) = list_tasks(State(state.clone()), Path(tab)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target.as_deref(), Some("10.0.0.0/24"));

        let response = download_output(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("task_1_ping-sweep.txt")));

        delete_task(State(state.clone()), Path(id)).await.unwrap();
        delete_task(State(state.clone()), Path(id)).await.unwrap();
        let Json(listed) = list_tasks(State(state.clone()), Path(tab)).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_report_errors() {
        let workspace = TempDir::new().unwrap();
        let state = state(FakeLauncher::new(), &workspace);
        let tab = new_tab(&state).await;

        let err = create(&state, tab, "").await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(_)));

        let err = start_task(State(state.clone()), Path(42)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = list_tasks(State(state.clone()), Path(99)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let Json(found) = get_tab(State(state.clone()), Path(tab)).await.unwrap();
        assert_eq!(found.name, "lan");
        assert!(get_tab(State(state.clone()), Path(99)).await.is_err());
    }

    #[tokio::test]
    async fn variables_round_through_the_api() {
        let workspace = TempDir::new().unwrap();
        let state = state(FakeLauncher::new(), &workspace);

        set_var(
            State(state.clone()),
            Json(VarRequest {
                key: "DOMAIN".into(),
                value: "corp.local".into(),
            }),
        )
        .await
        .unwrap();
        let Json(vars) = list_vars(State(state.clone())).await.unwrap();
        assert_eq!(vars.get("DOMAIN").map(String::as_str), Some("corp.local"));

        delete_var(State(state.clone()), Path("DOMAIN".into()))
            .await
            .unwrap();
        let Json(vars) = list_vars(State(state.clone())).await.unwrap();
        assert!(vars.is_empty());

        let Json(modules) = list_modules(State(state.clone())).await;
        assert_eq!(modules.len(), 1);
        let Json(count) = reload_modules(State(state)).await;
        assert_eq!(count["count"], 1);
    }
}
