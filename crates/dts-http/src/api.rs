use crate::AppState;
use crate::auth::AuthUser;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use dts_core::{DataResource, DtsError, SearchParameters, TransferStatusCode};
use dts_tasks::TransferRequest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DOCUMENTATION_URL: &str = "https://github.com/dts-io/dts/blob/main/README.md";

/// Map engine errors onto the API's status codes
fn status_for(error: &DtsError) -> StatusCode {
    match error {
        DtsError::DatabaseNotFound(_)
        | DtsError::EndpointNotFound(_)
        | DtsError::TaskNotFound(_)
        | DtsError::TaskAlreadyTerminal(_) => StatusCode::NOT_FOUND,
        DtsError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DtsError::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---- service info ----

#[derive(Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub documentation: &'static str,
}

pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "dts",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        documentation: DOCUMENTATION_URL,
    })
}

// ---- database catalog ----

#[derive(Serialize)]
pub struct DatabaseInfo {
    pub id: String,
    pub name: String,
    pub organization: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn database_info(id: &str, state: &AppState) -> Option<DatabaseInfo> {
    state.databases.get(id).map(|config| DatabaseInfo {
        id: id.to_string(),
        name: config.name.clone(),
        organization: config.organization.clone(),
        url: config.url.clone(),
    })
}

pub async fn list_databases(State(state): State<AppState>) -> Json<Vec<DatabaseInfo>> {
    let mut databases: Vec<DatabaseInfo> = state
        .databases
        .keys()
        .filter_map(|id| database_info(id, &state))
        .collect();
    databases.sort_by(|a, b| a.id.cmp(&b.id));
    Json(databases)
}

pub async fn get_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> Result<Json<DatabaseInfo>, StatusCode> {
    database_info(&db, &state)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn search_parameters(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !state.databases.contains_key(&db) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(serde_json::json!({
        "query": { "type": "string", "required": true,
                   "description": "substring or prefix matched against file ids" },
        "offset": { "type": "integer", "required": false, "minimum": 0 },
        "limit": { "type": "integer", "required": false, "minimum": 1 },
    })))
}

// ---- file metadata ----

#[derive(Deserialize)]
pub struct FileSearchQuery {
    pub database: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchResults {
    pub database: String,
    pub query: String,
    pub descriptors: Vec<DataResource>,
}

async fn run_search(
    state: &AppState,
    search: FileSearchQuery,
) -> Result<Json<SearchResults>, StatusCode> {
    let database = state.registry.database(&search.database).map_err(|e| {
        tracing::warn!("File search: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    let params = SearchParameters {
        query: search.query.clone(),
        offset: search.offset,
        limit: search.limit,
    };
    match database.search(&params).await {
        Ok(descriptors) => Ok(Json(SearchResults {
            database: search.database,
            query: search.query,
            descriptors,
        })),
        Err(e) => {
            tracing::error!("File search on '{}' failed: {}", search.database, e);
            Err(status_for(&e))
        }
    }
}

pub async fn search_files(
    State(state): State<AppState>,
    Query(search): Query<FileSearchQuery>,
) -> Result<Json<SearchResults>, StatusCode> {
    run_search(&state, search).await
}

pub async fn search_files_post(
    State(state): State<AppState>,
    Json(search): Json<FileSearchQuery>,
) -> Result<Json<SearchResults>, StatusCode> {
    run_search(&state, search).await
}

#[derive(Deserialize)]
pub struct FilesByIdQuery {
    pub database: String,
    /// Comma-separated file ids
    pub ids: String,
}

pub async fn files_by_id(
    State(state): State<AppState>,
    Query(query): Query<FilesByIdQuery>,
) -> Result<Json<SearchResults>, StatusCode> {
    let database = state
        .registry
        .database(&query.database)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();

    match database.descriptors(&ids).await {
        Ok(descriptors) => Ok(Json(SearchResults {
            database: query.database,
            query: String::new(),
            descriptors,
        })),
        Err(e) => {
            tracing::error!("Descriptor lookup on '{}' failed: {}", query.database, e);
            Err(status_for(&e))
        }
    }
}

// ---- transfers ----

#[derive(Deserialize)]
pub struct CreateTransferRequest {
    /// Defaults to the authenticated caller's ORCID
    #[serde(default)]
    pub orcid: Option<String>,
    pub source: String,
    pub destination: String,
    pub file_ids: Vec<String>,
}

#[derive(Serialize)]
pub struct CreateTransferResponse {
    pub id: Uuid,
}

pub async fn create_transfer(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateTransferRequest>,
) -> Result<(StatusCode, Json<CreateTransferResponse>), StatusCode> {
    let orcid = request
        .orcid
        .filter(|orcid| !orcid.is_empty())
        .unwrap_or(user.orcid);

    let result = state
        .tasks
        .create(TransferRequest {
            orcid,
            source: request.source,
            destination: request.destination,
            file_ids: request.file_ids,
        })
        .await;

    match result {
        Ok(id) => Ok((StatusCode::CREATED, Json(CreateTransferResponse { id }))),
        Err(e) => {
            tracing::warn!("Transfer creation rejected: {}", e);
            Err(status_for(&e))
        }
    }
}

#[derive(Serialize)]
pub struct TransferStatusResponse {
    pub id: Uuid,
    pub status: TransferStatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub num_files: usize,
    pub num_files_transferred: usize,
    pub num_files_skipped: usize,
}

pub async fn transfer_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferStatusResponse>, StatusCode> {
    match state.tasks.status(id).await {
        Ok(status) => Ok(Json(TransferStatusResponse {
            id,
            status: status.code,
            message: status.message,
            num_files: status.num_files,
            num_files_transferred: status.num_files_transferred,
            num_files_skipped: status.num_files_skipped,
        })),
        Err(e) => Err(status_for(&e)),
    }
}

pub async fn cancel_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    match state.tasks.cancel(id).await {
        Ok(_) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            tracing::warn!("Cancellation of {} rejected: {}", id, e);
            Err(status_for(&e))
        }
    }
}
