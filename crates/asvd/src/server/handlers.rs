//! Bounded query handlers.
//!
//! Each handler checks its deadline before doing anything else and passes
//! the same deadline to every store call, so an expired request answers 504
//! without touching storage.
//!
//! Query parameters are taken as strings and parsed here so malformed input
//! produces the JSON error envelope rather than a plain-text rejection.
//! Empty values and zero message bounds count as unset.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use asv_core::{parse_date, DomainError, Session, SessionFilter, SessionId};
use asv_protocol::{
    HealthResponse, MachinesResponse, MessagesResponse, MinimapResponse, ProjectsResponse,
    SearchResponse, SessionListResponse, StatsResponse,
};

use super::error::ApiError;
use super::AppState;
use crate::deadline::Deadline;

pub const DEFAULT_SESSION_LIMIT: usize = 200;
pub const MAX_SESSION_LIMIT: usize = 1000;
pub const DEFAULT_MESSAGE_LIMIT: usize = 500;
pub const MAX_MESSAGE_LIMIT: usize = 5000;
pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Query Parameters
// ============================================================================

fn present(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_count(field: &str, raw: &Option<String>) -> Result<Option<u64>, DomainError> {
    present(raw)
        .map(|value| {
            value.parse::<u64>().map_err(|_| DomainError::InvalidFieldValue {
                field: field.to_string(),
                value: value.to_string(),
                expected: "a non-negative integer".to_string(),
            })
        })
        .transpose()
}

/// Parses a page size, falling back to `default` and capping at `max`.
fn parse_limit(raw: &Option<String>, default: usize, max: usize) -> Result<usize, DomainError> {
    let limit = parse_count("limit", raw)?
        .filter(|n| *n > 0)
        .map_or(default, |n| usize::try_from(n).unwrap_or(max));
    Ok(limit.min(max))
}

/// Filter parameters accepted by the session listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionQuery {
    pub date: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub min_messages: Option<String>,
    pub max_messages: Option<String>,
    pub project: Option<String>,
    pub machine: Option<String>,
    pub limit: Option<String>,
}

impl SessionQuery {
    pub fn to_filter(&self) -> Result<SessionFilter, DomainError> {
        let date = |field: &str, raw: &Option<String>| {
            present(raw).map(|value| parse_date(field, value)).transpose()
        };
        let nonzero = |field: &str, raw: &Option<String>| {
            parse_count(field, raw).map(|n| n.filter(|n| *n > 0))
        };

        Ok(SessionFilter {
            date: date("date", &self.date)?,
            date_from: date("date_from", &self.date_from)?,
            date_to: date("date_to", &self.date_to)?,
            min_messages: nonzero("min_messages", &self.min_messages)?,
            max_messages: nonzero("max_messages", &self.max_messages)?,
            project: present(&self.project).map(str::to_string),
            machine: present(&self.machine).map(str::to_string),
        })
    }

    pub fn limit(&self) -> Result<usize, DomainError> {
        parse_limit(&self.limit, DEFAULT_SESSION_LIMIT, MAX_SESSION_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    pub from: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    deadline: Deadline,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> ApiResult<SessionListResponse> {
    deadline.check()?;
    let Query(query) = query?;
    let filter = query.to_filter()?;
    let limit = query.limit()?;

    let page = state.store.list_sessions(&filter, limit, &deadline).await?;
    Ok(Json(SessionListResponse {
        sessions: page.sessions,
        total: page.total,
    }))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
) -> ApiResult<Session> {
    deadline.check()?;
    let id = SessionId::new(id);
    match state.store.get_session(&id, &deadline).await? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NotFound(format!("session not found: {id}"))),
    }
}

/// `GET /sessions/{id}/messages?from=&limit=`
pub async fn get_messages(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> ApiResult<MessagesResponse> {
    deadline.check()?;
    let Query(query) = query?;
    let from = parse_count("from", &query.from)?.unwrap_or(0);
    let limit = parse_limit(&query.limit, DEFAULT_MESSAGE_LIMIT, MAX_MESSAGE_LIMIT)?;

    let id = SessionId::new(id);
    let messages = state.store.get_messages(&id, from, limit, &deadline).await?;
    Ok(Json(MessagesResponse {
        session_id: id,
        messages,
    }))
}

/// `GET /sessions/{id}/minimap`
pub async fn get_minimap(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
) -> ApiResult<MinimapResponse> {
    deadline.check()?;
    let id = SessionId::new(id);
    let entries = state.store.get_minimap(&id, &deadline).await?;
    Ok(Json(MinimapResponse {
        session_id: id,
        entries,
    }))
}

/// `GET /stats`
pub async fn get_stats(
    State(state): State<AppState>,
    deadline: Deadline,
) -> ApiResult<StatsResponse> {
    deadline.check()?;
    Ok(Json(state.store.stats(&deadline).await?))
}

/// `GET /projects`
pub async fn list_projects(
    State(state): State<AppState>,
    deadline: Deadline,
) -> ApiResult<ProjectsResponse> {
    deadline.check()?;
    let projects = state.store.list_projects(&deadline).await?;
    Ok(Json(ProjectsResponse { projects }))
}

/// `GET /machines`
pub async fn list_machines(
    State(state): State<AppState>,
    deadline: Deadline,
) -> ApiResult<MachinesResponse> {
    deadline.check()?;
    let machines = state.store.list_machines(&deadline).await?;
    Ok(Json(MachinesResponse { machines }))
}

/// `GET /search?q=&limit=`
pub async fn search(
    State(state): State<AppState>,
    deadline: Deadline,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<SearchResponse> {
    deadline.check()?;
    if !state.store.has_fts() {
        return Err(ApiError::FtsUnavailable);
    }
    let Query(query) = query?;
    let q = present(&query.q)
        .ok_or_else(|| ApiError::BadRequest("search query is required".to_string()))?
        .to_string();
    let limit = parse_limit(&query.limit, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT)?;

    let results = state.store.search(&q, limit, &deadline).await?;
    Ok(Json(SearchResponse {
        query: q,
        count: results.len(),
        results,
    }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>, deadline: Deadline) -> ApiResult<HealthResponse> {
    deadline.check()?;
    Ok(Json(HealthResponse {
        ok: true,
        fts: state.store.has_fts(),
    }))
}
