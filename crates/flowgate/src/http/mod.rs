//! HTTP adapter for a flow definition
//!
//! [`routes`] builds an axum router for one flow. Hosts nest it wherever
//! they like, e.g. `Router::new().nest("/flows/cr", routes(state))`:
//!
//! | route | operation |
//! |-------|-----------|
//! | `GET /` | every started instance |
//! | `GET /{object_key}` | instance status |
//! | `PUT /{object_key}` | start (or restart) |
//! | `DELETE /{object_key}` | clear |
//! | `POST /{object_key}/steps/{step_id}/approve` | approve with `{"rationale": ...}` |
//! | `POST /{object_key}/steps/{step_id}/reject` | reject with `{"rationale": ...}` |
//!
//! Reads are open. Mutations need a user from the [`UserResolver`]; step
//! resolutions are further checked by [`Approver::can_handle_flow_step`].

mod error;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

pub use error::{ApiError, ErrorResponse};

use crate::engine::{Flow, FlowStatus};
use crate::flow::{Approver, FlowDefinition, FlowObject};

/// Looks up the host's object for a key taken from the URL
#[async_trait]
pub trait ObjectResolver<O>: Send + Sync {
    /// `Ok(None)` when no such object exists
    async fn resolve(&self, object_key: &str) -> anyhow::Result<Option<O>>;
}

/// Identifies the acting user of a request
pub trait UserResolver: Send + Sync {
    /// `None` when the request is not authenticated
    fn resolve(&self, headers: &HeaderMap) -> Option<Arc<dyn Approver>>;
}

impl<F> UserResolver for F
where
    F: Fn(&HeaderMap) -> Option<Arc<dyn Approver>> + Send + Sync,
{
    fn resolve(&self, headers: &HeaderMap) -> Option<Arc<dyn Approver>> {
        self(headers)
    }
}

/// Router state for one flow definition
pub struct FlowApiState<O> {
    pub definition: FlowDefinition<O>,
    pub objects: Arc<dyn ObjectResolver<O>>,
    pub users: Arc<dyn UserResolver>,
}

impl<O> Clone for FlowApiState<O> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            objects: Arc::clone(&self.objects),
            users: Arc::clone(&self.users),
        }
    }
}

impl<O: FlowObject> FlowApiState<O> {
    pub fn new(
        definition: FlowDefinition<O>,
        objects: Arc<dyn ObjectResolver<O>>,
        users: Arc<dyn UserResolver>,
    ) -> Self {
        Self {
            definition,
            objects,
            users,
        }
    }

    fn user(&self, headers: &HeaderMap) -> Result<Arc<dyn Approver>, ApiError> {
        self.users.resolve(headers).ok_or_else(ApiError::unauthorized)
    }

    async fn flow(&self, object_key: &str) -> Result<Flow<O>, ApiError> {
        let object = self
            .objects
            .resolve(object_key)
            .await
            .map_err(|e| {
                tracing::error!("Failed to resolve object {}: {:#}", object_key, e);
                ApiError::internal(format!("failed to resolve object {object_key}"))
            })?
            .ok_or_else(|| ApiError::unknown_object(object_key))?;

        Ok(self.definition.bind(object))
    }
}

/// Response wrapper for list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

/// Body of approve and reject requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub rationale: String,
}

/// Create the routes for one flow definition
pub fn routes<O: FlowObject>(state: FlowApiState<O>) -> Router {
    Router::new()
        .route("/", get(list_flows::<O>))
        .route(
            "/{object_key}",
            get(get_flow::<O>)
                .put(start_flow::<O>)
                .delete(clear_flow::<O>),
        )
        .route(
            "/{object_key}/steps/{step_id}/approve",
            post(approve_step::<O>),
        )
        .route(
            "/{object_key}/steps/{step_id}/reject",
            post(reject_step::<O>),
        )
        .with_state(state)
}

/// GET / - Every started instance with its state and next steps
async fn list_flows<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
) -> Result<Json<ListResponse<FlowStatus>>, ApiError> {
    let data = state.definition.started().await?;
    Ok(Json(ListResponse { data }))
}

/// GET /{object_key} - Instance status
async fn get_flow<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
    Path(object_key): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    let flow = state.flow(&object_key).await?;
    Ok(Json(flow.status().await?))
}

/// PUT /{object_key} - Start or restart the flow
async fn start_flow<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
    headers: HeaderMap,
    Path(object_key): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    let user = state.user(&headers)?;
    let flow = state.flow(&object_key).await?;

    flow.start().await?;
    tracing::info!(
        flow_id = %flow.flow_id(),
        %object_key,
        user = %user.id(),
        "Flow started over HTTP"
    );

    Ok(Json(flow.status().await?))
}

/// DELETE /{object_key} - Clear the flow
async fn clear_flow<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
    headers: HeaderMap,
    Path(object_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = state.user(&headers)?;
    let flow = state.flow(&object_key).await?;

    flow.clear().await?;
    tracing::info!(
        flow_id = %flow.flow_id(),
        %object_key,
        user = %user.id(),
        "Flow cleared over HTTP"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// POST /{object_key}/steps/{step_id}/approve
async fn approve_step<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
    headers: HeaderMap,
    Path((object_key, step_id)): Path<(String, String)>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<FlowStatus>, ApiError> {
    let user = state.user(&headers)?;
    let flow = state.flow(&object_key).await?;

    flow.approve(&step_id, user.as_ref(), req.rationale).await?;
    Ok(Json(flow.status().await?))
}

/// POST /{object_key}/steps/{step_id}/reject
async fn reject_step<O: FlowObject>(
    State(state): State<FlowApiState<O>>,
    headers: HeaderMap,
    Path((object_key, step_id)): Path<(String, String)>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<FlowStatus>, ApiError> {
    let user = state.user(&headers)?;
    let flow = state.flow(&object_key).await?;

    flow.reject(&step_id, user.as_ref(), req.rationale).await?;
    Ok(Json(flow.status().await?))
}
