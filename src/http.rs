//! HTTP binding of the assignment engine.
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    engine::{AssignmentEngine, AssignmentRequest, GoalRequest},
    registry::ServingStatus,
    unit::UnitIdentity,
    Error,
};

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

enum ApiError {
    BadRequest(String),
    Engine(Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Engine(err @ Error::InvalidGoal(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Engine(err @ Error::RegistryUninitialized) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ApiError::Engine(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Create the router serving `/assign`, `/goal` and `/health`.
pub fn router(engine: Arc<AssignmentEngine>) -> Router {
    Router::new()
        .route("/assign", get(assign_query).post(assign_json))
        .route("/goal", post(record_goal))
        .route("/health", get(health))
        .with_state(engine)
}

/// `GET /assign?exp=<id>&user=&device=&req=&...`
///
/// Query parameters other than the experiment and unit identifiers become context attributes.
async fn assign_query(
    State(engine): State<Arc<AssignmentEngine>>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Response {
    let experiment_id = match params.remove("exp") {
        Some(exp) if !exp.is_empty() => exp,
        _ => return ApiError::BadRequest("missing \"exp\" parameter".to_owned()).into_response(),
    };
    let unit = UnitIdentity {
        user: params.remove("user"),
        device: params.remove("device"),
        req: params.remove("req"),
    };

    assign(
        &engine,
        AssignmentRequest {
            experiment_id,
            unit,
            context: params,
        },
    )
}

/// `POST /assign` with a JSON [`AssignmentRequest`].
async fn assign_json(
    State(engine): State<Arc<AssignmentEngine>>,
    body: Result<Json<AssignmentRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return ApiError::BadRequest(rejection.body_text()).into_response(),
    };
    if request.experiment_id.is_empty() {
        return ApiError::BadRequest("\"experimentId\" must not be empty".to_owned())
            .into_response();
    }

    assign(&engine, request)
}

fn assign(engine: &AssignmentEngine, request: AssignmentRequest) -> Response {
    match engine.assign(&request) {
        Ok(result) => Json(result).into_response(),
        Err(err) => ApiError::Engine(err).into_response(),
    }
}

/// `POST /goal` with a JSON [`GoalRequest`]. Answers 202 with the recorded event.
async fn record_goal(
    State(engine): State<Arc<AssignmentEngine>>,
    body: Result<Json<GoalRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return ApiError::BadRequest(rejection.body_text()).into_response(),
    };

    match engine.record_goal(&request) {
        Ok(event) => (StatusCode::ACCEPTED, Json(event)).into_response(),
        Err(err) => ApiError::Engine(err).into_response(),
    }
}

/// `GET /health`: 200 while serving a configuration, 503 otherwise.
async fn health(State(engine): State<Arc<AssignmentEngine>>) -> Response {
    let report = engine.registry().health();
    let status = match report.status {
        ServingStatus::Serving => StatusCode::OK,
        ServingStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}
