use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use tollgate_common::api::{
    SubmitRunRequest, HEADER_BALANCE_REMAINING, HEADER_COST_RESERVED, HEADER_COST_USED,
    HEADER_IDEMPOTENCY_KEY,
};
use tollgate_common::config::EngineConfig;
use tollgate_common::{RunId, TenantId};
use tollgate_engine::auth::Authenticator;
use tollgate_engine::objstore::ResultStore;
use tollgate_engine::ratelimit::PollRateLimiter;
use tollgate_engine::submit::{CostHeaders, SubmissionEngine};
use tollgate_engine::EngineError;

use crate::problem::problem_response;

pub struct AppState {
    pub submission: SubmissionEngine,
    pub auth: Arc<dyn Authenticator>,
    pub results: Arc<dyn ResultStore>,
    pub limiter: PollRateLimiter,
    pub config: EngineConfig,
}

async fn authenticate(state: &AppState, request: &HttpRequest) -> Result<TenantId, EngineError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");
    state.auth.authenticate(token).await
}

fn cost_headers(mut response: HttpResponse, headers: &CostHeaders) -> HttpResponse {
    let pairs = [
        (HEADER_COST_RESERVED, headers.reserved.to_display()),
        (HEADER_COST_USED, headers.used.to_display()),
        (HEADER_BALANCE_REMAINING, headers.balance.to_display()),
    ];
    let response_headers = response.headers_mut();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            actix_web::http::header::HeaderName::try_from(name),
            actix_web::http::header::HeaderValue::try_from(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    response
}

/// POST /v1/runs
pub async fn submit_run(
    state: web::Data<AppState>,
    request: HttpRequest,
    body: web::Json<SubmitRunRequest>,
) -> HttpResponse {
    let body = body.into_inner();
    let trace_id = body
        .meta
        .as_ref()
        .and_then(|meta| meta.trace_id.clone());

    let tenant = match authenticate(&state, &request).await {
        Ok(tenant) => tenant,
        Err(err) => return problem_response(&err, trace_id, None),
    };

    let idempotency_key = request
        .headers()
        .get(HEADER_IDEMPOTENCY_KEY)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    match state.submission.submit(&tenant, idempotency_key, &body).await {
        Ok((receipt, headers)) => {
            let response = HttpResponse::Accepted().json(&receipt);
            cost_headers(response, &headers)
        }
        Err(err) => {
            let run_id = match &err {
                EngineError::IdempotencyConflict { run_id } => Some(*run_id),
                _ => None,
            };
            problem_response(&err, trace_id, run_id)
        }
    }
}

/// GET /v1/runs/{run_id}
pub async fn poll_run(
    state: web::Data<AppState>,
    request: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let tenant = match authenticate(&state, &request).await {
        Ok(tenant) => tenant,
        Err(err) => return problem_response(&err, None, None),
    };

    if let Err(err) = state.limiter.check(&tenant) {
        return problem_response(&err, None, None);
    }

    // An unparsable id cannot name any run; same stealth 404 as a miss.
    let run_id: RunId = match path.into_inner().parse() {
        Ok(run_id) => run_id,
        Err(_) => return problem_response(&EngineError::RunNotFound, None, None),
    };

    match state
        .submission
        .poll(&tenant, &run_id, state.results.as_ref())
        .await
    {
        Ok((status, headers)) => {
            let response = HttpResponse::Ok().json(&status);
            cost_headers(response, &headers)
        }
        Err(err @ EngineError::RunExpired(_)) => problem_response(&err, None, Some(run_id)),
        Err(err) => problem_response(&err, None, None),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// GET /v1/runs
pub async fn list_runs(
    state: web::Data<AppState>,
    request: HttpRequest,
    params: web::Query<ListParams>,
) -> HttpResponse {
    let tenant = match authenticate(&state, &request).await {
        Ok(tenant) => tenant,
        Err(err) => return problem_response(&err, None, None),
    };

    if let Err(err) = state.limiter.check(&tenant) {
        return problem_response(&err, None, None);
    }

    match state
        .submission
        .list(&tenant, params.before, params.limit)
        .await
    {
        Ok(listing) => HttpResponse::Ok().json(&listing),
        Err(err) => problem_response(&err, None, None),
    }
}

/// GET /healthz, unauthenticated liveness probe.
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}
