//! RFC 9457 problem-details rendering for engine errors.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;

use tollgate_common::api::ProblemDetails;
use tollgate_common::RunId;
use tollgate_engine::EngineError;

/// Render an engine error as a problem-details response. Raw error text
/// stays in the logs; clients get the reason code and a stable title.
pub fn problem_response(
    err: &EngineError,
    trace_id: Option<String>,
    run_id: Option<RunId>,
) -> HttpResponse {
    let status = err.http_status();
    let reason = err.reason_code();
    let title = match status {
        401 => "Authentication failed",
        402 => "Budget drained",
        404 => "Run not found",
        409 => "Idempotency conflict",
        410 => "Run expired",
        422 => "Validation failed",
        429 => "Rate limit exceeded",
        503 => "Service unavailable",
        _ => "Internal error",
    };

    let mut problem = ProblemDetails::new(status, title, reason).with_trace(trace_id);
    if let Some(run_id) = run_id {
        problem = problem.with_run(run_id);
    }
    // Client-actionable details only; internals never escape.
    problem = match err {
        EngineError::Money(inner) => problem.with_detail(inner.to_string()),
        EngineError::Validation(inner) => problem.with_detail(inner.to_string()),
        EngineError::IdempotencyInFlight => {
            problem.with_detail("A submission with this idempotency key is in flight; retry shortly")
        }
        _ => problem,
    };

    let mut builder = HttpResponse::build(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    builder.content_type("application/problem+json");
    if let EngineError::RateLimited {
        retry_after_seconds,
    } = err
    {
        builder.insert_header(("Retry-After", retry_after_seconds.to_string()));
    }
    builder.json(problem)
}
