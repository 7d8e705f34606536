use std::convert::Infallible;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::post,
};
use common::api::Intent;
use futures_util::{StreamExt, stream};
use tokio::task::JoinError;
use tracing::error;

use crate::app_state::{AppState, ApplyGuard};
use crate::apply::{ApplyError, ApplyOutcome};
use crate::error::{ApiResult, AppError};
use crate::progress::ProgressSink;
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/apply", post(apply))
        .route("/refresh", post(refresh))
}

/// Validates the posted intent, then streams the apply as it runs.
pub(crate) async fn apply(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    if body.is_empty() {
        return Err(AppError::bad_request("request body must be an intent document"));
    }
    let intent = validation::parse(&body)?;
    let guard = state.try_begin_apply()?;
    Ok(stream_apply(&state, intent, guard))
}

/// Re-applies the last applied intent, re-resolving versions.
pub(crate) async fn refresh(State(state): State<AppState>) -> ApiResult<Response> {
    let guard = state.try_begin_apply()?;
    let Some(applied) = state.reconciler.store().load_applied()? else {
        return Err(AppError::not_found("no intent has been applied yet"));
    };
    Ok(stream_apply(&state, applied.intent, guard))
}

/// The apply runs in its own task so a disconnecting client cannot cut it short.
fn stream_apply(state: &AppState, intent: Intent, guard: ApplyGuard) -> Response {
    let (sink, rx) = ProgressSink::channel();
    let reconciler = state.reconciler.clone();
    let task = tokio::spawn(async move {
        let _guard = guard;
        reconciler.apply(intent, sink).await
    });

    let lines = stream::unfold(Some((rx, task)), |pending| async move {
        let (mut rx, task) = pending?;
        match rx.recv().await {
            Some(event) => Some((format!("{event}\n"), Some((rx, task)))),
            None => Some((final_line(task.await), None)),
        }
    })
    .map(Ok::<_, Infallible>);

    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn final_line(result: Result<Result<ApplyOutcome, ApplyError>, JoinError>) -> String {
    match result {
        Ok(Ok(outcome)) => format!("done: applied {} services\n", outcome.services),
        Ok(Err(err)) => format!("error: [{}] {}\n", err.stage, err.reason()),
        Err(err) => {
            error!(error = %err, "apply task did not complete");
            "error: apply task did not complete\n".to_string()
        }
    }
}
