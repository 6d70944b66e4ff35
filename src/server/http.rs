//! Request/response handlers.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{
    parse_fields, persist_message, reply_for, AppState, CallerId, ErrorBody, FieldsError, Reply,
};
use crate::translate::TranslateRequest;

pub const MISSING_FIELDS: &str = "Missing required fields: message, source_lang, target_lang";
pub const MISSING_MESSAGE_FIELDS: &str =
    "Missing required fields: receiver_id, message, source_lang, target_lang";
pub const INVALID_JSON: &str = "Invalid JSON format.";
pub const TRANSLATION_FAILED: &str = "Translation failed or unsupported language pair";
pub const HISTORY_DISABLED: &str = "Message history is disabled";
pub const HISTORY_UNAVAILABLE: &str = "Message history is temporarily unavailable";

const DEFAULT_HISTORY_LIMIT: usize = 200;
const MAX_HISTORY_LIMIT: usize = 1000;

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.service.cache();
    Json(json!({
        "status": "ok",
        "pairs": state.service.registry().pairs(),
        "resident_engines": cache.resident(),
        "cache_capacity": cache.capacity(),
        "workers": state.pool.worker_count(),
        "history": state.store.is_some(),
    }))
}

pub async fn translate(State(state): State<AppState>, body: Bytes) -> Response {
    let fields = match parse_fields(&body) {
        Ok(fields) => fields,
        Err(FieldsError::InvalidJson) => return bad_request(INVALID_JSON),
        Err(FieldsError::Missing) => return bad_request(MISSING_FIELDS),
    };

    let request = TranslateRequest::new(
        fields.message.as_str(),
        fields.source_lang.as_str(),
        fields.target_lang.as_str(),
    );
    // Dropped with the handler when the client goes away.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state.pool.submit(request, &cancel).await;
    into_response(reply_for(&result, &fields, TRANSLATION_FAILED))
}

fn into_response(reply: Reply) -> Response {
    match reply {
        Reply::Translated(body) => Json(body).into_response(),
        Reply::Failed(status, body) => (status, Json(body)).into_response(),
    }
}

/// Translate a chat message and store it in the conversation history.
pub async fn send_message(
    State(state): State<AppState>,
    caller: CallerId,
    body: Bytes,
) -> Response {
    let Some(store) = state.store.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody::new(HISTORY_DISABLED)),
        )
            .into_response();
    };

    let fields = match parse_fields(&body) {
        Ok(fields) => fields,
        Err(FieldsError::InvalidJson) => return bad_request(INVALID_JSON),
        Err(FieldsError::Missing) => return bad_request(MISSING_MESSAGE_FIELDS),
    };
    let Some(receiver_id) = fields.receiver_id.clone() else {
        return bad_request(MISSING_MESSAGE_FIELDS);
    };

    let request = TranslateRequest::new(
        fields.message.as_str(),
        fields.source_lang.as_str(),
        fields.target_lang.as_str(),
    );
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state.pool.submit(request, &cancel).await;
    match result {
        Ok(outcome) => match persist_message(&store, &caller, &receiver_id, &fields, &outcome) {
            Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
            Err(e) => {
                warn!(sender = %caller.0, error = %e, "message translated but not stored");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody::new(HISTORY_UNAVAILABLE)),
                )
                    .into_response()
            }
        },
        Err(e) => {
            warn!(sender = %caller.0, error = %e, "message not stored, translation not dispatched");
            into_response(reply_for(&Err(e), &fields, TRANSLATION_FAILED))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn conversation(
    State(state): State<AppState>,
    caller: CallerId,
    Path(friend_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(store) = state.store.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody::new(HISTORY_DISABLED)),
        )
            .into_response();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let user = caller.0;
    let rows =
        tokio::task::spawn_blocking(move || store.conversation(&user, &friend_id, limit)).await;
    match rows {
        Ok(Ok(messages)) => Json(messages).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "conversation query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new(format!("Error fetching messages: {e}"))),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "conversation query task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("Error fetching messages")),
            )
                .into_response()
        }
    }
}

pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let latency: HashMap<String, _> = state.metrics.summary();
    Json(json!({
        "latency": latency,
        "cache": state.service.cache().stats(),
    }))
}
