//! HTTP + WebSocket front end. Adapters parse input, hand requests to the
//! worker pool and turn outcomes into the JSON bodies clients already expect.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::history::{MessageRecord, MessageStore, StoreError};
use crate::metrics::MetricsRegistry;
use crate::scheduler::{DispatchError, TranslationPool};
use crate::translate::{TranslationOutcome, TranslationService, FALLBACK_MESSAGE};

/// Header carrying the caller's identity, set by the upstream auth proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<TranslationPool>,
    pub service: Arc<TranslationService>,
    pub store: Option<Arc<MessageStore>>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(http::health))
        .route("/api/translate/", post(http::translate))
        .route("/api/messages/", post(http::send_message))
        .route("/api/messages/:friend_id", get(http::conversation))
        .route("/api/messages/:friend_id/", get(http::conversation))
        .route("/api/metrics", get(http::metrics))
        .route("/ws/chat/", get(ws::chat_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity, trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = (StatusCode, Json<ErrorBody>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorBody::new("Authentication credentials were not provided.")),
                )
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranslatedBody {
    pub translated: String,
    pub original: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// Uniform failure shape: the fallback text plus the original message.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureBody {
    pub error: String,
    pub original: String,
    pub translated: String,
    pub reason: String,
}

/// Raw translation fields as they arrive. Empty strings count as missing.
#[derive(Debug, Default, Deserialize)]
struct RawFields {
    message: Option<String>,
    source_lang: Option<String>,
    target_lang: Option<String>,
    receiver_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TranslateFields {
    pub message: String,
    pub source_lang: String,
    pub target_lang: String,
    pub receiver_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldsError {
    InvalidJson,
    Missing,
}

pub(crate) fn parse_fields(raw: &[u8]) -> Result<TranslateFields, FieldsError> {
    let fields: RawFields = serde_json::from_slice(raw).map_err(|e| {
        debug!(error = %e, "rejecting malformed translation payload");
        FieldsError::InvalidJson
    })?;
    let present = |v: Option<String>| v.filter(|s| !s.is_empty());

    match (
        present(fields.message),
        present(fields.source_lang),
        present(fields.target_lang),
    ) {
        (Some(message), Some(source_lang), Some(target_lang)) => Ok(TranslateFields {
            message,
            source_lang,
            target_lang,
            receiver_id: present(fields.receiver_id),
        }),
        _ => Err(FieldsError::Missing),
    }
}

/// What an adapter sends back for one dispatched request.
pub(crate) enum Reply {
    Translated(TranslatedBody),
    Failed(StatusCode, FailureBody),
}

/// Map a pool result onto the response shapes. `error_text` differs per transport.
pub(crate) fn reply_for(
    result: &Result<TranslationOutcome, DispatchError>,
    fields: &TranslateFields,
    error_text: &str,
) -> Reply {
    let failed = |status: StatusCode, reason: &str| {
        Reply::Failed(
            status,
            FailureBody {
                error: error_text.to_string(),
                original: fields.message.clone(),
                translated: FALLBACK_MESSAGE.to_string(),
                reason: reason.to_string(),
            },
        )
    };

    match result {
        Ok(TranslationOutcome::Failed(reason)) => failed(StatusCode::BAD_REQUEST, reason.as_str()),
        Ok(outcome) => Reply::Translated(TranslatedBody {
            translated: outcome.text().to_string(),
            original: fields.message.clone(),
            source_lang: fields.source_lang.clone(),
            target_lang: fields.target_lang.clone(),
        }),
        Err(e) => failed(dispatch_status(e), dispatch_reason(e)),
    }
}

fn dispatch_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::Cancelled => StatusCode::BAD_REQUEST,
        DispatchError::Overloaded | DispatchError::Closed | DispatchError::WorkerLost => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn dispatch_reason(e: &DispatchError) -> &'static str {
    match e {
        DispatchError::Overloaded => "overloaded",
        DispatchError::Cancelled => "cancelled",
        DispatchError::Closed | DispatchError::WorkerLost => "unavailable",
    }
}

/// Queue a history record for a translated chat message.
pub(crate) fn persist_message(
    store: &MessageStore,
    sender: &CallerId,
    receiver_id: &str,
    fields: &TranslateFields,
    outcome: &TranslationOutcome,
) -> Result<MessageRecord, StoreError> {
    let pair = crate::translate::LanguagePair::new(
        fields.source_lang.as_str(),
        fields.target_lang.as_str(),
    );
    let record = MessageRecord::from_outcome(
        sender.0.clone(),
        receiver_id,
        fields.message.clone(),
        &pair,
        outcome,
    );
    store.record(record.clone())?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::FailureReason;

    fn fields() -> TranslateFields {
        TranslateFields {
            message: "hello".into(),
            source_lang: "en".into(),
            target_lang: "es".into(),
            receiver_id: None,
        }
    }

    #[test]
    fn parses_and_validates_fields() {
        assert_eq!(parse_fields(b"{not json"), Err(FieldsError::InvalidJson));
        assert_eq!(
            parse_fields(br#"{"message":"hi","source_lang":"en"}"#),
            Err(FieldsError::Missing)
        );
        assert_eq!(
            parse_fields(br#"{"message":"","source_lang":"en","target_lang":"es"}"#),
            Err(FieldsError::Missing)
        );
        let ok = parse_fields(
            br#"{"message":"hi","source_lang":"en","target_lang":"es","receiver_id":"7"}"#,
        )
        .unwrap();
        assert_eq!(ok.receiver_id.as_deref(), Some("7"));
    }

    #[test]
    fn failures_carry_fallback_and_reason() {
        let result = Ok(TranslationOutcome::Failed(FailureReason::UnsupportedPair));
        match reply_for(&result, &fields(), "failed") {
            Reply::Failed(status, body) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body.translated, FALLBACK_MESSAGE);
                assert_eq!(body.original, "hello");
                assert_eq!(body.reason, "unsupported_pair");
            }
            Reply::Translated(_) => panic!("expected failure"),
        }

        match reply_for(&Err(DispatchError::Overloaded), &fields(), "failed") {
            Reply::Failed(status, body) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body.reason, "overloaded");
            }
            Reply::Translated(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn unchanged_text_is_a_success_reply() {
        let result = Ok(TranslationOutcome::Unchanged("hello".into()));
        match reply_for(&result, &fields(), "failed") {
            Reply::Translated(body) => assert_eq!(body.translated, "hello"),
            Reply::Failed(..) => panic!("expected success"),
        }
    }
}
