//! Chat WebSocket: one JSON request per text frame, answered out of order as
//! translations finish. Closing the socket abandons everything still in flight.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    parse_fields, persist_message, reply_for, AppState, CallerId, ErrorBody, FieldsError, Reply,
};
use crate::scheduler::DispatchError;
use crate::translate::TranslateRequest;

pub const MISSING_FIELDS: &str =
    "Missing required fields: 'message', 'source_lang', 'target_lang'.";
pub const INVALID_JSON: &str = "Invalid JSON format.";
pub const TRANSLATION_FAILED: &str = "Translation failed or unsupported language pair.";

const OUTBOUND_BUFFER: usize = 32;

pub async fn chat_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: Option<CallerId>,
) -> Response {
    ws.on_upgrade(move |socket| connection(socket, state, caller))
}

async fn connection(socket: WebSocket, state: AppState, caller: Option<CallerId>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(%connection_id, user = caller.as_ref().map(|c| c.0.as_str()), "chat socket opened");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let root = CancellationToken::new();

    // Single writer; frame handlers only talk to the channel.
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let state = state.clone();
                let caller = caller.clone();
                let out = out_tx.clone();
                let cancel = root.child_token();
                tokio::spawn(async move {
                    let reply = handle_frame(&state, caller.as_ref(), &text, &cancel).await;
                    if let Some(reply) = reply {
                        let _ = out.send(reply).await;
                    }
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%connection_id, error = %e, "chat socket read error");
                break;
            }
        }
    }

    root.cancel();
    drop(out_tx);
    let _ = writer.await;
    info!(%connection_id, "chat socket closed");
}

/// Handle one inbound frame. `None` means nothing should be sent back.
async fn handle_frame(
    state: &AppState,
    caller: Option<&CallerId>,
    text: &str,
    cancel: &CancellationToken,
) -> Option<String> {
    let fields = match parse_fields(text.as_bytes()) {
        Ok(fields) => fields,
        Err(FieldsError::InvalidJson) => return to_text(&ErrorBody::new(INVALID_JSON)),
        Err(FieldsError::Missing) => return to_text(&ErrorBody::new(MISSING_FIELDS)),
    };

    let request = TranslateRequest::new(
        fields.message.as_str(),
        fields.source_lang.as_str(),
        fields.target_lang.as_str(),
    );
    let result = state.pool.submit(request, cancel).await;
    if matches!(result, Err(DispatchError::Cancelled)) {
        return None;
    }

    if let (Ok(outcome), Some(store), Some(sender), Some(receiver)) = (
        &result,
        state.store.as_deref(),
        caller,
        fields.receiver_id.as_deref(),
    ) {
        if let Err(e) = persist_message(store, sender, receiver, &fields, outcome) {
            warn!(sender = %sender.0, error = %e, "chat message not stored");
        }
    }

    match reply_for(&result, &fields, TRANSLATION_FAILED) {
        Reply::Translated(body) => to_text(&body),
        Reply::Failed(_, body) => to_text(&body),
    }
}

fn to_text<T: Serialize>(body: &T) -> Option<String> {
    match serde_json::to_string(body) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "failed to encode chat reply");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::translate::FALLBACK_MESSAGE;
    use serde_json::Value;

    fn state() -> AppState {
        let config = AppConfig::from_lookup(|key| match key {
            "MODEL_DIR" => Some("/nonexistent/models".to_string()),
            "DATABASE_PATH" => Some(String::new()),
            "TRANSLATOR_WORKERS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        crate::build_state(&config).unwrap()
    }

    async fn reply(state: &AppState, frame: &str) -> Value {
        let text = handle_frame(state, None, frame, &CancellationToken::new())
            .await
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn malformed_frames_get_error_replies() {
        let state = state();
        assert_eq!(reply(&state, "not json").await["error"], INVALID_JSON);
        assert_eq!(
            reply(&state, r#"{"message":"hi","target_lang":"es"}"#).await["error"],
            MISSING_FIELDS
        );
    }

    #[tokio::test]
    async fn same_language_frame_is_echoed() {
        let state = state();
        let body = reply(&state, r#"{"message":"hi","source_lang":"en","target_lang":"en"}"#).await;
        assert_eq!(body["translated"], "hi");
        assert_eq!(body["original"], "hi");
    }

    #[tokio::test]
    async fn failed_translation_carries_original() {
        let state = state();
        let body = reply(&state, r#"{"message":"hi","source_lang":"en","target_lang":"es"}"#).await;
        assert_eq!(body["error"], TRANSLATION_FAILED);
        assert_eq!(body["original"], "hi");
        assert_eq!(body["translated"], FALLBACK_MESSAGE);
        assert_eq!(body["reason"], "engine_unavailable");
    }

    #[tokio::test]
    async fn cancelled_frame_sends_nothing() {
        let state = state();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let frame = r#"{"message":"hi","source_lang":"en","target_lang":"es"}"#;
        assert!(handle_frame(&state, None, frame, &cancel).await.is_none());
    }
}
