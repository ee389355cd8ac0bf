//! HTTP surface of the answer stream.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{TryStreamExt, future};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::citations::{self, MESSAGE_INDEX_HEADER, SOURCES_HEADER};
use crate::codec;
use crate::error::Error;
use crate::events::{ChatRequest, ContractRequest, ObligationsResponse};
use crate::producer::{PreparedStream, StreamProducer};

#[derive(Clone)]
pub struct AppState {
    producer: Arc<StreamProducer>,
}

/// Error returned before a stream has started, rendered as `{"error": ...}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        } else {
            tracing::warn!(error = %err, "Request rejected");
        }
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::warn!(error = %rejection.body_text(), "Malformed request body");
        Self::bad_request(rejection.body_text())
    }
}

/// Build the application router around a producer
pub fn router(producer: StreamProducer) -> Router {
    let state = AppState {
        producer: Arc::new(producer),
    };

    // Browsers only read custom headers that are explicitly exposed
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(MESSAGE_INDEX_HEADER),
            HeaderName::from_static(SOURCES_HEADER),
        ]);

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/summary", post(summary))
        .route("/api/obligations", post(obligations))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until Ctrl-C
pub async fn serve(listener: TcpListener, producer: StreamProducer) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Docusuite server listening");
    axum::serve(listener, router(producer))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let prepared = state.producer.prepare(request).await?;
    stream_response(prepared)
}

async fn summary(
    State(state): State<AppState>,
    payload: Result<Json<ContractRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let prepared = state.producer.prepare_summary(&request.text).await?;
    stream_response(prepared)
}

async fn obligations(
    State(state): State<AppState>,
    payload: Result<Json<ContractRequest>, JsonRejection>,
) -> Result<Json<ObligationsResponse>, ApiError> {
    let Json(request) = payload?;
    let obligations = state.producer.extract_obligations(&request.text).await?;
    Ok(Json(ObligationsResponse { obligations }))
}

/// Turn a prepared exchange into an SSE response.
///
/// Metadata headers are fixed here, before the first frame. A frame error
/// after this point aborts the body, so the client sees no terminal frame.
fn stream_response(prepared: PreparedStream) -> Result<Response, ApiError> {
    let PreparedStream {
        ordinal,
        citations,
        frames,
    } = prepared;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no");

    if let Some(ordinal) = ordinal {
        builder = builder
            .header(MESSAGE_INDEX_HEADER, ordinal.to_string())
            .header(SOURCES_HEADER, citations::encode_header(&citations)?);
    }

    let body = frames
        .and_then(|frame| future::ready(codec::encode(&frame).map_err(Error::from)))
        .inspect_err(|e| tracing::error!(error = %e, "Answer stream aborted"));

    builder
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(format!("Failed to build streaming response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::decode_header;
    use crate::providers::RetrievedDocument;
    use crate::providers::scripted::{ScriptStep, ScriptedGeneration, StaticEmbedding, StaticSearch};
    use axum::http::Request;
    use tower::ServiceExt;

    fn producer_with(generator: Arc<ScriptedGeneration>, dims: usize) -> StreamProducer {
        let docs = vec![RetrievedDocument {
            text: "Either party may terminate with three months notice in writing.".to_string(),
            metadata: json!({ "loc": { "pageNumber": 4 } }),
        }];
        StreamProducer::new(
            Arc::new(StaticEmbedding::new(dims)),
            Arc::new(StaticSearch::new(docs)),
            generator,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_streams_frames_with_headers() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::fragments(["Hel", "lo"])),
            768,
        ));

        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({
                    "messages": [
                        { "role": "user", "content": "Can I cancel?" },
                        { "role": "assistant", "content": "Which contract?" },
                        { "role": "user", "content": "The lease." }
                    ],
                    "chatId": "doc-1"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[MESSAGE_INDEX_HEADER], "3");
        let sources = decode_header(headers[SOURCES_HEADER].to_str().unwrap()).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].page_number(), Some(&json!(4)));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "data: {\"text\":\"Hel\",\"done\":false}\n\ndata: {\"text\":\"lo\",\"done\":false}\n\ndata: {\"done\":true}\n\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_embedding_is_json_error() {
        let generator = Arc::new(ScriptedGeneration::fragments(["never"]));
        let app = router(producer_with(generator.clone(), 10));

        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({ "messages": [{ "role": "user", "content": "q" }], "chatId": "d" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(MESSAGE_INDEX_HEADER).is_none());
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("768"));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_messages_is_bad_request() {
        let app = router(producer_with(Arc::new(ScriptedGeneration::fragments(["x"])), 768));
        let response = app
            .oneshot(post_json("/api/chat", json!({ "messages": [], "chatId": "d" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "No messages provided.");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = router(producer_with(Arc::new(ScriptedGeneration::fragments(["x"])), 768));
        let request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_generation_rejected_is_bad_gateway() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::rejecting("quota exceeded")),
            768,
        ));
        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({ "messages": [{ "role": "user", "content": "q" }], "chatId": "d" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_midstream_failure_aborts_body() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::new(vec![
                ScriptStep::Text("partial".into()),
                ScriptStep::Error("upstream closed".into()),
            ])),
            768,
        ));
        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({ "messages": [{ "role": "user", "content": "q" }], "chatId": "d" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_summary_streams_without_citation_headers() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::fragments(["Parties: A and B."])),
            768,
        ));
        let response = app
            .oneshot(post_json("/api/summary", json!({ "text": "This agreement..." })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SOURCES_HEADER).is_none());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.ends_with(b"data: {\"done\":true}\n\n"));
    }

    #[tokio::test]
    async fn test_obligations_returns_parsed_list() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::fragments([
                "Here you go:\n```json\n",
                "[{\"entityName\":\"Landlord\",\"obligationType\":\"Repairs\",\"risk\":\"Rent reduction\"}]",
                "\n```",
            ])),
            768,
        ));
        let response = app
            .oneshot(post_json("/api/obligations", json!({ "text": "The landlord repairs..." })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["obligations"][0]["entityName"], "Landlord");
        assert_eq!(body["obligations"][0]["risk"], "Rent reduction");
        assert_eq!(body["obligations"][0]["penalties"], "");
    }

    #[tokio::test]
    async fn test_obligations_without_block_is_bad_gateway() {
        let app = router(producer_with(
            Arc::new(ScriptedGeneration::fragments(["No obligations found."])),
            768,
        ));
        let response = app
            .oneshot(post_json("/api/obligations", json!({ "text": "Some contract" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("No JSON block"));
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(producer_with(Arc::new(ScriptedGeneration::default()), 768));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }
}
