use crate::config::Config;
use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use mirrorio_core::{BlobRef, MirrorError, OpContext, Result, SizedBlobRef, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub root: Arc<dyn Storage>,
    pub ctx: OpContext,
}

impl ServerState {
    /// Derive the context for one inbound request.
    fn request_ctx(&self) -> OpContext {
        self.ctx.child()
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }
}

fn error_response(err: &MirrorError) -> Response {
    let status = match err {
        MirrorError::NotFound(_) => StatusCode::NOT_FOUND,
        MirrorError::InvalidRef(_) | MirrorError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, ApiResponse::<()>::err(err.to_string())).into_response()
}

#[derive(Debug, Deserialize)]
struct StatRequest {
    blobs: Vec<BlobRef>,
    #[serde(default)]
    wait_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    blobs: Vec<BlobRef>,
}

#[derive(Debug, Deserialize)]
struct EnumerateQuery {
    #[serde(default)]
    after: Option<String>,
    #[serde(default = "default_enumerate_limit")]
    limit: usize,
    #[serde(default)]
    wait_secs: Option<u64>,
}

fn default_enumerate_limit() -> usize {
    1000
}

pub async fn run_server(config: Config, root: Arc<dyn Storage>) -> Result<()> {
    let state = Arc::new(ServerState {
        root,
        ctx: OpContext::new(),
    });

    let app = Router::new()
        .route("/blob/:blobref", get(get_blob).put(put_blob))
        .route("/stat", post(stat_blobs))
        .route("/remove", post(remove_blobs))
        .route("/enumerate", get(enumerate_blobs))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn put_blob(
    State(state): State<Arc<ServerState>>,
    Path(blobref): Path<String>,
    body: Bytes,
) -> Response {
    let blob = match BlobRef::parse(&blobref) {
        Ok(blob) => blob,
        Err(err) => return error_response(&err),
    };

    // Verify the upload before fanning it out: the body must hash to the
    // reference it claims.
    if BlobRef::from_bytes(&body) != blob {
        return (
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::err("blob content does not match its reference"),
        )
            .into_response();
    }

    let ctx = state.request_ctx();
    let mut source: &[u8] = &body;
    match state.root.receive_blob(&ctx, &blob, &mut source).await {
        Ok(sb) => ApiResponse::ok(sb).into_response(),
        Err(err) => {
            tracing::warn!("put {} failed: {}", blob, err);
            error_response(&err)
        }
    }
}

async fn get_blob(State(state): State<Arc<ServerState>>, Path(blobref): Path<String>) -> Response {
    let blob = match BlobRef::parse(&blobref) {
        Ok(blob) => blob,
        Err(err) => return error_response(&err),
    };

    let ctx = state.request_ctx();
    let (mut reader, size) = match state.root.fetch_streaming(&ctx, &blob).await {
        Ok(found) => found,
        Err(err) => return error_response(&err),
    };

    let mut data = Vec::with_capacity(size as usize);
    if let Err(err) = reader.read_to_end(&mut data).await {
        return error_response(&MirrorError::Io(err));
    }
    (StatusCode::OK, Bytes::from(data)).into_response()
}

async fn stat_blobs(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StatRequest>,
) -> Response {
    let ctx = state.request_ctx();
    let wait = request.wait_secs.map(Duration::from_secs);

    let (tx, mut rx) = mpsc::channel(8);
    let root = Arc::clone(&state.root);
    let blobs = request.blobs.clone();
    let worker =
        tokio::spawn(async move { root.stat_blobs(&ctx, tx, &blobs, wait).await });

    let mut found: Vec<SizedBlobRef> = Vec::new();
    while let Some(sb) = rx.recv().await {
        found.push(sb);
    }

    match worker.await {
        Ok(Ok(())) => ApiResponse::ok(found).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => error_response(&MirrorError::Internal(err.to_string())),
    }
}

async fn remove_blobs(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RemoveRequest>,
) -> Response {
    let ctx = state.request_ctx();
    match state.root.remove_blobs(&ctx, &request.blobs).await {
        Ok(()) => ApiResponse::ok(()).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn enumerate_blobs(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EnumerateQuery>,
) -> Response {
    let after = match &query.after {
        Some(raw) => match BlobRef::parse(raw) {
            Ok(blob) => Some(blob),
            Err(err) => return error_response(&err),
        },
        None => None,
    };

    let ctx = state.request_ctx();
    let wait = query.wait_secs.map(Duration::from_secs);
    let limit = query.limit;

    let (tx, mut rx) = mpsc::channel(8);
    let root = Arc::clone(&state.root);
    let worker = tokio::spawn(async move {
        root.enumerate_blobs(&ctx, tx, after.as_ref(), limit, wait)
            .await
    });

    let mut listed: Vec<SizedBlobRef> = Vec::new();
    while let Some(sb) = rx.recv().await {
        listed.push(sb);
    }

    match worker.await {
        Ok(Ok(())) => ApiResponse::ok(listed).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => error_response(&MirrorError::Internal(err.to_string())),
    }
}
