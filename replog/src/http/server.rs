//! HTTP routers and accept loops for the master and the secondary.
//!
//! The routers are plain async functions over any request body, so they can
//! be driven directly in tests; [`serve_master`] and [`serve_secondary`] wrap
//! them in a hyper `http1` connection per accepted socket.

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::parse_range_query;
use crate::error::{MasterError, SecondaryError};
use crate::master::Master;
use crate::secondary::Secondary;
use crate::secondary::storage::LogStorage;
use crate::time::TimeProvider;
use crate::types::{LogEntry, SubmitRequest};

/// Response type produced by the routers.
pub type HttpResponse = Response<Full<Bytes>>;

/// Route one request to the master.
pub async fn master_router<P, B>(master: &Master<P>, req: Request<B>) -> HttpResponse
where
    P: TimeProvider,
    B: Body,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    match (&parts.method, parts.uri.path()) {
        (&Method::POST, "/messages") => {
            let request: SubmitRequest = match read_json(body).await {
                Ok(request) => request,
                Err(resp) => return resp,
            };
            match master.submit(request).await {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => master_error(e),
            }
        }
        (&Method::GET, "/messages") => json_response(StatusCode::OK, &master.entries()),
        (&Method::GET, "/entries") => match parse_range_query(parts.uri.query()) {
            Ok(query) => json_response(StatusCode::OK, &master.entries_from(query)),
            Err(reason) => error_response(StatusCode::BAD_REQUEST, reason),
        },
        (&Method::GET, "/replicas") => json_response(StatusCode::OK, &master.replica_status()),
        (_, "/messages" | "/entries" | "/replicas") => method_not_allowed(),
        _ => not_found(),
    }
}

/// Route one request to a secondary.
pub async fn secondary_router<S, P, B>(secondary: &Secondary<S, P>, req: Request<B>) -> HttpResponse
where
    S: LogStorage,
    P: TimeProvider,
    B: Body,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    match (&parts.method, parts.uri.path()) {
        (&Method::POST, "/replicate") => {
            let entry: LogEntry = match read_json(body).await {
                Ok(entry) => entry,
                Err(resp) => return resp,
            };
            match secondary.replicate(entry).await {
                Ok(ack) => json_response(StatusCode::OK, &ack),
                Err(e) => secondary_error(e),
            }
        }
        (&Method::GET, "/messages") => match secondary.messages() {
            Ok(entries) => json_response(StatusCode::OK, &entries),
            Err(e) => secondary_error(e),
        },
        (&Method::GET, "/status") => match secondary.status() {
            Ok(status) => json_response(StatusCode::OK, &status),
            Err(e) => secondary_error(e),
        },
        (_, "/replicate" | "/messages" | "/status") => method_not_allowed(),
        _ => not_found(),
    }
}

/// Accept connections on `listener` and serve the master API until the
/// listener fails.
pub async fn serve_master<P: TimeProvider>(
    listener: TcpListener,
    master: Arc<Master<P>>,
) -> std::io::Result<()> {
    serve(listener, "master", move |req| {
        let master = Arc::clone(&master);
        async move { master_router(&master, req).await }
    })
    .await
}

/// Accept connections on `listener` and serve the secondary API until the
/// listener fails.
pub async fn serve_secondary<S: LogStorage, P: TimeProvider>(
    listener: TcpListener,
    secondary: Arc<Secondary<S, P>>,
) -> std::io::Result<()> {
    serve(listener, "secondary", move |req| {
        let secondary = Arc::clone(&secondary);
        async move { secondary_router(&secondary, req).await }
    })
    .await
}

async fn serve<H, F>(listener: TcpListener, role: &'static str, handler: H) -> std::io::Result<()>
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = HttpResponse> + Send + 'static,
{
    info!(role, addr = %listener.local_addr()?, "http server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(role, %peer, "connection accepted");
        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                warn!(role, %peer, error = %e, "connection error");
            }
        });
    }
}

async fn read_json<T, B>(body: B) -> Result<T, HttpResponse>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Display,
{
    let bytes = body
        .collect()
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("unreadable body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid json: {e}")))
}

fn master_error(e: MasterError) -> HttpResponse {
    match &e {
        MasterError::Validation(_) => error_response(StatusCode::BAD_REQUEST, &e),
        MasterError::QuorumTimeout {
            seq,
            required,
            acked_by,
        } => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "error": e.to_string(),
                "seq": seq,
                "required": required,
                "acked_by": acked_by,
            }),
        ),
    }
}

fn secondary_error(e: SecondaryError) -> HttpResponse {
    let status = match &e {
        SecondaryError::Validation(_) => StatusCode::BAD_REQUEST,
        SecondaryError::Conflict { .. } => StatusCode::CONFLICT,
        SecondaryError::Halted(_) => StatusCode::SERVICE_UNAVAILABLE,
        SecondaryError::Storage(_)
        | SecondaryError::InjectedFailure { .. }
        | SecondaryError::CatchUp(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e)
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            let mut resp = Response::new(Full::new(Bytes::from(e.to_string())));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

fn error_response(status: StatusCode, error: impl Display) -> HttpResponse {
    json_response(status, &json!({ "error": error.to_string() }))
}

fn not_found() -> HttpResponse {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn method_not_allowed() -> HttpResponse {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}
