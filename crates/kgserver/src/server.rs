//
// server.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! The HTTP surface of the gateway: the kernel and kernelspec APIs, the
//! kernelspec resource files, and the channels WebSocket.

use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use kgshared::kernel_model::{ApiError, StartKernelRequest};
use regex::Regex;
use serde::Serialize;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::{
    channel_bridge::ChannelBridge, error::KSError, kernel_registry::KernelRegistry,
    kernel_spec::resource_path,
};

/// Serve the kernel API on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: std::net::TcpListener,
    registry: Arc<KernelRegistry>,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let make_service = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle_request(registry.clone(), request)
            }))
        }
    });

    hyper::Server::from_tcp(listener)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// The routes of the gateway's API
enum Route {
    Kernels,
    Kernel(String),
    Channels(String),
    KernelSpecs,
    KernelSpec(String),
    KernelSpecResource(String, String),
}

fn route(path: &str) -> Option<Route> {
    static KERNELS: OnceLock<Regex> = OnceLock::new();
    static KERNEL: OnceLock<Regex> = OnceLock::new();
    static CHANNELS: OnceLock<Regex> = OnceLock::new();
    static KERNEL_SPECS: OnceLock<Regex> = OnceLock::new();
    static KERNEL_SPEC: OnceLock<Regex> = OnceLock::new();
    static RESOURCE: OnceLock<Regex> = OnceLock::new();

    let kernels = KERNELS.get_or_init(|| Regex::new(r"^/api/kernels/?$").expect("Invalid regex"));
    let kernel =
        KERNEL.get_or_init(|| Regex::new(r"^/api/kernels/([^/?#]+)/?$").expect("Invalid regex"));
    let channels = CHANNELS
        .get_or_init(|| Regex::new(r"^/api/kernels/([^/?#]+)/channels/?$").expect("Invalid regex"));
    let kernel_specs =
        KERNEL_SPECS.get_or_init(|| Regex::new(r"^/api/kernelspecs/?$").expect("Invalid regex"));
    let kernel_spec = KERNEL_SPEC
        .get_or_init(|| Regex::new(r"^/api/kernelspecs/([^/?#]+)/?$").expect("Invalid regex"));
    let resource = RESOURCE
        .get_or_init(|| Regex::new(r"^/kernelspecs/([^/?#]+)/([^/?#]+)$").expect("Invalid regex"));

    let decode = |id: &str| {
        percent_encoding::percent_decode(id.as_bytes())
            .decode_utf8()
            .ok()
            .map(|id| id.to_string())
    };

    if kernels.is_match(path) {
        return Some(Route::Kernels);
    }
    if let Some(caps) = channels.captures(path) {
        return caps.get(1).and_then(|m| decode(m.as_str())).map(Route::Channels);
    }
    if let Some(caps) = kernel.captures(path) {
        return caps.get(1).and_then(|m| decode(m.as_str())).map(Route::Kernel);
    }
    if kernel_specs.is_match(path) {
        return Some(Route::KernelSpecs);
    }
    if let Some(caps) = kernel_spec.captures(path) {
        return caps.get(1).and_then(|m| decode(m.as_str())).map(Route::KernelSpec);
    }
    if let Some(caps) = resource.captures(path) {
        let name = caps.get(1).and_then(|m| decode(m.as_str()))?;
        let file = caps.get(2).and_then(|m| decode(m.as_str()))?;
        return Some(Route::KernelSpecResource(name, file));
    }
    None
}

/// Pull the `session_id` parameter out of a query string.
fn session_id_from_query(query: Option<&str>) -> String {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "session_id")
        .and_then(|(_, value)| {
            percent_encoding::percent_decode(value.as_bytes())
                .decode_utf8()
                .ok()
                .map(|value| value.to_string())
        })
        .unwrap_or_default()
}

async fn handle_request(
    registry: Arc<KernelRegistry>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    log::debug!("{} {}", method, path);

    let response = match (method, route(&path)) {
        (Method::GET, Some(Route::Kernels)) => json_response(StatusCode::OK, &registry.list().await),
        (Method::POST, Some(Route::Kernels)) => start_kernel(&registry, request).await,
        (Method::GET, Some(Route::Kernel(id))) => match registry.get(&id) {
            Ok(kernel) => json_response(StatusCode::OK, &kernel.to_model().await),
            Err(err) => error_response(err),
        },
        (Method::DELETE, Some(Route::Kernel(id))) => match registry.kill(&id).await {
            Ok(_) => empty_response(StatusCode::NO_CONTENT),
            Err(KSError::NotFound(id)) => error_response(KSError::NotFound(id)),
            Err(err) => {
                // The kernel is gone from the registry either way
                err.log();
                empty_response(StatusCode::NO_CONTENT)
            }
        },
        (Method::GET, Some(Route::Channels(id))) => channels_websocket_request(&registry, id, request).await,
        (Method::GET, Some(Route::KernelSpecs)) => json_response(StatusCode::OK, &registry.kernel_specs()),
        (Method::GET, Some(Route::KernelSpec(name))) => match registry.kernel_spec_model(&name) {
            Ok(model) => json_response(StatusCode::OK, &model),
            Err(err) => not_found(err),
        },
        (Method::GET, Some(Route::KernelSpecResource(name, file))) => {
            kernel_spec_resource(&registry, &name, &file).await
        }
        (_, Some(_)) => empty_response(StatusCode::METHOD_NOT_ALLOWED),
        (_, None) => empty_response(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

async fn start_kernel(registry: &KernelRegistry, request: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            return bad_request(format!("Failed to read request body: {}", e));
        }
    };
    let start: StartKernelRequest = match serde_json::from_slice(&body) {
        Ok(start) => start,
        Err(e) => {
            return bad_request(format!("Invalid request: {}", e));
        }
    };

    let kernel_id = match registry.start(&start.name).await {
        Ok(kernel_id) => kernel_id,
        Err(err) => return error_response(err),
    };
    match registry.get(&kernel_id) {
        Ok(kernel) => json_response(StatusCode::CREATED, &kernel.to_model().await),
        Err(err) => error_response(err),
    }
}

/// Serve a file from a kernelspec's directory, such as its logo.
async fn kernel_spec_resource(registry: &KernelRegistry, name: &str, file: &str) -> Response<Body> {
    let spec = match registry.kernel_spec(name) {
        Ok(spec) => spec,
        Err(err) => return not_found(err),
    };
    let path = match resource_path(&spec, file) {
        Some(path) => path,
        None => return empty_response(StatusCode::NOT_FOUND),
    };
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            log::error!("Failed to read kernelspec resource {:?}: {}", path, e);
            return empty_response(StatusCode::NOT_FOUND);
        }
    };

    let content_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        _ => "application/octet-stream",
    };
    let mut response = Response::new(Body::from(contents));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Attach to a kernel and upgrade the request to a WebSocket that carries
/// the kernel's channels.
async fn channels_websocket_request(
    registry: &KernelRegistry,
    kernel_id: String,
    mut request: Request<Body>,
) -> Response<Body> {
    let derived = match request.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return bad_request(String::from("Expected a WebSocket upgrade request")),
    };
    let accept = match HeaderValue::from_str(&derived) {
        Ok(accept) => accept,
        Err(e) => return bad_request(format!("Invalid WebSocket key: {}", e)),
    };
    let session_id = session_id_from_query(request.uri().query());

    let kernel = match registry.get(&kernel_id) {
        Ok(kernel) => kernel,
        Err(err) => return error_response(err),
    };
    let bridge = match ChannelBridge::attach(kernel, &session_id).await {
        Ok(bridge) => bridge,
        Err(err) => return error_response(err),
    };

    let version = request.version();
    tokio::task::spawn(async move {
        match hyper::upgrade::on(&mut request).await {
            Ok(upgraded) => {
                let stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                bridge.run(stream).await;
            }
            Err(e) => {
                log::error!("Failed to upgrade channel connection to websocket: {}", e);
                bridge.close().await;
            }
        }
    });

    let mut response = Response::new(Body::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.version_mut() = version;
    response
        .headers_mut()
        .append(CONNECTION, HeaderValue::from_static("Upgrade"));
    response
        .headers_mut()
        .append(UPGRADE, HeaderValue::from_static("websocket"));
    response.headers_mut().append(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            log::error!("Failed to serialize response: {}", e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn bad_request(message: String) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ApiError {
            code: String::from("bad_request"),
            message,
        },
    )
}

/// An error response for a lookup; a missing kernelspec is a 404 here, not a
/// bad request.
fn not_found(err: KSError) -> Response<Body> {
    match err {
        KSError::KernelSpecNotFound(_) => {
            err.log();
            json_response(StatusCode::NOT_FOUND, &err.to_json())
        }
        err => error_response(err),
    }
}

fn error_response(err: KSError) -> Response<Body> {
    let status = match err {
        KSError::NotFound(_) => StatusCode::NOT_FOUND,
        KSError::KernelSpecNotFound(_) => StatusCode::BAD_REQUEST,
        KSError::KernelNotReady(_, _) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err.log();
    json_response(status, &err.to_json())
}
