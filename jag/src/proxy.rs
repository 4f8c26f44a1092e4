//! HTTP + UDP front for a serial device.
//!
//! Exposes the same HTTP surface as a network device and announces itself
//! on the discovery port, so the rest of the tool sees an ordinary network
//! device with `proxied` set.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use jag_proto::{Announcement, CodeKind, upload};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::device::{Device, PushOptions};
use crate::discovery::Announcer;
use crate::http::{
    CONTAINER_NAME_HEADER, CONTAINER_TIMEOUT_HEADER, CRC32_HEADER, DEVICE_ID_HEADER,
    DISABLED_HEADER, SDK_VERSION_HEADER,
};
use crate::identity::{DeviceIdentity, Transport};
use crate::{Error, Result};

/// Largest accepted request body (firmware images included).
const MAX_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct ProxyState {
    device: Device,
    /// Identity as announced: network transport, proxied.
    identity: DeviceIdentity,
}

type Shared = Arc<ProxyState>;

/// Serves `device` on `listener` until `shutdown` fires.
///
/// With `discovery_port` set, the proxy also broadcasts its identity there.
pub async fn serve(
    device: Device,
    listener: TcpListener,
    discovery_port: Option<u16>,
    shutdown: Cancel,
) -> Result<()> {
    let local = listener.local_addr()?;
    let identity = announced_identity(device.identity(), local).await;
    let announcer = discovery_port
        .map(|port| Announcer::spawn(&identity, port))
        .transpose()?;
    info!(address = %identity.address, name = %identity.name, "proxy listening");

    let app = router(device, identity);
    let mut stop = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    if let Some(announcer) = announcer {
        announcer.stop().await;
    }
    info!("proxy stopped");
    Ok(())
}

/// Builds the HTTP routes over `device`.
pub fn router(device: Device, identity: DeviceIdentity) -> Router {
    Router::new()
        .route("/identify", get(identify))
        .route("/ping", get(ping))
        .route("/list", get(list))
        .route("/uninstall", put(uninstall))
        .route("/firmware", put(firmware))
        .route("/install", put(install))
        .route("/run", put(run))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .layer(middleware::from_fn(log_request))
        .with_state(Arc::new(ProxyState { device, identity }))
}

/// The identity other tools see: network transport at the proxy address.
async fn announced_identity(device: &DeviceIdentity, local: SocketAddr) -> DeviceIdentity {
    let ip = if local.ip().is_unspecified() {
        outbound_ip().await
    } else {
        local.ip()
    };
    DeviceIdentity {
        address: format!("http://{}", SocketAddr::new(ip, local.port())),
        transport: Transport::Network,
        proxied: true,
        ..device.clone()
    }
}

/// Address of the interface used for outgoing traffic. No packet is sent.
async fn outbound_ip() -> IpAddr {
    let check = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1)).await?;
        socket.local_addr()
    };
    match check.await {
        Ok(addr) => addr.ip(),
        Err(e) => {
            warn!(error = %e, "cannot determine local address; announcing loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;
    debug!(%method, path, status = response.status().as_u16(), "proxy request");
    response
}

/// Error body with the status a network device would use.
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::DeviceIdMismatch { .. } => StatusCode::FORBIDDEN,
            Error::SdkVersionMismatch { .. } => StatusCode::NOT_ACCEPTABLE,
            Error::Timeout(_) | Error::SyncFailed => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

/// Rejects requests addressed to another device.
fn check_device_id(state: &ProxyState, headers: &HeaderMap) -> ApiResult<()> {
    match header_str(headers, DEVICE_ID_HEADER) {
        Some(id) if id != state.identity.id => Err(Error::DeviceIdMismatch {
            expected: state.identity.id.clone(),
        }
        .into()),
        _ => Ok(()),
    }
}

async fn identify(State(state): State<Shared>) -> ApiResult<Response> {
    let body = Announcement::identify(state.identity.to_payload())
        .to_json()
        .map_err(Error::from)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn ping(State(state): State<Shared>) -> StatusCode {
    if state.device.ping().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn list(State(state): State<Shared>) -> ApiResult<Json<BTreeMap<String, String>>> {
    Ok(Json(state.device.container_list().await?))
}

async fn uninstall(State(state): State<Shared>, headers: HeaderMap) -> ApiResult<StatusCode> {
    check_device_id(&state, &headers)?;
    let name = header_str(&headers, CONTAINER_NAME_HEADER)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| bad_request(format!("missing {CONTAINER_NAME_HEADER}")))?;
    state.device.container_uninstall(name).await?;
    Ok(StatusCode::OK)
}

async fn firmware(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    check_device_id(&state, &headers)?;
    state.device.update_firmware(&body).await?;
    Ok(StatusCode::OK)
}

async fn install(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    push(&state, &headers, &body, CodeKind::Install).await
}

async fn run(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    push(&state, &headers, &body, CodeKind::Run).await
}

async fn push(
    state: &ProxyState,
    headers: &HeaderMap,
    image: &[u8],
    kind: CodeKind,
) -> ApiResult<StatusCode> {
    check_device_id(state, headers)?;
    let sdk_version = match header_str(headers, SDK_VERSION_HEADER) {
        Some(sdk) if sdk != state.identity.sdk_version => {
            return Err(Error::SdkVersionMismatch {
                device: state.identity.sdk_version.clone(),
                image: sdk.to_owned(),
            }
            .into());
        }
        Some(sdk) => sdk.to_owned(),
        None => state.identity.sdk_version.clone(),
    };
    if let Some(declared) = header_str(headers, CRC32_HEADER) {
        let declared: u32 = declared
            .trim()
            .parse()
            .map_err(|_| bad_request(format!("invalid {CRC32_HEADER}")))?;
        let actual = upload::crc32(image);
        if declared != actual {
            return Err(bad_request(format!(
                "CRC32 mismatch: header {declared}, body {actual}"
            )));
        }
    }

    let timeout = match header_str(headers, CONTAINER_TIMEOUT_HEADER) {
        Some(v) => Some(Duration::from_secs(
            v.trim()
                .parse()
                .map_err(|_| bad_request(format!("invalid {CONTAINER_TIMEOUT_HEADER}")))?,
        )),
        None => None,
    };
    let options = PushOptions {
        sdk_version,
        name: header_str(headers, CONTAINER_NAME_HEADER).map(str::to_owned),
        disabled: header_str(headers, DISABLED_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        timeout,
        ..PushOptions::default()
    };
    if kind == CodeKind::Install && options.name.as_deref().is_none_or(str::is_empty) {
        return Err(bad_request(format!("missing {CONTAINER_NAME_HEADER}")));
    }
    state.device.send_code(kind, image, &options).await?;
    Ok(StatusCode::OK)
}
