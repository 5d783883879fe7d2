//! Reverse proxy onto the current API's tenant namespace.
//!
//! `http://localhost:8080/api/v1/labels` is forwarded to
//! `https://<api>/api/metrics/v1/<tenant>/api/v1/labels`, so UIs that expect an
//! un-prefixed API work against a tenant-scoped one. Context and credentials
//! are resolved once, when the server is built; the token is refreshed on
//! demand by the client's token source.

use std::borrow::Cow;
use std::future::{Future, IntoFuture};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use axum::Router;
use obsctl_context::{ApiClient, ContextStore, CredentialProvider};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Resource;
use crate::error::{ProxyError, Result};

/// Tells downstream UIs which prefix their links are served under.
pub const PREFIX_HEADER: &str = "x-forwarded-prefix";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Headers that only apply to a single connection and are never forwarded.
static HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// `api/<resource>/v1/<tenant>`, the namespace of a tenant on the remote API.
pub fn tenant_prefix(resource: Resource, tenant: &str) -> String {
    format!("api/{}/v1/{}", resource, tenant)
}

/// A joined request path. `raw_path` carries the escaped form and is only set
/// when one of the inputs used percent-escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedPath {
    pub path: String,
    pub raw_path: Option<String>,
}

impl JoinedPath {
    /// The form to put on the wire.
    pub fn escaped(&self) -> &str {
        self.raw_path.as_deref().unwrap_or(&self.path)
    }
}

/// Join the base URL's path, `prefix` and the inbound path without doubling
/// slashes, keeping decoded and escaped forms in step.
pub fn join_url_path(base: &Url, inbound: &str, prefix: &str) -> JoinedPath {
    let base_raw = base.path();
    let base_path = percent_decode(base_raw);
    let inbound_path = percent_decode(inbound);

    let path = single_joining_slash(&clean_join(&base_path, prefix), &inbound_path);
    let raw_path = (base_path != base_raw || inbound_path != inbound)
        .then(|| single_joining_slash(&clean_join(base_raw, prefix), inbound));

    JoinedPath { path, raw_path }
}

fn percent_decode(path: &str) -> Cow<'_, str> {
    urlencoding::decode(path).unwrap_or(Cow::Borrowed(path))
}

/// Lexical join of two slash-separated paths, rooted, without empty, `.` or
/// `..` segments.
fn clean_join(base: &str, segment: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in base.split('/').chain(segment.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether any segment of `path` is `.` or `..` once percent-decoded.
fn has_dot_segment(path: &str) -> bool {
    percent_decode(path)
        .split(['/', '\\'])
        .any(|segment| segment == "." || segment == "..")
}

fn single_joining_slash(a: &str, b: &str) -> String {
    if b.starts_with('/') {
        format!("{}{}", a, b)
    } else {
        format!("{}/{}", a, b)
    }
}

/// Where inbound requests are sent.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    base: Url,
    prefix: String,
}

impl ProxyTarget {
    pub fn new(base: Url, resource: Resource, tenant: &str) -> Self {
        Self {
            base,
            prefix: tenant_prefix(resource, tenant),
        }
    }

    /// Destination URL for an inbound path and query. Paths with `.` or `..`
    /// segments, escaped or not, are refused so the result always stays below
    /// the tenant prefix.
    pub fn rewrite(&self, path: &str, query: Option<&str>) -> Result<Url> {
        if has_dot_segment(path) {
            return Err(ProxyError::InvalidPath(path.to_string()));
        }

        let joined = join_url_path(&self.base, path, &self.prefix);
        let mut url = self.base.clone();
        url.set_path(joined.escaped());
        url.set_query(query);
        Ok(url)
    }
}

/// Proxy settings taken from the command line.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub resource: Resource,
    pub listen_addr: SocketAddr,
    pub timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Clone)]
struct ProxyState {
    target: Arc<ProxyTarget>,
    client: ApiClient,
}

/// A proxy bound to the current context but not yet listening.
pub struct ProxyServer {
    settings: ProxySettings,
    router: Router,
}

impl ProxyServer {
    /// Resolve the current context and its credentials. Fails before any socket
    /// is opened if the API URL is not absolute.
    pub async fn new(
        store: &ContextStore,
        provider: &CredentialProvider,
        settings: ProxySettings,
    ) -> Result<Self> {
        let current = store.current()?;
        let base = current.api.parsed_url()?;

        let bound = provider.bind_current(store).await?;
        let target = ProxyTarget::new(base, settings.resource, &bound.context.tenant.tenant);

        // Redirects go back to the caller rather than being followed here.
        let transport = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(settings.timeout)
            .build()
            .map_err(obsctl_context::ContextError::from)?;
        let client = bound.client.with_transport(transport);

        info!(
            context = %bound.context.name,
            resource = %settings.resource,
            upstream = %target.base,
            "proxy configured"
        );

        let state = ProxyState {
            target: Arc::new(target),
            client,
        };
        let router = Router::new()
            .fallback(forward_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        Ok(Self { settings, router })
    }

    /// Bind the listening socket. No retry on failure.
    pub async fn bind(self) -> Result<ListeningProxy> {
        let addr = self.settings.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        info!("Listening on http://{}", local_addr);
        Ok(ListeningProxy {
            listener,
            local_addr,
            router: self.router,
            shutdown_grace: self.settings.shutdown_grace,
        })
    }
}

/// A proxy with its socket open.
pub struct ListeningProxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    shutdown_grace: Duration,
}

impl ListeningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves, then give in-flight requests up to the
    /// grace period to finish.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ListeningProxy {
            listener,
            router,
            shutdown_grace,
            ..
        } = self;

        let stop = Arc::new(Notify::new());
        let stop_signal = {
            let stop = stop.clone();
            async move { stop.notified().await }
        };

        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop_signal)
        .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => return result.map_err(ProxyError::Serve),
            () = shutdown => {
                info!("Shutting down proxy, waiting up to {:?} for in-flight requests", shutdown_grace);
                stop.notify_one();
            }
        }

        match tokio::time::timeout(shutdown_grace, server).await {
            Ok(result) => result.map_err(ProxyError::Serve),
            Err(_) => {
                warn!("In-flight requests still running after {:?}, aborting", shutdown_grace);
                Ok(())
            }
        }
    }
}

/// Forward any request to the rewritten destination.
async fn forward_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> std::result::Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();
    let destination = state.target.rewrite(parts.uri.path(), parts.uri.query())?;
    debug!(method = %parts.method, from = %parts.uri, to = %destination, "proxying request");

    let declared_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| ProxyError::Internal(format!("Failed to read body: {}", e)))?;

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    headers.remove(header::HOST);
    append_forwarded_for(&mut headers, peer.ip());
    headers.append(PREFIX_HEADER, HeaderValue::from_static("/"));

    let mut request = state
        .client
        .request(parts.method, destination)
        .headers(headers);
    // HTTP/2 requests may carry a body without announcing its length.
    if declared_body || !body.is_empty() {
        request = request.body(body);
    }

    let upstream = state.client.send(request).await?;
    debug!(status = %upstream.status(), "upstream responded");

    let mut response = Response::builder().status(upstream.status());
    if let Some(response_headers) = response.headers_mut() {
        let mut upstream_headers = upstream.headers().clone();
        remove_hop_headers(&mut upstream_headers);
        response_headers.extend(upstream_headers);
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Internal(format!("Failed to build response: {}", e)))
}

/// Drop hop-by-hop headers, including any named in `Connection`.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(FORWARDED_FOR_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(FORWARDED_FOR_HEADER, value);
    }
}
