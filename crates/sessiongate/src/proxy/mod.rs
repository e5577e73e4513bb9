use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::HOST;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::v1::SessionOwnerType;
use crate::registry::{SessionRegistry, SessionUpstream};

pub mod conntrack;
pub use conntrack::ConnectionTracker;

pub mod metrics;
pub use metrics::HttpMetrics;

/// Claim header injected by the mesh after external authorization.
pub const CLAIM_HEADER_UPN: &str = "x-jwt-claim-upn";
pub const CLAIM_HEADER_OID: &str = "x-jwt-claim-oid";

const ROUTE_KAS: &str = "kas";
const ROUTE_UNKNOWN: &str = "unknown";

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// First path segment the proxy serves under; deployment-configurable.
    pub prefix: String,
    /// How long shutdown waits before severing in-flight connections.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            prefix: "sg".to_string(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Serves `/{prefix}/{sessionName}/kas/*`: looks the session up in the
/// registry, enforces the owner's claim, and forwards to the hosted API
/// server over the session's mTLS config, carrying SPDY/WebSocket upgrades.
pub struct SessionProxy {
    registry: Arc<SessionRegistry>,
    config: ProxyConfig,
    metrics: HttpMetrics,
    tracker: Arc<ConnectionTracker>,
}

impl SessionProxy {
    pub fn new(registry: Arc<SessionRegistry>, config: ProxyConfig) -> Arc<Self> {
        Arc::new(SessionProxy {
            registry,
            config,
            metrics: HttpMetrics::default(),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn register_metrics(&self, registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
        self.metrics.clone().register(registry)?;
        Ok(())
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept loop. On shutdown: stop accepting, wait up to the grace
    /// period for in-flight requests, then sever what remains.
    pub async fn run(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, prefix = %self.config.prefix, "session proxy listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted connection");
                    let proxy = Arc::clone(&self);
                    let guard = self.tracker.track();
                    tokio::spawn(async move {
                        let service = service_fn({
                            let proxy = Arc::clone(&proxy);
                            move |req: Request<Incoming>| {
                                let proxy = Arc::clone(&proxy);
                                async move { proxy.handle(req).await }
                            }
                        });
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades();
                        tokio::pin!(conn);
                        tokio::select! {
                            result = conn.as_mut() => {
                                if let Err(e) = result {
                                    debug!("connection ended: {e}");
                                }
                            }
                            _ = guard.token.cancelled() => {}
                        }
                        drop(guard);
                    });
                }
            }
        }
        drop(listener);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.tracker.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.tracker.close_all();
        info!("session proxy stopped");
        Ok(())
    }

    async fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let method = req.method().clone();

        let Some((session_name, upstream_path)) = parse_route(req.uri().path(), &self.config.prefix)
        else {
            self.metrics
                .observe_completed(method.as_str(), 404, ROUTE_UNKNOWN, started);
            return Ok(simple_response(StatusCode::NOT_FOUND, "unknown route"));
        };
        let Some(upstream) = self.registry.get(&session_name) else {
            self.metrics
                .observe_completed(method.as_str(), 404, ROUTE_KAS, started);
            return Ok(simple_response(StatusCode::NOT_FOUND, "unknown session"));
        };
        // the owner's claim gates every request before anything touches the
        // upstream
        if !authorize(&upstream, req.headers()) {
            warn!(session = %session_name, "claim does not match session owner");
            self.metrics
                .observe_completed(method.as_str(), 401, ROUTE_KAS, started);
            return Ok(simple_response(StatusCode::UNAUTHORIZED, "claim mismatch"));
        }

        match self.forward(req, &upstream, upstream_path, &method, started).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(session = %session_name, "upstream request failed: {e}");
                self.metrics
                    .observe_completed(method.as_str(), 502, ROUTE_KAS, started);
                Ok(simple_response(StatusCode::BAD_GATEWAY, "upstream unavailable"))
            }
        }
    }

    async fn forward<B>(
        &self,
        mut req: Request<B>,
        upstream: &Arc<SessionUpstream>,
        upstream_path: String,
        method: &Method,
        started: Instant,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, String>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let tcp = TcpStream::connect((upstream.host.as_str(), upstream.port))
            .await
            .map_err(|e| format!("connect {}:{}: {e}", upstream.host, upstream.port))?;
        let connector = TlsConnector::from(Arc::clone(&upstream.tls));
        let server_name = ServerName::try_from(upstream.host.clone())
            .map_err(|e| format!("invalid upstream host name: {e}"))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| format!("tls handshake: {e}"))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| format!("http handshake: {e}"))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("upstream connection ended: {e}");
            }
        });

        // strip the session prefix, keep the query
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{upstream_path}?{query}"),
            None => upstream_path,
        };
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e| format!("rewritten uri invalid: {e}"))?;
        let server_upgrade = hyper::upgrade::on(&mut req);
        *req.uri_mut() = uri;
        let host_value = HeaderValue::from_str(&format!("{}:{}", upstream.host, upstream.port))
            .map_err(|e| format!("invalid host header: {e}"))?;
        req.headers_mut().insert(HOST, host_value);

        let mut response = sender
            .send_request(req)
            .await
            .map_err(|e| format!("upstream request: {e}"))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            // carry the tunnel: both ends upgrade, then bytes are copied
            // until either side closes or shutdown severs the connection
            let client_upgrade = hyper::upgrade::on(&mut response);
            let measurer = self
                .metrics
                .tunnel_measurer(method.as_str().to_string(), ROUTE_KAS, started);
            self.metrics.count(method.as_str(), 101, ROUTE_KAS);
            tokio::spawn(async move {
                let _measurer = measurer;
                match (server_upgrade.await, client_upgrade.await) {
                    (Ok(server_io), Ok(client_io)) => {
                        let mut server_io = TokioIo::new(server_io);
                        let mut client_io = TokioIo::new(client_io);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut server_io, &mut client_io).await
                        {
                            debug!("tunnel closed: {e}");
                        }
                    }
                    (server, client) => {
                        warn!(
                            "upgrade failed: server={:?} client={:?}",
                            server.err(),
                            client.err()
                        );
                    }
                }
            });
            let (parts, _) = response.into_parts();
            Ok(Response::from_parts(parts, empty_body()))
        } else {
            self.metrics
                .observe_completed(method.as_str(), response.status().as_u16(), ROUTE_KAS, started);
            Ok(response.map(|body| body.boxed()))
        }
    }
}

/// `/{prefix}/{session}/kas{rest}` -> `(session, rest-or-/)`. The `kas`
/// segment is a literal.
fn parse_route(path: &str, prefix: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    let (first, rest) = trimmed.split_once('/')?;
    if first != prefix {
        return None;
    }
    let (session, rest) = rest.split_once('/')?;
    if session.is_empty() {
        return None;
    }
    let upstream_path = if rest == "kas" {
        "/".to_string()
    } else if let Some(tail) = rest.strip_prefix("kas/") {
        format!("/{tail}")
    } else {
        return None;
    };
    Some((session.to_string(), upstream_path))
}

fn required_claim_header(owner_type: SessionOwnerType) -> &'static str {
    match owner_type {
        SessionOwnerType::AzureUser => CLAIM_HEADER_UPN,
        SessionOwnerType::AzureServicePrincipal => CLAIM_HEADER_OID,
    }
}

/// The caller's claim must equal the session owner's name.
fn authorize(upstream: &SessionUpstream, headers: &HeaderMap) -> bool {
    let header = required_claim_header(upstream.owner.type_);
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|claim| claim == upstream.owner.name)
        .unwrap_or(false)
}

fn simple_response(status: StatusCode, message: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from_static(message.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_route_strips_prefix_session_and_kas() {
        assert_eq!(
            parse_route("/sg/s1/kas/api/v1/namespaces", "sg"),
            Some(("s1".to_string(), "/api/v1/namespaces".to_string()))
        );
        assert_eq!(parse_route("/sg/s1/kas", "sg"), Some(("s1".to_string(), "/".to_string())));
        assert_eq!(parse_route("/sessiongate/s1/kas/api", "sessiongate").unwrap().1, "/api");
    }

    #[test]
    fn parse_route_rejects_other_shapes() {
        assert!(parse_route("/sg/s1/api/v1", "sg").is_none());
        assert!(parse_route("/other/s1/kas/api", "sg").is_none());
        assert!(parse_route("/sg", "sg").is_none());
        assert!(parse_route("/sg/s1", "sg").is_none());
        assert!(parse_route("/sg/s1/kastle", "sg").is_none());
        assert!(parse_route("no-slash", "sg").is_none());
    }

    #[test]
    fn claim_header_depends_on_owner_type() {
        assert_eq!(required_claim_header(SessionOwnerType::AzureUser), CLAIM_HEADER_UPN);
        assert_eq!(
            required_claim_header(SessionOwnerType::AzureServicePrincipal),
            CLAIM_HEADER_OID
        );
    }

    use crate::api::v1::SessionOwner;

    fn test_proxy() -> (Arc<SessionRegistry>, Arc<SessionProxy>) {
        let registry = Arc::new(SessionRegistry::new());
        let proxy = SessionProxy::new(Arc::clone(&registry), ProxyConfig::default());
        (registry, proxy)
    }

    fn owner() -> SessionOwner {
        SessionOwner {
            type_: SessionOwnerType::AzureUser,
            name: "alice@x".to_string(),
        }
    }

    fn request(uri: &str, claim: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        if let Some(claim) = claim {
            builder = builder.header(CLAIM_HEADER_UPN, claim);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_registry, proxy) = test_proxy();
        let response = proxy.handle(request("/sg/missing/kas/api", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_mismatch_is_unauthorized_without_upstream_contact() {
        let (registry, proxy) = test_proxy();
        // the upstream host does not exist; a 401 (not a 502) proves the
        // request was rejected before any connect attempt
        registry.insert_for_test(SessionUpstream::for_test(
            "s1",
            owner(),
            "no-such-host.invalid",
            6443,
        ));

        let response = Arc::clone(&proxy)
            .handle(request("/sg/s1/kas/api/v1/namespaces", Some("mallory@x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = Arc::clone(&proxy)
            .handle(request("/sg/s1/kas/api/v1/namespaces", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn matching_claim_with_unreachable_upstream_is_bad_gateway() {
        let (registry, proxy) = test_proxy();
        registry.insert_for_test(SessionUpstream::for_test("s1", owner(), "127.0.0.1", 1));

        let response = proxy
            .handle(request("/sg/s1/kas/api/v1/namespaces", Some("alice@x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
