use hyper::header;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::config::GatewayConfig;
use crate::gateway::rate::{RateBucketStore, MINT_POLICY, UPGRADE_POLICY};
use crate::gateway::relay::run_relay;
use crate::gateway::token::{mint_session_token, verify_session_token};

/// Path the browser polls for short-lived session tokens.
pub const SESSION_TOKEN_PATH: &str = "/session-token";

/// Path of the market-data relay endpoint.
pub const FEED_PATH: &str = "/feed";

/// Explicitly-owned gateway state, threaded through the request path.
/// The maps are mutated only by request handling and pruned at access
/// time; nothing here is a process-wide singleton.
pub struct GatewayState {
    secret: Option<Vec<u8>>,
    upstream_url: String,
    public_host: Option<String>,
    max_sockets_per_ip: usize,
    mint_buckets: Mutex<RateBucketStore>,
    upgrade_buckets: Mutex<RateBucketStore>,
    active_sockets: Mutex<HashMap<String, usize>>,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            secret: config
                .session_secret
                .as_ref()
                .map(|s| s.as_bytes().to_vec()),
            upstream_url: config.upstream_feed_url.clone(),
            public_host: config.public_host.clone(),
            max_sockets_per_ip: config.max_sockets_per_ip,
            mint_buckets: Mutex::new(RateBucketStore::new(MINT_POLICY)),
            upgrade_buckets: Mutex::new(RateBucketStore::new(UPGRADE_POLICY)),
            active_sockets: Mutex::new(HashMap::new()),
        }
    }

    fn try_register_socket(self: &Arc<Self>, ip: &str) -> Option<SocketGuard> {
        let mut active = self.active_sockets.lock().unwrap();
        let count = active.entry(ip.to_string()).or_insert(0);
        if *count >= self.max_sockets_per_ip {
            return None;
        }
        *count += 1;
        Some(SocketGuard {
            state: Arc::clone(self),
            ip: ip.to_string(),
        })
    }
}

/// Holds one slot of the per-IP connection cap; the slot frees on drop,
/// which also removes emptied entries so the map stays bounded.
struct SocketGuard {
    state: Arc<GatewayState>,
    ip: String,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let mut active = self.state.active_sockets.lock().unwrap();
        if let Some(count) = active.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.ip);
            }
        }
    }
}

/// Serves the gateway until ctrl-c.
pub async fn serve(state: Arc<GatewayState>, addr: SocketAddr) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = Arc::clone(&state);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(Arc::clone(&state), remote, req)
            }))
        }
    });

    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}

/// Routes one request. Never errors: every failure is an HTTP status.
pub async fn handle_request(
    state: Arc<GatewayState>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let ip = client_ip(&req, &remote);

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, SESSION_TOKEN_PATH) => mint_token_response(&state, &ip),
        (&Method::GET, FEED_PATH) => feed_upgrade_response(state, ip, req),
        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn mint_token_response(state: &GatewayState, ip: &str) -> Response<Body> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    if !state
        .mint_buckets
        .lock()
        .unwrap()
        .allow(ip, now_ms as u64)
    {
        debug!("token mint rate-limited for {}", ip);
        return json_response(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({"error": "rate_limited"}),
        );
    }

    let Some(secret) = state.secret.as_deref() else {
        warn!("session token requested but no secret is configured");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": "gateway_not_configured"}),
        );
    };

    let minted = mint_session_token(secret, ip, now_ms);
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "token": minted.token,
            "expiresAtMs": minted.expires_at_ms,
        }),
    )
}

fn feed_upgrade_response(
    state: Arc<GatewayState>,
    ip: String,
    mut req: Request<Body>,
) -> Response<Body> {
    if !is_websocket_upgrade(&req) {
        return Response::builder()
            .status(StatusCode::UPGRADE_REQUIRED)
            .header(header::UPGRADE, "websocket")
            .body(Body::from("upgrade required"))
            .unwrap_or_default();
    }

    if !origin_allowed(&req, state.public_host.as_deref()) {
        debug!("feed upgrade rejected for {}: origin mismatch", ip);
        return plain_response(StatusCode::FORBIDDEN, "origin not allowed");
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    if !state
        .upgrade_buckets
        .lock()
        .unwrap()
        .allow(&ip, now_ms as u64)
    {
        debug!("feed upgrade rate-limited for {}", ip);
        return plain_response(StatusCode::TOO_MANY_REQUESTS, "rate limited");
    }

    let Some(guard) = state.try_register_socket(&ip) else {
        debug!("feed upgrade rejected for {}: connection cap", ip);
        return plain_response(StatusCode::TOO_MANY_REQUESTS, "connection cap reached");
    };

    let Some(secret) = state.secret.clone() else {
        warn!("feed upgrade requested but no secret is configured");
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "gateway not configured");
    };

    let Some(token) = query_param(req.uri().query(), "st") else {
        return plain_response(StatusCode::UNAUTHORIZED, "missing session token");
    };
    if let Err(e) = verify_session_token(&secret, &token, &ip, now_ms) {
        debug!("feed upgrade rejected for {}: {}", ip, e);
        return plain_response(StatusCode::UNAUTHORIZED, "invalid session token");
    }

    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|k| k.as_bytes().to_vec())
    else {
        return plain_response(StatusCode::BAD_REQUEST, "missing websocket key");
    };

    let accept = derive_accept_key(&key);
    let upstream_url = state.upstream_url.clone();
    let peer = ip.clone();
    let upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        // The guard pins one connection-cap slot for the socket lifetime.
        let _guard = guard;
        match upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                run_relay(ws, &upstream_url, &peer).await;
            }
            Err(e) => warn!("upgrade failed for {}: {}", peer, e),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())
        .unwrap_or_default()
}

fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Strict same-host check: the Origin header must be present and its
/// host must match the configured public host, or failing that the Host
/// header.
fn origin_allowed(req: &Request<Body>, public_host: Option<&str>) -> bool {
    let Some(origin_host) = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .and_then(host_of_origin)
    else {
        return false;
    };

    let expected = match public_host {
        Some(host) => Some(host.to_string()),
        None => req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|host| strip_port(host).to_string()),
    };

    match expected {
        Some(expected) => origin_host.eq_ignore_ascii_case(&expected),
        None => false,
    }
}

fn host_of_origin(origin: &str) -> Option<String> {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))?;
    Some(strip_port(rest).to_string())
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Client IP: forwarded header first (the edge runs behind a proxy),
/// peer address otherwise.
fn client_ip(req: &Request<Body>, remote: &SocketAddr) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .or_else(|| req.headers().get("cf-connecting-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    forwarded.unwrap_or_else(|| remote.ip().to_string())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_default()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(secret: Option<&str>) -> Arc<GatewayState> {
        Arc::new(GatewayState::new(&GatewayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            session_secret: secret.map(str::to_string),
            upstream_feed_url: "wss://upstream.invalid/stream".to_string(),
            public_host: Some("edge.example.com".to_string()),
            max_sockets_per_ip: 2,
        }))
    }

    fn remote() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    fn token_request() -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(SESSION_TOKEN_PATH)
            .body(Body::empty())
            .unwrap()
    }

    fn upgrade_request(query: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", FEED_PATH, query))
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::ORIGIN, "https://edge.example.com")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn mints_a_verifiable_token() {
        let state = test_state(Some("secret"));
        let response = handle_request(Arc::clone(&state), remote(), token_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let token = json["token"].as_str().unwrap();
        assert!(json["expiresAtMs"].as_i64().unwrap() > 0);

        let now_ms = chrono::Utc::now().timestamp_millis();
        assert!(verify_session_token(b"secret", token, "203.0.113.7", now_ms).is_ok());
        // Bound to the requesting IP.
        assert!(verify_session_token(b"secret", token, "198.51.100.9", now_ms).is_err());
    }

    #[tokio::test]
    async fn unconfigured_secret_is_a_server_error() {
        let state = test_state(None);
        let response = handle_request(state, remote(), token_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn mint_rate_limit_rejects_exactly_the_fourth_burst_request() {
        let state = test_state(Some("secret"));

        for i in 0..3 {
            let response = handle_request(Arc::clone(&state), remote(), token_request())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {}", i);
        }

        let response = handle_request(state, remote(), token_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn forwarded_header_wins_over_peer_address() {
        let state = test_state(Some("secret"));
        let req = Request::builder()
            .method(Method::GET)
            .uri(SESSION_TOKEN_PATH)
            .header("x-forwarded-for", "198.51.100.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        let response = handle_request(state, remote(), req).await.unwrap();
        let json = body_json(response).await;
        let token = json["token"].as_str().unwrap();

        let now_ms = chrono::Utc::now().timestamp_millis();
        assert!(verify_session_token(b"secret", token, "198.51.100.9", now_ms).is_ok());
    }

    #[tokio::test]
    async fn non_upgrade_request_gets_426() {
        let state = test_state(Some("secret"));
        let req = Request::builder()
            .method(Method::GET)
            .uri(FEED_PATH)
            .body(Body::empty())
            .unwrap();

        let response = handle_request(state, remote(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(
            response.headers().get(header::UPGRADE).unwrap(),
            "websocket"
        );
    }

    #[tokio::test]
    async fn cross_origin_upgrade_gets_403() {
        let state = test_state(Some("secret"));
        let mut req = upgrade_request("?st=whatever");
        req.headers_mut().insert(
            header::ORIGIN,
            "https://evil.example.net".parse().unwrap(),
        );

        let response = handle_request(state, remote(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_origin_gets_403() {
        let state = test_state(Some("secret"));
        let mut req = upgrade_request("?st=whatever");
        req.headers_mut().remove(header::ORIGIN);

        let response = handle_request(state, remote(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_or_invalid_token_gets_401() {
        let state = test_state(Some("secret"));

        let response = handle_request(Arc::clone(&state), remote(), upgrade_request(""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response =
            handle_request(state, remote(), upgrade_request("?st=v1.1.nonce.bogus"))
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_upgrade_switches_protocols() {
        let state = test_state(Some("secret"));
        let now_ms = chrono::Utc::now().timestamp_millis();
        let minted = mint_session_token(b"secret", "203.0.113.7", now_ms);

        let response = handle_request(
            state,
            remote(),
            upgrade_request(&format!("?st={}", minted.token)),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(response
            .headers()
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .is_some());
    }

    #[tokio::test]
    async fn connection_cap_rejects_the_third_socket() {
        let state = test_state(Some("secret"));

        let g1 = state.try_register_socket("203.0.113.7").unwrap();
        let _g2 = state.try_register_socket("203.0.113.7").unwrap();
        assert!(state.try_register_socket("203.0.113.7").is_none());

        // Another IP has its own budget.
        assert!(state.try_register_socket("198.51.100.9").is_some());

        // Freeing a slot admits the next socket.
        drop(g1);
        assert!(state.try_register_socket("203.0.113.7").is_some());
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let state = test_state(Some("secret"));
        let req = Request::builder()
            .method(Method::GET)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = handle_request(state, remote(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param(Some("st=v1.1.n.s&x=1"), "st").as_deref(),
            Some("v1.1.n.s")
        );
        assert_eq!(
            query_param(Some("x=1&st=abc"), "st").as_deref(),
            Some("abc")
        );
        assert_eq!(query_param(Some("x=1"), "st"), None);
        assert_eq!(query_param(Some("st="), "st"), None);
        assert_eq!(query_param(None, "st"), None);
    }

    #[test]
    fn origin_host_parsing() {
        assert_eq!(
            host_of_origin("https://edge.example.com").as_deref(),
            Some("edge.example.com")
        );
        assert_eq!(
            host_of_origin("http://localhost:8787").as_deref(),
            Some("localhost")
        );
        assert_eq!(host_of_origin("edge.example.com"), None);
    }
}
