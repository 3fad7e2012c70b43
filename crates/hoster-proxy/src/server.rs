//! The proxy HTTP listener.
//!
//! Every request resolves `Host` → deployment → upstream, then streams
//! the response back. `/health` is answered locally; every failure mode
//! renders an HTML page with the right status code.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use hoster_store::Store;

use crate::hostname::{classify_host, strip_port};
use crate::pages;
use crate::policy::{evaluate, upstream_url, RouteGate};

/// Header carrying the resolved deployment to the upstream app.
pub const DEPLOYMENT_ID_HEADER: &str = "x-deployment-id";

/// Shared state for the proxy listener.
#[derive(Clone)]
pub struct ProxyState {
    pub store: Store,
    pub base_domain: String,
    client: Client<HttpConnector, Body>,
}

impl ProxyState {
    pub fn new(store: Store, base_domain: String) -> Self {
        Self {
            store,
            base_domain,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

/// Build the proxy router: `/health` plus a catch-all forwarder.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .with_state(state)
}

async fn health(State(state): State<ProxyState>) -> Response {
    let routable = state.store.count_routable_deployments().await.unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "deployments_routable": routable,
        "base_domain": state.base_domain,
    }))
    .into_response()
}

async fn forward(State(state): State<ProxyState>, mut req: Request<Body>) -> Response {
    let raw_host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let stripped = strip_port(&raw_host);
    if stripped.is_empty() {
        return html(StatusCode::NOT_FOUND, pages::not_found(&raw_host));
    }
    // Subdomain matches and custom domains both resolve by exact
    // hostname; classification normalizes the lookup key.
    let host = classify_host(stripped, &state.base_domain).hostname(&state.base_domain);

    let deployment = match state.store.get_deployment_by_domain(&host).await {
        Ok(dep) => dep,
        Err(e) if e.is_not_found() => {
            return html(StatusCode::NOT_FOUND, pages::not_found(&host));
        }
        Err(e) => {
            warn!(host = %host, error = %e, "domain lookup failed");
            return html(StatusCode::SERVICE_UNAVAILABLE, pages::unavailable(&host));
        }
    };

    match evaluate(&deployment, &host) {
        RouteGate::VerificationPending => {
            return html(StatusCode::SERVICE_UNAVAILABLE, pages::verification_pending(&host));
        }
        RouteGate::Stopped => {
            return html(StatusCode::SERVICE_UNAVAILABLE, pages::stopped(&host));
        }
        RouteGate::Allow => {}
    }

    let node_host = if deployment.node_id.is_empty() {
        None
    } else {
        match state.store.get_node_ssh_host(&deployment.node_id).await {
            Ok(node_host) => Some(node_host),
            Err(e) => {
                warn!(deployment = %deployment.reference_id, error = %e, "node lookup failed");
                return html(StatusCode::SERVICE_UNAVAILABLE, pages::unavailable(&host));
            }
        }
    };
    let upstream = upstream_url(&deployment, node_host.as_deref());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let uri: Uri = match format!("{upstream}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "bad upstream uri");
            return html(StatusCode::SERVICE_UNAVAILABLE, pages::unavailable(&host));
        }
    };
    debug!(host = %host, upstream = %uri, "forwarding");

    let real_ip = client_ip(&req);
    *req.uri_mut() = uri;
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&raw_host) {
        headers.insert("x-forwarded-host", value);
    }
    if let Ok(value) = HeaderValue::from_str(&real_ip) {
        headers.insert("x-real-ip", value);
    }
    if let Ok(value) = HeaderValue::from_str(&deployment.reference_id) {
        headers.insert(DEPLOYMENT_ID_HEADER, value);
    }

    match state.client.request(req).await {
        Ok(response) => response.map(Body::new),
        Err(e) => {
            warn!(host = %host, error = %e, "upstream transport error");
            html(StatusCode::SERVICE_UNAVAILABLE, pages::unavailable(&host))
        }
    }
}

/// Original client address: `X-Real-IP`, else the first
/// `X-Forwarded-For` entry, else the socket peer.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

fn html(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tower::util::ServiceExt;

    use hoster_store::store::{NewDeployment, NewTemplate};
    use hoster_store::{DeploymentDomain, DeploymentStatus, ResourceLimits};

    async fn seeded_state() -> (ProxyState, String) {
        let store = Store::open_in_memory().await.unwrap();
        let template = store
            .create_template(NewTemplate {
                slug: "nginx-demo".to_string(),
                compose_spec: "services:\n  web:\n    image: nginx:alpine\n".to_string(),
                creator_id: "creator-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let dep = store
            .create_deployment(NewDeployment {
                name: "blog".to_string(),
                template_id: template.id,
                template_version: 1,
                customer_id: "user-1".to_string(),
                node_id: String::new(),
                variables: HashMap::new(),
                domains: vec![DeploymentDomain::auto("blog", "apps.localhost")],
                resources: ResourceLimits::default(),
            })
            .await
            .unwrap();
        (
            ProxyState::new(store, "apps.localhost".to_string()),
            dep.reference_id,
        )
    }

    fn request(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn health_reports_routable_count() {
        let (state, _) = seeded_state().await;
        let response = proxy_router(state)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"deployments_routable\":0"));
        assert!(body.contains("apps.localhost"));
    }

    #[tokio::test]
    async fn unknown_host_renders_not_found_page() {
        let (state, _) = seeded_state().await;
        let response = proxy_router(state)
            .oneshot(request("missing.apps.localhost:9091"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert!(body_string(response).await.contains("App Not Found"));
    }

    #[tokio::test]
    async fn pending_deployment_renders_stopped_page() {
        let (state, _) = seeded_state().await;
        let response = proxy_router(state)
            .oneshot(request("blog.apps.localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("App Stopped"));
    }

    #[tokio::test]
    async fn unverified_custom_domain_renders_verification_page() {
        let (state, dep_ref) = seeded_state().await;
        let mut dep = state.store.get_deployment(&dep_ref).await.unwrap();
        dep.domains.push(DeploymentDomain::custom("shop.example.com"));
        state.store.update_deployment(&dep).await.unwrap();

        let response = proxy_router(state)
            .oneshot(request("shop.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("Verification Pending"));
    }

    // End-to-end: a running deployment proxies to a real local backend.
    #[tokio::test]
    async fn running_deployment_proxies_to_upstream() {
        let (state, dep_ref) = seeded_state().await;

        // A tiny backend standing in for the deployment's container.
        let backend = Router::new().route("/", get(|| async { "Welcome to nginx!" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let mut dep = state.store.get_deployment(&dep_ref).await.unwrap();
        for status in [
            DeploymentStatus::Scheduled,
            DeploymentStatus::Starting,
            DeploymentStatus::Running,
        ] {
            dep.transition(status).unwrap();
        }
        dep.proxy_port = port;
        state.store.update_deployment(&dep).await.unwrap();

        let response = proxy_router(state)
            .oneshot(request("blog.apps.localhost:9091"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("Welcome to nginx!"));
    }

    #[tokio::test]
    async fn dead_upstream_renders_unavailable_page() {
        let (state, dep_ref) = seeded_state().await;
        let mut dep = state.store.get_deployment(&dep_ref).await.unwrap();
        for status in [
            DeploymentStatus::Scheduled,
            DeploymentStatus::Starting,
            DeploymentStatus::Running,
        ] {
            dep.transition(status).unwrap();
        }
        // A port nothing listens on.
        dep.proxy_port = 1;
        state.store.update_deployment(&dep).await.unwrap();

        let response = proxy_router(state)
            .oneshot(request("blog.apps.localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("Temporarily Unavailable"));
    }
}
