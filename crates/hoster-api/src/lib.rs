//! hoster-api — the control plane's REST surface.
//!
//! Requests arrive pre-authenticated from an upstream gateway that
//! injects identity headers; handlers validate, dispatch to the store
//! and deployer, and answer with a uniform JSON envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness probe |
//! | GET/POST | `/api/v1/templates` | List / create templates |
//! | GET/PUT/DELETE | `/api/v1/templates/{ref}` | Manage one template |
//! | POST | `/api/v1/templates/{ref}/publish` | Publish a template |
//! | GET/POST | `/api/v1/deployments` | List / create deployments |
//! | GET/DELETE | `/api/v1/deployments/{ref}` | Manage one deployment |
//! | POST | `/api/v1/deployments/{ref}/start` | Start |
//! | POST | `/api/v1/deployments/{ref}/stop` | Stop |
//! | POST | `/api/v1/deployments/{ref}/restart` | Restart |
//! | GET | `/api/v1/deployments/{ref}/logs` | Container logs |
//! | GET | `/api/v1/deployments/{ref}/stats` | Container stats |
//! | GET | `/api/v1/deployments/{ref}/events` | Operational events |
//! | POST/DELETE | `/api/v1/deployments/{ref}/domains[/{hostname}]` | Custom domains |
//! | GET/POST | `/api/v1/nodes` | List / register nodes |
//! | GET/PUT/DELETE | `/api/v1/nodes/{ref}` | Manage one node |
//! | GET/POST | `/api/v1/ssh-keys` | List / import or generate keys |
//! | DELETE | `/api/v1/ssh-keys/{ref}` | Delete a key |
//! | GET/POST | `/api/v1/cloud-credentials` | List / store credentials |
//! | DELETE | `/api/v1/cloud-credentials/{ref}` | Delete a credential |
//! | GET | `/api/v1/cloud-credentials/{ref}/regions` | Provider regions |
//! | GET | `/api/v1/cloud-credentials/{ref}/sizes` | Provider sizes |
//! | GET/POST | `/api/v1/provisions` | List / start provisions |
//! | GET/DELETE | `/api/v1/provisions/{ref}` | Inspect / destroy |
//! | GET | `/api/v1/usage-events` | Own billable events |

pub mod auth;
pub mod error;
pub mod handlers;
pub mod infra_handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use hoster_core::SecretCipher;
use hoster_deployer::Deployer;
use hoster_store::Store;

pub use auth::Identity;
pub use error::{ApiError, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub deployer: Arc<Deployer>,
    /// Present only when remote-node features are enabled.
    pub cipher: Option<SecretCipher>,
    pub base_domain: String,
    /// Required `X-APIGate-Secret` value, if configured.
    pub gateway_secret: Option<String>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route(
            "/templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route(
            "/templates/{ref}",
            get(handlers::get_template)
                .put(handlers::update_template)
                .delete(handlers::delete_template),
        )
        .route("/templates/{ref}/publish", post(handlers::publish_template))
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route(
            "/deployments/{ref}",
            get(handlers::get_deployment).delete(handlers::delete_deployment),
        )
        .route("/deployments/{ref}/start", post(handlers::start_deployment))
        .route("/deployments/{ref}/stop", post(handlers::stop_deployment))
        .route("/deployments/{ref}/restart", post(handlers::restart_deployment))
        .route("/deployments/{ref}/logs", get(handlers::deployment_logs))
        .route("/deployments/{ref}/stats", get(handlers::deployment_stats))
        .route("/deployments/{ref}/events", get(handlers::deployment_events))
        .route("/deployments/{ref}/domains", post(handlers::add_domain))
        .route(
            "/deployments/{ref}/domains/{hostname}",
            axum::routing::delete(handlers::remove_domain),
        )
        .route(
            "/nodes",
            get(infra_handlers::list_nodes).post(infra_handlers::create_node),
        )
        .route(
            "/nodes/{ref}",
            get(infra_handlers::get_node)
                .put(infra_handlers::update_node)
                .delete(infra_handlers::delete_node),
        )
        .route(
            "/ssh-keys",
            get(infra_handlers::list_ssh_keys).post(infra_handlers::create_ssh_key),
        )
        .route(
            "/ssh-keys/{ref}",
            axum::routing::delete(infra_handlers::delete_ssh_key),
        )
        .route(
            "/cloud-credentials",
            get(infra_handlers::list_credentials).post(infra_handlers::create_credential),
        )
        .route(
            "/cloud-credentials/{ref}",
            axum::routing::delete(infra_handlers::delete_credential),
        )
        .route(
            "/cloud-credentials/{ref}/regions",
            get(infra_handlers::list_provider_regions),
        )
        .route(
            "/cloud-credentials/{ref}/sizes",
            get(infra_handlers::list_provider_sizes),
        )
        .route(
            "/provisions",
            get(infra_handlers::list_provisions).post(infra_handlers::create_provision),
        )
        .route(
            "/provisions/{ref}",
            get(infra_handlers::get_provision).delete(infra_handlers::destroy_provision),
        )
        .route("/usage-events", get(infra_handlers::list_usage_events))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_gateway_secret,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "base_domain": state.base_domain,
    }))
}
