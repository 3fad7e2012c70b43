//! Template and deployment handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use hoster_core::ident;
use hoster_planner::ComposeSpec;
use hoster_store::store::{NewDeployment, NewTemplate};
use hoster_store::{
    Deployment, DeploymentDomain, DeploymentStatus, ResourceLimits, Template, TemplateVariable,
};

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::ApiState;

/// Uniform success envelope.
pub(crate) fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(serde_json::json!({ "success": true, "data": data })).into_response()
}

pub(crate) fn created<T: serde::Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "data": data })),
    )
        .into_response()
}

// ── Templates ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTemplateRequest {
    pub slug: String,
    pub compose_spec: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct ListTemplatesQuery {
    /// Include unpublished templates (own drafts show regardless).
    #[serde(default)]
    pub all: bool,
}

/// POST /api/v1/templates
pub async fn create_template(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<Response> {
    ident::validate_slug(&req.slug)?;
    ComposeSpec::parse(&req.compose_spec)
        .map_err(|e| ApiError::BadRequest(format!("compose_spec: {e}")))?;

    let template = state
        .store
        .create_template(NewTemplate {
            slug: req.slug,
            compose_spec: req.compose_spec,
            variables: req.variables,
            resources: req.resources,
            price_cents: req.price_cents,
            category: req.category,
            tags: req.tags,
            required_capabilities: req.required_capabilities,
            creator_id: identity.user_id,
        })
        .await?;
    Ok(created(template))
}

/// GET /api/v1/templates
pub async fn list_templates(
    State(state): State<ApiState>,
    identity: Identity,
    Query(query): Query<ListTemplatesQuery>,
) -> ApiResult<Response> {
    let templates = state.store.list_templates(!query.all).await?;
    let visible: Vec<Template> = templates
        .into_iter()
        .filter(|t| t.published || t.creator_id == identity.user_id)
        .collect();
    Ok(ok(visible))
}

/// GET /api/v1/templates/{ref}
pub async fn get_template(
    State(state): State<ApiState>,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(state.store.get_template(&reference).await?))
}

#[derive(Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default)]
    pub compose_spec: Option<String>,
    #[serde(default)]
    pub variables: Option<Vec<TemplateVariable>>,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub price_cents: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// PUT /api/v1/templates/{ref}
pub async fn update_template(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
    Json(req): Json<UpdateTemplateRequest>,
) -> ApiResult<Response> {
    let mut template = state.store.get_template(&reference).await?;
    require_owner(&template.creator_id, &identity)?;

    if let Some(compose_spec) = req.compose_spec {
        // The spec of a referenced version is immutable; a change bumps
        // the version for future deployments.
        ComposeSpec::parse(&compose_spec)
            .map_err(|e| ApiError::BadRequest(format!("compose_spec: {e}")))?;
        if compose_spec != template.compose_spec {
            let references = state
                .store
                .count_deployments_for_template(template.id)
                .await?;
            if references > 0 {
                return Err(ApiError::Conflict(format!(
                    "compose spec is referenced by {references} deployments"
                )));
            }
            template.compose_spec = compose_spec;
            template.version += 1;
        }
    }
    if let Some(variables) = req.variables {
        template.variables = variables;
    }
    if let Some(resources) = req.resources {
        template.resources = resources;
    }
    if let Some(price_cents) = req.price_cents {
        template.price_cents = price_cents;
    }
    if let Some(category) = req.category {
        template.category = category;
    }
    if let Some(tags) = req.tags {
        template.tags = tags;
    }

    state.store.update_template(&template).await?;
    Ok(ok(template))
}

/// POST /api/v1/templates/{ref}/publish
pub async fn publish_template(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let mut template = state.store.get_template(&reference).await?;
    require_owner(&template.creator_id, &identity)?;
    template.published = true;
    state.store.update_template(&template).await?;
    Ok(ok(template))
}

/// DELETE /api/v1/templates/{ref}
pub async fn delete_template(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let template = state.store.get_template(&reference).await?;
    require_owner(&template.creator_id, &identity)?;
    state.store.delete_template(&reference).await?;
    Ok(ok(serde_json::json!({ "deleted": reference })))
}

// ── Deployments ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateDeploymentRequest {
    /// Template slug.
    pub template: String,
    pub name: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
    /// Extra custom domains; the auto-domain is always attached.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Start immediately after creation (the default).
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateDeploymentRequest>,
) -> ApiResult<Response> {
    ident::validate_slug(&req.name)?;
    let template = state.store.get_template_by_slug(&req.template).await?;
    if !template.published && template.creator_id != identity.user_id {
        return Err(ApiError::NotFound(format!("template {}", req.template)));
    }
    if !req.node_id.is_empty() {
        // Fail early on unknown nodes.
        state.store.get_node(&req.node_id).await?;
    }

    let mut domains = vec![DeploymentDomain::auto(&req.name, &state.base_domain)];
    for hostname in &req.domains {
        domains.push(DeploymentDomain::custom(hostname));
    }

    let deployment = state
        .store
        .create_deployment(NewDeployment {
            name: req.name,
            template_id: template.id,
            template_version: template.version,
            customer_id: identity.user_id,
            node_id: req.node_id,
            variables: req.variables,
            domains,
            resources: template.resources,
        })
        .await?;

    if req.start {
        let deployer = state.deployer.clone();
        let reference = deployment.reference_id.clone();
        tokio::spawn(async move {
            if let Err(e) = deployer.start(&reference).await {
                warn!(deployment = %reference, error = %e, "startup after create failed");
            }
        });
    }
    Ok(created(deployment))
}

/// GET /api/v1/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    identity: Identity,
) -> ApiResult<Response> {
    Ok(ok(state
        .store
        .list_deployments_by_customer(&identity.user_id)
        .await?))
}

/// GET /api/v1/deployments/{ref}
pub async fn get_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    Ok(ok(owned_deployment(&state, &identity, &reference).await?))
}

/// POST /api/v1/deployments/{ref}/start
pub async fn start_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state.deployer.start(&reference).await?))
}

/// POST /api/v1/deployments/{ref}/stop
pub async fn stop_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state.deployer.stop(&reference).await?))
}

/// POST /api/v1/deployments/{ref}/restart
pub async fn restart_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state.deployer.restart(&reference).await?))
}

/// DELETE /api/v1/deployments/{ref}
pub async fn delete_deployment(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state.deployer.delete(&reference).await?))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub container: String,
    #[serde(default)]
    pub tail: Option<u32>,
}

/// GET /api/v1/deployments/{ref}/logs?container=web&tail=100
pub async fn deployment_logs(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    let logs = state
        .deployer
        .container_logs(&reference, &query.container, query.tail)
        .await?;
    Ok(ok(serde_json::json!({ "logs": logs })))
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub container: String,
}

/// GET /api/v1/deployments/{ref}/stats?container=web
pub async fn deployment_stats(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Response> {
    owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state
        .deployer
        .container_stats(&reference, &query.container)
        .await?))
}

/// GET /api/v1/deployments/{ref}/events
pub async fn deployment_events(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let deployment = owned_deployment(&state, &identity, &reference).await?;
    Ok(ok(state
        .store
        .list_container_events(deployment.id, 100)
        .await?))
}

#[derive(Deserialize)]
pub struct AddDomainRequest {
    pub hostname: String,
}

/// POST /api/v1/deployments/{ref}/domains
pub async fn add_domain(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
    Json(req): Json<AddDomainRequest>,
) -> ApiResult<Response> {
    let hostname = req.hostname.trim().to_ascii_lowercase();
    if hostname.is_empty() || !hostname.contains('.') {
        return Err(ApiError::BadRequest(format!("invalid hostname {hostname:?}")));
    }

    let mut deployment = owned_deployment(&state, &identity, &reference).await?;
    if deployment
        .domains
        .iter()
        .any(|d| d.hostname.eq_ignore_ascii_case(&hostname))
    {
        return Err(ApiError::Conflict(format!("{hostname} is already attached")));
    }
    deployment.domains.push(DeploymentDomain::custom(&hostname));
    state.store.update_deployment(&deployment).await?;
    Ok(ok(deployment))
}

/// DELETE /api/v1/deployments/{ref}/domains/{hostname}
pub async fn remove_domain(
    State(state): State<ApiState>,
    identity: Identity,
    Path((reference, hostname)): Path<(String, String)>,
) -> ApiResult<Response> {
    let mut deployment = owned_deployment(&state, &identity, &reference).await?;
    let before = deployment.domains.len();
    deployment.domains.retain(|d| {
        d.kind != hoster_store::DomainKind::Custom || !d.hostname.eq_ignore_ascii_case(&hostname)
    });
    if deployment.domains.len() == before {
        return Err(ApiError::NotFound(format!("custom domain {hostname}")));
    }
    state.store.update_deployment(&deployment).await?;
    Ok(ok(deployment))
}

// ── Shared ────────────────────────────────────────────────────────

/// Load a deployment and enforce ownership. A hidden resource reads as
/// not-found, not forbidden.
pub(crate) async fn owned_deployment(
    state: &ApiState,
    identity: &Identity,
    reference: &str,
) -> ApiResult<Deployment> {
    let deployment = state.store.get_deployment(reference).await?;
    if deployment.customer_id != identity.user_id || deployment.status == DeploymentStatus::Deleted
    {
        return Err(ApiError::NotFound(format!("deployment {reference}")));
    }
    Ok(deployment)
}

pub(crate) fn require_owner(creator_id: &str, identity: &Identity) -> ApiResult<()> {
    if creator_id != identity.user_id {
        return Err(ApiError::Forbidden("not the owner".to_string()));
    }
    Ok(())
}
