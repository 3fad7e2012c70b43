//! Store — sqlx/SQLite persistence for Hoster.
//!
//! Typed CRUD over every entity plus the specialized queries the router
//! and background workers run. Nested collections are JSON TEXT columns;
//! timestamps are RFC 3339 TEXT. Multi-row updates go through `with_tx`.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, Transaction};
use tracing::debug;

use hoster_core::ident::{self, prefix};

use crate::error::{StoreError, StoreResult};
use crate::types::*;

/// Boxed future returned by `with_tx` closures.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 't>>;

/// An open transaction handle passed to `with_tx` closures.
pub type Tx = Transaction<'static, sqlx::Sqlite>;

// ── Creation inputs ───────────────────────────────────────────────

/// Input for `create_template`.
#[derive(Debug, Clone, Default)]
pub struct NewTemplate {
    pub slug: String,
    pub compose_spec: String,
    pub variables: Vec<TemplateVariable>,
    pub resources: ResourceLimits,
    pub price_cents: i64,
    pub category: String,
    pub tags: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub creator_id: String,
}

/// Input for `create_deployment`.
#[derive(Debug, Clone, Default)]
pub struct NewDeployment {
    pub name: String,
    pub template_id: i64,
    pub template_version: i64,
    pub customer_id: String,
    pub node_id: String,
    pub variables: HashMap<String, String>,
    pub domains: Vec<DeploymentDomain>,
    pub resources: ResourceLimits,
}

/// Input for `create_node`.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub creator_id: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_id: Option<String>,
    pub docker_socket: String,
    pub status: Option<NodeStatus>,
    pub capabilities: Vec<String>,
    pub capacity: ResourceLimits,
    pub location: String,
    pub provider: Option<ProviderKind>,
    pub provision_id: Option<String>,
    pub base_domain: Option<String>,
}

/// Input for `create_ssh_key`.
#[derive(Debug, Clone, Default)]
pub struct NewSshKey {
    pub creator_id: String,
    pub name: String,
    pub encrypted_key: Vec<u8>,
    pub public_key: String,
    pub fingerprint: String,
}

/// Input for `create_credential`.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub creator_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub encrypted_credential: Vec<u8>,
    pub default_region: String,
}

/// Input for `create_provision`.
#[derive(Debug, Clone)]
pub struct NewProvision {
    pub creator_id: String,
    pub credential_id: String,
    pub provider: ProviderKind,
    pub instance_name: String,
    pub region: String,
    pub size: String,
}

/// Input for `record_usage_event`.
#[derive(Debug, Clone, Default)]
pub struct NewUsageEvent {
    pub user_id: String,
    pub event_type: String,
    pub resource_id: String,
    pub resource_type: String,
    pub quantity: i64,
    pub metadata: HashMap<String, String>,
}

// ── Store ─────────────────────────────────────────────────────────

/// Thread-safe store over a shared SQLite pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at the given path and run pending
    /// migrations.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        crate::migrations::run(&pool).await?;
        debug!(?path, "store opened");
        Ok(Self { pool })
    }

    /// Ephemeral in-memory store for tests. A single pooled connection
    /// keeps every query on the same memory database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        crate::migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, for migrations tooling.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a closure inside a single transaction; any error rolls back.
    pub async fn with_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Templates ──────────────────────────────────────────────────

    pub async fn create_template(&self, new: NewTemplate) -> StoreResult<Template> {
        let reference_id = ident::new_ref(prefix::TEMPLATE);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO templates (reference_id, slug, compose_spec, variables, cpu_cores, memory_mb, disk_mb, price_cents, category, tags, required_capabilities, published, creator_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.slug)
        .bind(&new.compose_spec)
        .bind(serde_json::to_string(&new.variables)?)
        .bind(new.resources.cpu_cores)
        .bind(new.resources.memory_mb)
        .bind(new.resources.disk_mb)
        .bind(new.price_cents)
        .bind(&new.category)
        .bind(serde_json::to_string(&new.tags)?)
        .bind(serde_json::to_string(&new.required_capabilities)?)
        .bind(&new.creator_id)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "template slug already in use"))?;
        self.get_template(&reference_id).await
    }

    pub async fn get_template(&self, reference_id: &str) -> StoreResult<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_template(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("template {reference_id}")))
    }

    pub async fn get_template_by_id(&self, id: i64) -> StoreResult<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_template(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("template #{id}")))
    }

    pub async fn get_template_by_slug(&self, slug: &str) -> StoreResult<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_template(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("template {slug}")))
    }

    pub async fn list_templates(&self, published_only: bool) -> StoreResult<Vec<Template>> {
        let sql = if published_only {
            "SELECT * FROM templates WHERE published = 1 ORDER BY slug"
        } else {
            "SELECT * FROM templates ORDER BY slug"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(map_template).collect()
    }

    pub async fn update_template(&self, template: &Template) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE templates SET slug = ?, version = ?, compose_spec = ?, variables = ?, cpu_cores = ?, memory_mb = ?, disk_mb = ?, price_cents = ?, category = ?, tags = ?, required_capabilities = ?, published = ?, updated_at = ? WHERE reference_id = ?",
        )
        .bind(&template.slug)
        .bind(template.version)
        .bind(&template.compose_spec)
        .bind(serde_json::to_string(&template.variables)?)
        .bind(template.resources.cpu_cores)
        .bind(template.resources.memory_mb)
        .bind(template.resources.disk_mb)
        .bind(template.price_cents)
        .bind(&template.category)
        .bind(serde_json::to_string(&template.tags)?)
        .bind(serde_json::to_string(&template.required_capabilities)?)
        .bind(template.published)
        .bind(fmt_ts(Utc::now()))
        .bind(&template.reference_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(res.rows_affected(), || format!("template {}", template.reference_id))
    }

    /// Delete a template. Fails with `Conflict` while deployments
    /// reference it (FK RESTRICT).
    pub async fn delete_template(&self, reference_id: &str) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM templates WHERE reference_id = ?")
            .bind(reference_id)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_fk(e, "template is referenced by deployments"))?;
        ensure_touched(res.rows_affected(), || format!("template {reference_id}"))
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a deployment in `pending` status and record the
    /// `deployment.created` usage event in the same transaction.
    pub async fn create_deployment(&self, new: NewDeployment) -> StoreResult<Deployment> {
        let reference_id = ident::new_ref(prefix::DEPLOYMENT);
        let now = Utc::now();
        let domains = serde_json::to_string(&new.domains)?;
        let variables = serde_json::to_string(&new.variables)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO deployments (reference_id, name, template_id, template_version, customer_id, node_id, status, variables, domains, containers, cpu_cores, memory_mb, disk_mb, proxy_port, error_message, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, '[]', ?, ?, ?, 0, '', ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.name)
        .bind(new.template_id)
        .bind(new.template_version)
        .bind(&new.customer_id)
        .bind(&new.node_id)
        .bind(&variables)
        .bind(&domains)
        .bind(new.resources.cpu_cores)
        .bind(new.resources.memory_mb)
        .bind(new.resources.disk_mb)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "deployment name already in use"))?;

        insert_usage_event(
            &mut tx,
            &NewUsageEvent {
                user_id: new.customer_id.clone(),
                event_type: event_kind::DEPLOYMENT_CREATED.to_string(),
                resource_id: reference_id.clone(),
                resource_type: "deployment".to_string(),
                quantity: 1,
                metadata: HashMap::new(),
            },
            now,
        )
        .await?;
        tx.commit().await?;

        debug!(%reference_id, name = %new.name, "deployment created");
        self.get_deployment(&reference_id).await
    }

    pub async fn get_deployment(&self, reference_id: &str) -> StoreResult<Deployment> {
        let row = sqlx::query("SELECT * FROM deployments WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_deployment(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("deployment {reference_id}")))
    }

    /// Resolve a hostname to its deployment by exact, case-insensitive
    /// match against any attached domain. Deleted deployments never match.
    pub async fn get_deployment_by_domain(&self, hostname: &str) -> StoreResult<Deployment> {
        let row = sqlx::query(
            "SELECT * FROM deployments WHERE status != 'deleted' AND EXISTS (
                 SELECT 1 FROM json_each(deployments.domains)
                 WHERE lower(json_extract(json_each.value, '$.hostname')) = lower(?)
             ) LIMIT 1",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_deployment(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("deployment for {hostname}")))
    }

    /// Count of deployments the proxy can route to.
    pub async fn count_routable_deployments(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments WHERE status = 'running' AND proxy_port > 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_deployments(&self) -> StoreResult<Vec<Deployment>> {
        let rows = sqlx::query("SELECT * FROM deployments WHERE status != 'deleted' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_deployment).collect()
    }

    pub async fn list_deployments_by_customer(&self, customer_id: &str) -> StoreResult<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE customer_id = ? AND status != 'deleted' ORDER BY id",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_deployment).collect()
    }

    pub async fn list_deployments_by_node(&self, node_id: &str) -> StoreResult<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE node_id = ? AND status != 'deleted' ORDER BY id",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_deployment).collect()
    }

    /// Count deployments (any live status) referencing a template.
    pub async fn count_deployments_for_template(&self, template_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments WHERE template_id = ? AND status != 'deleted'",
        )
        .bind(template_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Full-row update keyed by reference id. `updated_at` is refreshed.
    pub async fn update_deployment(&self, dep: &Deployment) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE deployments SET name = ?, node_id = ?, status = ?, variables = ?, domains = ?, containers = ?, cpu_cores = ?, memory_mb = ?, disk_mb = ?, proxy_port = ?, error_message = ?, updated_at = ?, started_at = ?, stopped_at = ? WHERE reference_id = ?",
        )
        .bind(&dep.name)
        .bind(&dep.node_id)
        .bind(dep.status.as_str())
        .bind(serde_json::to_string(&dep.variables)?)
        .bind(serde_json::to_string(&dep.domains)?)
        .bind(serde_json::to_string(&dep.containers)?)
        .bind(dep.resources.cpu_cores)
        .bind(dep.resources.memory_mb)
        .bind(dep.resources.disk_mb)
        .bind(dep.proxy_port as i64)
        .bind(&dep.error_message)
        .bind(fmt_ts(Utc::now()))
        .bind(dep.started_at.map(fmt_ts))
        .bind(dep.stopped_at.map(fmt_ts))
        .bind(&dep.reference_id)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "proxy port already allocated on node"))?;
        ensure_touched(res.rows_affected(), || format!("deployment {}", dep.reference_id))
    }

    /// Load, validate, and persist a single status transition.
    pub async fn transition_deployment(
        &self,
        reference_id: &str,
        to: DeploymentStatus,
    ) -> StoreResult<Deployment> {
        let mut dep = self.get_deployment(reference_id).await?;
        dep.transition(to)?;
        sqlx::query("UPDATE deployments SET status = ?, updated_at = ? WHERE reference_id = ?")
            .bind(to.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(reference_id)
            .execute(&self.pool)
            .await?;
        debug!(%reference_id, status = %to, "deployment transitioned");
        Ok(dep)
    }

    /// Hard-delete a deployment row (cascades container events). Normal
    /// deletion is the soft `deleted` status; this is for purging.
    pub async fn purge_deployment(&self, reference_id: &str) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM deployments WHERE reference_id = ?")
            .bind(reference_id)
            .execute(&self.pool)
            .await?;
        ensure_touched(res.rows_affected(), || format!("deployment {reference_id}"))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub async fn create_node(&self, new: NewNode) -> StoreResult<Node> {
        let reference_id = ident::new_ref(prefix::NODE);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO nodes (reference_id, name, creator_id, ssh_host, ssh_port, ssh_user, ssh_key_id, docker_socket, status, capabilities, cap_cpu_cores, cap_memory_mb, cap_disk_mb, location, provider, provision_id, base_domain, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.name)
        .bind(&new.creator_id)
        .bind(&new.ssh_host)
        .bind(if new.ssh_port == 0 { 22 } else { new.ssh_port as i64 })
        .bind(if new.ssh_user.is_empty() { "root" } else { new.ssh_user.as_str() })
        .bind(&new.ssh_key_id)
        .bind(if new.docker_socket.is_empty() {
            "/var/run/docker.sock"
        } else {
            new.docker_socket.as_str()
        })
        .bind(new.status.unwrap_or(NodeStatus::Offline).as_str())
        .bind(serde_json::to_string(&new.capabilities)?)
        .bind(new.capacity.cpu_cores)
        .bind(new.capacity.memory_mb)
        .bind(new.capacity.disk_mb)
        .bind(&new.location)
        .bind(new.provider.unwrap_or(ProviderKind::Manual).as_str())
        .bind(&new.provision_id)
        .bind(&new.base_domain)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "node name already in use"))?;
        self.get_node(&reference_id).await
    }

    pub async fn get_node(&self, reference_id: &str) -> StoreResult<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_node(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("node {reference_id}")))
    }

    /// Idempotency lookup for retryable provisioner steps.
    pub async fn get_node_by_creator_and_name(
        &self,
        creator_id: &str,
        name: &str,
    ) -> StoreResult<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE creator_id = ? AND name = ?")
            .bind(creator_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_node(&r)).transpose()
    }

    /// SSH host for a node, for the proxy's upstream resolution.
    pub async fn get_node_ssh_host(&self, reference_id: &str) -> StoreResult<String> {
        let host: Option<String> =
            sqlx::query_scalar("SELECT ssh_host FROM nodes WHERE reference_id = ?")
                .bind(reference_id)
                .fetch_optional(&self.pool)
                .await?;
        host.ok_or_else(|| StoreError::NotFound(format!("node {reference_id}")))
    }

    pub async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_node).collect()
    }

    /// All nodes the health checker probes: everything not in maintenance.
    pub async fn list_checkable_nodes(&self) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE status != 'maintenance' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_node).collect()
    }

    pub async fn update_node(&self, node: &Node) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE nodes SET name = ?, ssh_host = ?, ssh_port = ?, ssh_user = ?, ssh_key_id = ?, docker_socket = ?, status = ?, capabilities = ?, cap_cpu_cores = ?, cap_memory_mb = ?, cap_disk_mb = ?, used_cpu_cores = ?, used_memory_mb = ?, used_disk_mb = ?, location = ?, last_health_check = ?, error_message = ?, base_domain = ?, updated_at = ? WHERE reference_id = ?",
        )
        .bind(&node.name)
        .bind(&node.ssh_host)
        .bind(node.ssh_port as i64)
        .bind(&node.ssh_user)
        .bind(&node.ssh_key_id)
        .bind(&node.docker_socket)
        .bind(node.status.as_str())
        .bind(serde_json::to_string(&node.capabilities)?)
        .bind(node.capacity.cpu_cores)
        .bind(node.capacity.memory_mb)
        .bind(node.capacity.disk_mb)
        .bind(node.usage.cpu_cores)
        .bind(node.usage.memory_mb)
        .bind(node.usage.disk_mb)
        .bind(&node.location)
        .bind(node.last_health_check.map(fmt_ts))
        .bind(&node.error_message)
        .bind(&node.base_domain)
        .bind(fmt_ts(Utc::now()))
        .bind(&node.reference_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(res.rows_affected(), || format!("node {}", node.reference_id))
    }

    /// One-row health update written by the health checker each cycle.
    pub async fn update_node_health(
        &self,
        reference_id: &str,
        status: NodeStatus,
        error_message: &str,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE nodes SET status = ?, error_message = ?, last_health_check = ?, updated_at = ? WHERE reference_id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(fmt_ts(checked_at))
        .bind(fmt_ts(Utc::now()))
        .bind(reference_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(res.rows_affected(), || format!("node {reference_id}"))
    }

    pub async fn delete_node(&self, reference_id: &str) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM nodes WHERE reference_id = ?")
            .bind(reference_id)
            .execute(&self.pool)
            .await?;
        ensure_touched(res.rows_affected(), || format!("node {reference_id}"))
    }

    // ── SSH keys ───────────────────────────────────────────────────

    pub async fn create_ssh_key(&self, new: NewSshKey) -> StoreResult<SshKey> {
        let reference_id = ident::new_ref(prefix::SSH_KEY);
        sqlx::query(
            "INSERT INTO ssh_keys (reference_id, creator_id, name, encrypted_key, public_key, fingerprint, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.creator_id)
        .bind(&new.name)
        .bind(&new.encrypted_key)
        .bind(&new.public_key)
        .bind(&new.fingerprint)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "ssh key name already in use"))?;
        self.get_ssh_key(&reference_id).await
    }

    pub async fn get_ssh_key(&self, reference_id: &str) -> StoreResult<SshKey> {
        let row = sqlx::query("SELECT * FROM ssh_keys WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_ssh_key(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("ssh key {reference_id}")))
    }

    /// Idempotency lookup for retryable provisioner steps.
    pub async fn get_ssh_key_by_creator_and_name(
        &self,
        creator_id: &str,
        name: &str,
    ) -> StoreResult<Option<SshKey>> {
        let row = sqlx::query("SELECT * FROM ssh_keys WHERE creator_id = ? AND name = ?")
            .bind(creator_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_ssh_key(&r)).transpose()
    }

    pub async fn list_ssh_keys(&self, creator_id: &str) -> StoreResult<Vec<SshKey>> {
        let rows = sqlx::query("SELECT * FROM ssh_keys WHERE creator_id = ? ORDER BY name")
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_ssh_key).collect()
    }

    /// Delete a key. Nodes referencing it get a null key ref (FK SET NULL).
    pub async fn delete_ssh_key(&self, reference_id: &str) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM ssh_keys WHERE reference_id = ?")
            .bind(reference_id)
            .execute(&self.pool)
            .await?;
        ensure_touched(res.rows_affected(), || format!("ssh key {reference_id}"))
    }

    // ── Cloud credentials ──────────────────────────────────────────

    pub async fn create_credential(&self, new: NewCredential) -> StoreResult<CloudCredential> {
        let reference_id = ident::new_ref(prefix::CREDENTIAL);
        sqlx::query(
            "INSERT INTO cloud_credentials (reference_id, creator_id, name, provider, encrypted_credential, default_region, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.creator_id)
        .bind(&new.name)
        .bind(new.provider.as_str())
        .bind(&new.encrypted_credential)
        .bind(&new.default_region)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "credential name already in use"))?;
        self.get_credential(&reference_id).await
    }

    pub async fn get_credential(&self, reference_id: &str) -> StoreResult<CloudCredential> {
        let row = sqlx::query("SELECT * FROM cloud_credentials WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_credential(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("credential {reference_id}")))
    }

    pub async fn list_credentials(&self, creator_id: &str) -> StoreResult<Vec<CloudCredential>> {
        let rows = sqlx::query("SELECT * FROM cloud_credentials WHERE creator_id = ? ORDER BY name")
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_credential).collect()
    }

    /// Delete a credential. Fails with `Conflict` while provisions
    /// reference it (FK RESTRICT).
    pub async fn delete_credential(&self, reference_id: &str) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM cloud_credentials WHERE reference_id = ?")
            .bind(reference_id)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_fk(e, "credential is referenced by provisions"))?;
        ensure_touched(res.rows_affected(), || format!("credential {reference_id}"))
    }

    // ── Cloud provisions ───────────────────────────────────────────

    pub async fn create_provision(&self, new: NewProvision) -> StoreResult<CloudProvision> {
        let reference_id = ident::new_ref(prefix::PROVISION);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO cloud_provisions (reference_id, creator_id, credential_id, provider, status, instance_name, region, size, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(&reference_id)
        .bind(&new.creator_id)
        .bind(&new.credential_id)
        .bind(new.provider.as_str())
        .bind(&new.instance_name)
        .bind(&new.region)
        .bind(&new.size)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        self.get_provision(&reference_id).await
    }

    pub async fn get_provision(&self, reference_id: &str) -> StoreResult<CloudProvision> {
        let row = sqlx::query("SELECT * FROM cloud_provisions WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_provision(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("provision {reference_id}")))
    }

    pub async fn list_provisions(&self, creator_id: &str) -> StoreResult<Vec<CloudProvision>> {
        let rows = sqlx::query("SELECT * FROM cloud_provisions WHERE creator_id = ? ORDER BY id DESC")
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_provision).collect()
    }

    /// All provisions the provisioner still has work for.
    pub async fn list_active_provisions(&self) -> StoreResult<Vec<CloudProvision>> {
        let rows = sqlx::query(
            "SELECT * FROM cloud_provisions WHERE status NOT IN ('ready', 'destroyed', 'failed') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_provision).collect()
    }

    /// Full-row update keyed by reference id. `updated_at` is refreshed.
    pub async fn update_provision(&self, prov: &CloudProvision) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE cloud_provisions SET status = ?, provider_instance_id = ?, public_ip = ?, node_id = ?, ssh_key_id = ?, current_step = ?, error_message = ?, updated_at = ?, completed_at = ? WHERE reference_id = ?",
        )
        .bind(prov.status.as_str())
        .bind(&prov.provider_instance_id)
        .bind(&prov.public_ip)
        .bind(&prov.node_id)
        .bind(&prov.ssh_key_id)
        .bind(&prov.current_step)
        .bind(&prov.error_message)
        .bind(fmt_ts(Utc::now()))
        .bind(prov.completed_at.map(fmt_ts))
        .bind(&prov.reference_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(res.rows_affected(), || format!("provision {}", prov.reference_id))
    }

    /// Load, validate, and persist a single status transition.
    pub async fn transition_provision(
        &self,
        reference_id: &str,
        to: ProvisionStatus,
    ) -> StoreResult<CloudProvision> {
        let mut prov = self.get_provision(reference_id).await?;
        prov.transition(to)?;
        sqlx::query(
            "UPDATE cloud_provisions SET status = ?, updated_at = ? WHERE reference_id = ?",
        )
        .bind(to.as_str())
        .bind(fmt_ts(Utc::now()))
        .bind(reference_id)
        .execute(&self.pool)
        .await?;
        debug!(%reference_id, status = %to, "provision transitioned");
        Ok(prov)
    }

    // ── Usage events ───────────────────────────────────────────────

    pub async fn record_usage_event(&self, new: NewUsageEvent) -> StoreResult<UsageEvent> {
        let mut tx = self.pool.begin().await?;
        let reference_id = insert_usage_event(&mut tx, &new, Utc::now()).await?;
        tx.commit().await?;
        self.get_usage_event(&reference_id).await
    }

    pub async fn get_usage_event(&self, reference_id: &str) -> StoreResult<UsageEvent> {
        let row = sqlx::query("SELECT * FROM usage_events WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_usage_event(&r))
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("usage event {reference_id}")))
    }

    /// Ordered-by-timestamp batch of events awaiting report. The partial
    /// index over `reported_at IS NULL` serves this as an outbox queue.
    pub async fn get_unreported_events(&self, limit: usize) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_events WHERE reported_at IS NULL ORDER BY timestamp, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_usage_event).collect()
    }

    /// Atomically stamp a batch of events as reported.
    pub async fn mark_events_reported(&self, ids: &[i64], at: DateTime<Utc>) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("UPDATE usage_events SET reported_at = ? WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(fmt_ts(at));
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_usage_events(&self, user_id: &str, limit: usize) -> StoreResult<Vec<UsageEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_events WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_usage_event).collect()
    }

    // ── Container events ───────────────────────────────────────────

    pub async fn record_container_event(
        &self,
        deployment_id: i64,
        kind: &str,
        container_name: &str,
        message: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO container_events (reference_id, deployment_id, kind, container_name, message, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ident::new_ref(prefix::EVENT))
        .bind(deployment_id)
        .bind(kind)
        .bind(container_name)
        .bind(message)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_container_events(
        &self,
        deployment_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<ContainerEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM container_events WHERE deployment_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(deployment_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_container_event).collect()
    }
}

// ── Shared insert helpers ─────────────────────────────────────────

/// Insert a usage event inside an open transaction; returns its ref id.
pub async fn insert_usage_event(
    tx: &mut Tx,
    new: &NewUsageEvent,
    timestamp: DateTime<Utc>,
) -> StoreResult<String> {
    let reference_id = ident::new_ref(prefix::EVENT);
    sqlx::query(
        "INSERT INTO usage_events (reference_id, user_id, event_type, resource_id, resource_type, quantity, metadata, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&reference_id)
    .bind(&new.user_id)
    .bind(&new.event_type)
    .bind(&new.resource_id)
    .bind(&new.resource_type)
    .bind(if new.quantity == 0 { 1 } else { new.quantity })
    .bind(serde_json::to_string(&new.metadata)?)
    .bind(fmt_ts(timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(reference_id)
}

// ── Row mapping ───────────────────────────────────────────────────

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> StoreResult<T> {
    serde_json::from_str(s).map_err(StoreError::from)
}

fn ensure_touched(rows: u64, entity: impl FnOnce() -> String) -> StoreResult<()> {
    if rows == 0 {
        Err(StoreError::NotFound(entity()))
    } else {
        Ok(())
    }
}

fn conflict_on_unique(e: sqlx::Error, msg: &str) -> StoreError {
    let wrapped = StoreError::Database(e);
    if wrapped.is_unique_violation() {
        StoreError::Conflict(msg.to_string())
    } else {
        wrapped
    }
}

fn conflict_on_fk(e: sqlx::Error, msg: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.message().contains("FOREIGN KEY constraint failed") {
            return StoreError::Conflict(msg.to_string());
        }
    }
    StoreError::Database(e)
}

fn parse_status(s: &str) -> StoreResult<DeploymentStatus> {
    DeploymentStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("deployment status {s:?}")))
}

fn map_template(row: &SqliteRow) -> StoreResult<Template> {
    Ok(Template {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        slug: row.try_get("slug")?,
        version: row.try_get("version")?,
        compose_spec: row.try_get("compose_spec")?,
        variables: from_json(row.try_get::<String, _>("variables")?.as_str())?,
        resources: ResourceLimits {
            cpu_cores: row.try_get("cpu_cores")?,
            memory_mb: row.try_get("memory_mb")?,
            disk_mb: row.try_get("disk_mb")?,
        },
        price_cents: row.try_get("price_cents")?,
        category: row.try_get("category")?,
        tags: from_json(row.try_get::<String, _>("tags")?.as_str())?,
        required_capabilities: from_json(row.try_get::<String, _>("required_capabilities")?.as_str())?,
        published: row.try_get("published")?,
        creator_id: row.try_get("creator_id")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_ts(row.try_get::<String, _>("updated_at")?.as_str())?,
    })
}

fn map_deployment(row: &SqliteRow) -> StoreResult<Deployment> {
    let status: String = row.try_get("status")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        template_version: row.try_get("template_version")?,
        customer_id: row.try_get("customer_id")?,
        node_id: row.try_get("node_id")?,
        status: parse_status(&status)?,
        variables: from_json(row.try_get::<String, _>("variables")?.as_str())?,
        domains: from_json(row.try_get::<String, _>("domains")?.as_str())?,
        containers: from_json(row.try_get::<String, _>("containers")?.as_str())?,
        resources: ResourceLimits {
            cpu_cores: row.try_get("cpu_cores")?,
            memory_mb: row.try_get("memory_mb")?,
            disk_mb: row.try_get("disk_mb")?,
        },
        proxy_port: row.try_get::<i64, _>("proxy_port")? as u16,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_ts(row.try_get::<String, _>("updated_at")?.as_str())?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        stopped_at: parse_opt_ts(row.try_get("stopped_at")?)?,
    })
}

fn map_node(row: &SqliteRow) -> StoreResult<Node> {
    let status: String = row.try_get("status")?;
    let provider: String = row.try_get("provider")?;
    Ok(Node {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        name: row.try_get("name")?,
        creator_id: row.try_get("creator_id")?,
        ssh_host: row.try_get("ssh_host")?,
        ssh_port: row.try_get::<i64, _>("ssh_port")? as u16,
        ssh_user: row.try_get("ssh_user")?,
        ssh_key_id: row.try_get("ssh_key_id")?,
        docker_socket: row.try_get("docker_socket")?,
        status: NodeStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("node status {status:?}")))?,
        capabilities: from_json(row.try_get::<String, _>("capabilities")?.as_str())?,
        capacity: ResourceLimits {
            cpu_cores: row.try_get("cap_cpu_cores")?,
            memory_mb: row.try_get("cap_memory_mb")?,
            disk_mb: row.try_get("cap_disk_mb")?,
        },
        usage: ResourceLimits {
            cpu_cores: row.try_get("used_cpu_cores")?,
            memory_mb: row.try_get("used_memory_mb")?,
            disk_mb: row.try_get("used_disk_mb")?,
        },
        location: row.try_get("location")?,
        last_health_check: parse_opt_ts(row.try_get("last_health_check")?)?,
        error_message: row.try_get("error_message")?,
        provider: ProviderKind::parse(&provider)
            .ok_or_else(|| StoreError::Corrupt(format!("provider {provider:?}")))?,
        provision_id: row.try_get("provision_id")?,
        base_domain: row.try_get("base_domain")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_ts(row.try_get::<String, _>("updated_at")?.as_str())?,
    })
}

fn map_ssh_key(row: &SqliteRow) -> StoreResult<SshKey> {
    Ok(SshKey {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        creator_id: row.try_get("creator_id")?,
        name: row.try_get("name")?,
        encrypted_key: row.try_get("encrypted_key")?,
        public_key: row.try_get("public_key")?,
        fingerprint: row.try_get("fingerprint")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
    })
}

fn map_credential(row: &SqliteRow) -> StoreResult<CloudCredential> {
    let provider: String = row.try_get("provider")?;
    Ok(CloudCredential {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        creator_id: row.try_get("creator_id")?,
        name: row.try_get("name")?,
        provider: ProviderKind::parse(&provider)
            .ok_or_else(|| StoreError::Corrupt(format!("provider {provider:?}")))?,
        encrypted_credential: row.try_get("encrypted_credential")?,
        default_region: row.try_get("default_region")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
    })
}

fn map_provision(row: &SqliteRow) -> StoreResult<CloudProvision> {
    let status: String = row.try_get("status")?;
    let provider: String = row.try_get("provider")?;
    Ok(CloudProvision {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        creator_id: row.try_get("creator_id")?,
        credential_id: row.try_get("credential_id")?,
        provider: ProviderKind::parse(&provider)
            .ok_or_else(|| StoreError::Corrupt(format!("provider {provider:?}")))?,
        status: ProvisionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("provision status {status:?}")))?,
        instance_name: row.try_get("instance_name")?,
        region: row.try_get("region")?,
        size: row.try_get("size")?,
        provider_instance_id: row.try_get("provider_instance_id")?,
        public_ip: row.try_get("public_ip")?,
        node_id: row.try_get("node_id")?,
        ssh_key_id: row.try_get("ssh_key_id")?,
        current_step: row.try_get("current_step")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_ts(row.try_get::<String, _>("updated_at")?.as_str())?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
    })
}

fn map_usage_event(row: &SqliteRow) -> StoreResult<UsageEvent> {
    Ok(UsageEvent {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        user_id: row.try_get("user_id")?,
        event_type: row.try_get("event_type")?,
        resource_id: row.try_get("resource_id")?,
        resource_type: row.try_get("resource_type")?,
        quantity: row.try_get("quantity")?,
        metadata: from_json(row.try_get::<String, _>("metadata")?.as_str())?,
        timestamp: parse_ts(row.try_get::<String, _>("timestamp")?.as_str())?,
        reported_at: parse_opt_ts(row.try_get("reported_at")?)?,
    })
}

fn map_container_event(row: &SqliteRow) -> StoreResult<ContainerEvent> {
    Ok(ContainerEvent {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        deployment_id: row.try_get("deployment_id")?,
        kind: row.try_get("kind")?,
        container_name: row.try_get("container_name")?,
        message: row.try_get("message")?,
        created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
    })
}
