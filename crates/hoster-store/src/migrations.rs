//! Sequential schema migrations.
//!
//! Each migration is an `(version, name, up, down)` tuple applied inside
//! its own transaction and recorded in `schema_migrations`. Startup runs
//! every pending migration in order.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// A single schema migration.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// All known migrations, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_tables",
        up: r#"
CREATE TABLE templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    slug TEXT NOT NULL UNIQUE,
    version INTEGER NOT NULL DEFAULT 1,
    compose_spec TEXT NOT NULL,
    variables TEXT NOT NULL DEFAULT '[]',
    cpu_cores REAL NOT NULL DEFAULT 0,
    memory_mb INTEGER NOT NULL DEFAULT 0,
    disk_mb INTEGER NOT NULL DEFAULT 0,
    price_cents INTEGER NOT NULL DEFAULT 0,
    category TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    required_capabilities TEXT NOT NULL DEFAULT '[]',
    published INTEGER NOT NULL DEFAULT 0,
    creator_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE ssh_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    creator_id TEXT NOT NULL,
    name TEXT NOT NULL,
    encrypted_key BLOB NOT NULL,
    public_key TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (creator_id, name)
);

CREATE TABLE nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    creator_id TEXT NOT NULL,
    ssh_host TEXT NOT NULL DEFAULT '',
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_user TEXT NOT NULL DEFAULT 'root',
    ssh_key_id TEXT REFERENCES ssh_keys(reference_id) ON DELETE SET NULL,
    docker_socket TEXT NOT NULL DEFAULT '/var/run/docker.sock',
    status TEXT NOT NULL DEFAULT 'offline',
    capabilities TEXT NOT NULL DEFAULT '["standard"]',
    cap_cpu_cores REAL NOT NULL DEFAULT 0,
    cap_memory_mb INTEGER NOT NULL DEFAULT 0,
    cap_disk_mb INTEGER NOT NULL DEFAULT 0,
    used_cpu_cores REAL NOT NULL DEFAULT 0,
    used_memory_mb INTEGER NOT NULL DEFAULT 0,
    used_disk_mb INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT '',
    last_health_check TEXT,
    error_message TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT 'manual',
    provision_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (creator_id, name)
);

CREATE TABLE deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    template_id INTEGER NOT NULL REFERENCES templates(id) ON DELETE RESTRICT,
    template_version INTEGER NOT NULL DEFAULT 1,
    customer_id TEXT NOT NULL,
    node_id TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    variables TEXT NOT NULL DEFAULT '{}',
    domains TEXT NOT NULL DEFAULT '[]',
    containers TEXT NOT NULL DEFAULT '[]',
    cpu_cores REAL NOT NULL DEFAULT 0,
    memory_mb INTEGER NOT NULL DEFAULT 0,
    disk_mb INTEGER NOT NULL DEFAULT 0,
    proxy_port INTEGER NOT NULL DEFAULT 0,
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    stopped_at TEXT
);

CREATE UNIQUE INDEX idx_deployments_name_live
    ON deployments(name) WHERE status != 'deleted';
CREATE UNIQUE INDEX idx_deployments_node_port
    ON deployments(node_id, proxy_port) WHERE proxy_port > 0;
CREATE INDEX idx_deployments_node ON deployments(node_id);
CREATE INDEX idx_deployments_customer ON deployments(customer_id);
"#,
        down: r#"
DROP TABLE deployments;
DROP TABLE nodes;
DROP TABLE ssh_keys;
DROP TABLE templates;
"#,
    },
    Migration {
        version: 2,
        name: "cloud_provisioning",
        up: r#"
CREATE TABLE cloud_credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    creator_id TEXT NOT NULL,
    name TEXT NOT NULL,
    provider TEXT NOT NULL,
    encrypted_credential BLOB NOT NULL,
    default_region TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE (creator_id, name)
);

CREATE TABLE cloud_provisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    creator_id TEXT NOT NULL,
    credential_id TEXT NOT NULL REFERENCES cloud_credentials(reference_id) ON DELETE RESTRICT,
    provider TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    instance_name TEXT NOT NULL,
    region TEXT NOT NULL,
    size TEXT NOT NULL,
    provider_instance_id TEXT,
    public_ip TEXT,
    node_id TEXT,
    ssh_key_id TEXT,
    current_step TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX idx_provisions_status ON cloud_provisions(status);
"#,
        down: r#"
DROP TABLE cloud_provisions;
DROP TABLE cloud_credentials;
"#,
    },
    Migration {
        version: 3,
        name: "events",
        up: r#"
CREATE TABLE usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL,
    reported_at TEXT
);

CREATE INDEX idx_usage_events_unreported
    ON usage_events(timestamp) WHERE reported_at IS NULL;

CREATE TABLE container_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_id TEXT NOT NULL UNIQUE,
    deployment_id INTEGER NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    container_name TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX idx_container_events_deployment ON container_events(deployment_id);
"#,
        down: r#"
DROP TABLE container_events;
DROP TABLE usage_events;
"#,
    },
    Migration {
        version: 4,
        name: "node_base_domain",
        up: "ALTER TABLE nodes ADD COLUMN base_domain TEXT;",
        down: "ALTER TABLE nodes DROP COLUMN base_domain;",
    },
];

/// Apply every pending migration in order.
pub async fn run(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;

    for m in MIGRATIONS {
        if applied.contains(&m.version) {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(m.up)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(format!("{} ({}): {e}", m.version, m.name)))?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(m.version)
            .bind(m.name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version = m.version, name = m.name, "migration applied");
    }

    Ok(())
}

/// Revert the most recently applied migration. Used by tests and
/// operator tooling; normal startup never calls this.
pub async fn revert_last(pool: &SqlitePool) -> StoreResult<()> {
    let latest: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(pool)
            .await?;
    let Some(version) = latest else {
        return Ok(());
    };
    let m = MIGRATIONS
        .iter()
        .find(|m| m.version == version)
        .ok_or_else(|| StoreError::Migration(format!("unknown applied version {version}")))?;

    let mut tx = pool.begin().await?;
    sqlx::raw_sql(m.down)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Migration(format!("{} ({}) down: {e}", m.version, m.name)))?;
    sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(version, name = m.name, "migration reverted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_sequential_from_one() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i64 + 1);
        }
    }
}
