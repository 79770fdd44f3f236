use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::RegistryError;

/// A remote node as observed from the registry at one point in time: a
/// transient record, not a stored entity. The same `id` may appear multiple
/// times, once per advertised mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub any_mode: bool,
    /// Unix seconds of the node's last heartbeat.
    pub last_update: i64,
    pub analysis_mode: String,
    pub workload_count: i64,
}

impl RemoteNode {
    /// A node is live iff `now - last_update <= max_age_seconds`.
    pub fn is_live(&self, now: i64, max_age_seconds: i64) -> bool {
        now.saturating_sub(self.last_update) <= max_age_seconds
    }
}

/// Read-only view of currently live remote nodes and the analysis modes each
/// advertises.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Every record where the node is non-local, belongs to `company_id`, is
    /// live under `max_age_seconds`, and either advertises `any_mode=true` or
    /// advertises at least one mode in `modes`. Ordered by
    /// `(workload_count asc, last_update asc)`; the group re-sorts as needed.
    async fn snapshot(
        &self,
        database: &str,
        modes: &[String],
        max_age_seconds: i64,
        company_id: &str,
    ) -> Result<Vec<RemoteNode>, RegistryError>;
}

/// `sqlx`-backed registry querying one of several named `SqlitePool`s. A group
/// is configured with the logical `database` name of the node-status backend
/// it reads from.
pub struct SqlNodeRegistry {
    pools: HashMap<String, SqlitePool>,
}

impl SqlNodeRegistry {
    pub fn new(pools: HashMap<String, SqlitePool>) -> Self {
        Self { pools }
    }

    pub async fn connect_one(database: &str, url: &str) -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        let mut pools = HashMap::new();
        pools.insert(database.to_string(), pool);
        Ok(Self { pools })
    }
}

#[async_trait]
impl NodeRegistry for SqlNodeRegistry {
    async fn snapshot(
        &self,
        database: &str,
        modes: &[String],
        max_age_seconds: i64,
        company_id: &str,
    ) -> Result<Vec<RemoteNode>, RegistryError> {
        let pool = self
            .pools
            .get(database)
            .ok_or_else(|| RegistryError::UnknownDatabase(database.to_string()))?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let mode_clause = if modes.is_empty() {
            String::new()
        } else {
            let placeholders = modes.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            format!("OR node_modes.analysis_mode IN ({placeholders})")
        };

        // Liveness is filtered in Rust below via `RemoteNode::is_live`, not in
        // this predicate, so there is exactly one place that encodes "now -
        // last_update <= max_age_seconds".
        let sql = format!(
            r#"
            SELECT
                nodes.id AS id,
                nodes.name AS name,
                nodes.location AS location,
                nodes.any_mode AS any_mode,
                nodes.last_update AS last_update,
                node_modes.analysis_mode AS analysis_mode,
                COUNT(workload.id) AS workload_count
            FROM nodes
            LEFT JOIN node_modes ON nodes.id = node_modes.node_id
            LEFT JOIN workload ON nodes.id = workload.node_id
            WHERE nodes.company_id = ?
              AND nodes.is_local = 0
              AND (nodes.any_mode {mode_clause})
            GROUP BY nodes.id, nodes.name, nodes.location, nodes.any_mode, nodes.last_update, node_modes.analysis_mode
            ORDER BY workload_count ASC, nodes.last_update ASC
            "#
        );

        let mut query = sqlx::query(&sql).bind(company_id);
        for mode in modes {
            query = query.bind(mode);
        }

        let rows = query.fetch_all(pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| RemoteNode {
                id: r.get("id"),
                name: r.get("name"),
                location: r.get("location"),
                any_mode: r.get::<i64, _>("any_mode") != 0,
                last_update: r.get("last_update"),
                analysis_mode: r.get::<Option<String>, _>("analysis_mode").unwrap_or_default(),
                workload_count: r.get("workload_count"),
            })
            .filter(|node| node.is_live(now, max_age_seconds))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_uses_twice_heartbeat_window_correctly() {
        let node = RemoteNode {
            id: 1,
            name: "n1".into(),
            location: "https://n1".into(),
            any_mode: false,
            last_update: 1_000,
            analysis_mode: "alerts".into(),
            workload_count: 0,
        };
        assert!(node.is_live(1_000 + 60, 60));
        assert!(!node.is_live(1_000 + 61, 60));
    }

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE nodes (id INTEGER PRIMARY KEY, name TEXT, location TEXT, any_mode INTEGER, last_update INTEGER, company_id TEXT, is_local INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE node_modes (node_id INTEGER, analysis_mode TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE workload (id INTEGER PRIMARY KEY, node_id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        pool
    }

    #[tokio::test]
    async fn snapshot_filters_by_tenant_liveness_and_mode() {
        let pool = seeded_pool().await;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        // Live node advertising "alerts" for tenant "acme".
        sqlx::query("INSERT INTO nodes VALUES (1, 'n1', 'https://n1', 0, ?1, 'acme', 0)")
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO node_modes VALUES (1, 'alerts')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO workload (node_id) VALUES (1), (1)")
            .execute(&pool)
            .await
            .unwrap();

        // Dead node, same tenant and mode.
        sqlx::query("INSERT INTO nodes VALUES (2, 'n2', 'https://n2', 0, ?1, 'acme', 0)")
            .bind(now - 10_000)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO node_modes VALUES (2, 'alerts')")
            .execute(&pool)
            .await
            .unwrap();

        // Live node, wrong tenant.
        sqlx::query("INSERT INTO nodes VALUES (3, 'n3', 'https://n3', 0, ?1, 'other', 0)")
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO node_modes VALUES (3, 'alerts')")
            .execute(&pool)
            .await
            .unwrap();

        // Local node, should be excluded.
        sqlx::query("INSERT INTO nodes VALUES (4, 'n4', 'https://n4', 0, ?1, 'acme', 1)")
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO node_modes VALUES (4, 'alerts')")
            .execute(&pool)
            .await
            .unwrap();

        let mut pools = HashMap::new();
        pools.insert("default".to_string(), pool);
        let registry = SqlNodeRegistry::new(pools);

        let nodes = registry
            .snapshot("default", &["alerts".to_string()], 60, "acme")
            .await
            .unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 1);
        assert_eq!(nodes[0].workload_count, 2);
    }
}
