// ABOUTME: Schema inspector seam and its PostgreSQL catalog implementation
// ABOUTME: Reads tables, constraints, indexes, functions, policies, roles and publications

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;

use super::models::ConnectionInfo;
use super::postgres::connect;
use crate::schema::{
    Column, Constraint, DatabaseSchema, Extension, Function, Index, Policy, Publication, Role,
    Table, Trigger, View,
};

/// Schemas owned by the hosting platform; recreated by the platform itself.
const MANAGED_SCHEMAS: &[&str] = &[
    "information_schema",
    "auth",
    "storage",
    "realtime",
    "extensions",
    "graphql",
    "graphql_public",
    "pgbouncer",
    "pgsodium",
    "pgsodium_masks",
    "vault",
    "net",
    "cron",
    "supabase_functions",
    "supabase_migrations",
];

const MANAGED_ROLES: &[&str] = &[
    "postgres",
    "anon",
    "authenticated",
    "authenticator",
    "service_role",
    "dashboard_user",
    "pgbouncer",
    "supabase_admin",
    "supabase_auth_admin",
    "supabase_storage_admin",
    "supabase_functions_admin",
    "supabase_replication_admin",
    "supabase_read_only_user",
    "supabase_realtime_admin",
];

/// Read-only access to a database's structure. Safe to retry.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn get_complete_schema(&self, connection: &ConnectionInfo) -> Result<DatabaseSchema>;
}

#[derive(Debug, Default, Clone)]
pub struct PostgresInspector;

impl PostgresInspector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SchemaInspector for PostgresInspector {
    async fn get_complete_schema(&self, connection: &ConnectionInfo) -> Result<DatabaseSchema> {
        let client = connect(connection).await?;
        let managed: Vec<&str> = MANAGED_SCHEMAS.to_vec();

        let extensions = client
            .query(
                "SELECT e.extname, n.nspname FROM pg_extension e \
                 JOIN pg_namespace n ON n.oid = e.extnamespace \
                 WHERE e.extname <> 'plpgsql' ORDER BY e.extname",
                &[],
            )
            .await
            .context("Failed to list extensions")?
            .iter()
            .map(|row| Extension {
                name: row.get(0),
                schema: row.get(1),
            })
            .collect();

        let mut tables: Vec<Table> = client
            .query(
                "SELECT n.nspname, c.relname, c.relrowsecurity FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relkind IN ('r', 'p') AND n.nspname <> ALL($1) \
                 AND n.nspname NOT LIKE 'pg\\_%' ORDER BY 1, 2",
                &[&managed],
            )
            .await
            .context("Failed to list tables")?
            .iter()
            .map(|row| Table {
                schema: row.get(0),
                name: row.get(1),
                rls_enabled: row.get(2),
                columns: Vec::new(),
                constraints: Vec::new(),
            })
            .collect();

        let mut columns: HashMap<(String, String), Vec<Column>> = HashMap::new();
        for row in client
            .query(
                "SELECT n.nspname, c.relname, a.attname, format_type(a.atttypid, a.atttypmod), \
                 NOT a.attnotnull, pg_get_expr(d.adbin, d.adrelid) \
                 FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
                 WHERE c.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped \
                 AND n.nspname <> ALL($1) AND n.nspname NOT LIKE 'pg\\_%' \
                 ORDER BY n.nspname, c.relname, a.attnum",
                &[&managed],
            )
            .await
            .context("Failed to list columns")?
        {
            columns
                .entry((row.get(0), row.get(1)))
                .or_default()
                .push(Column {
                    name: row.get(2),
                    data_type: row.get(3),
                    nullable: row.get(4),
                    default: row.get(5),
                });
        }

        let mut constraints: HashMap<(String, String), Vec<Constraint>> = HashMap::new();
        for row in client
            .query(
                "SELECT n.nspname, c.relname, con.conname, pg_get_constraintdef(con.oid) \
                 FROM pg_constraint con \
                 JOIN pg_class c ON c.oid = con.conrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE con.contype IN ('p', 'u', 'c', 'f', 'x') \
                 AND n.nspname <> ALL($1) AND n.nspname NOT LIKE 'pg\\_%' \
                 ORDER BY n.nspname, c.relname, con.conname",
                &[&managed],
            )
            .await
            .context("Failed to list constraints")?
        {
            constraints
                .entry((row.get(0), row.get(1)))
                .or_default()
                .push(Constraint {
                    name: row.get(2),
                    definition: row.get(3),
                });
        }

        for table in &mut tables {
            let key = (table.schema.clone(), table.name.clone());
            table.columns = columns.remove(&key).unwrap_or_default();
            table.constraints = constraints.remove(&key).unwrap_or_default();
        }

        let indexes = client
            .query(
                "SELECT i.schemaname, i.tablename, i.indexname, i.indexdef FROM pg_indexes i \
                 WHERE i.schemaname <> ALL($1) AND i.schemaname NOT LIKE 'pg\\_%' \
                 AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conname = i.indexname) \
                 ORDER BY 1, 2, 3",
                &[&managed],
            )
            .await
            .context("Failed to list indexes")?
            .iter()
            .map(|row| Index {
                schema: row.get(0),
                table: row.get(1),
                name: row.get(2),
                definition: row.get(3),
            })
            .collect();

        let views = client
            .query(
                "SELECT schemaname, viewname, definition FROM pg_views \
                 WHERE schemaname <> ALL($1) AND schemaname NOT LIKE 'pg\\_%' ORDER BY 1, 2",
                &[&managed],
            )
            .await
            .context("Failed to list views")?
            .iter()
            .map(|row| View {
                schema: row.get(0),
                name: row.get(1),
                definition: row.get(2),
            })
            .collect();

        let functions = client
            .query(
                "SELECT n.nspname, p.proname, pg_get_functiondef(p.oid) FROM pg_proc p \
                 JOIN pg_namespace n ON n.oid = p.pronamespace \
                 WHERE p.prokind IN ('f', 'p') AND n.nspname <> ALL($1) \
                 AND n.nspname NOT LIKE 'pg\\_%' \
                 AND NOT EXISTS (SELECT 1 FROM pg_depend dep WHERE dep.objid = p.oid AND dep.deptype = 'e') \
                 ORDER BY 1, 2",
                &[&managed],
            )
            .await
            .context("Failed to list functions")?
            .iter()
            .map(|row| Function {
                schema: row.get(0),
                name: row.get(1),
                definition: row.get(2),
            })
            .collect();

        let triggers = client
            .query(
                "SELECT n.nspname, c.relname, t.tgname, pg_get_triggerdef(t.oid) FROM pg_trigger t \
                 JOIN pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE NOT t.tgisinternal AND n.nspname <> ALL($1) \
                 AND n.nspname NOT LIKE 'pg\\_%' ORDER BY 1, 2, 3",
                &[&managed],
            )
            .await
            .context("Failed to list triggers")?
            .iter()
            .map(|row| Trigger {
                schema: row.get(0),
                table: row.get(1),
                name: row.get(2),
                definition: row.get(3),
            })
            .collect();

        let policies = client
            .query(
                "SELECT schemaname::text, tablename::text, policyname::text, cmd, \
                 permissive = 'PERMISSIVE', roles::text[], qual, with_check FROM pg_policies \
                 WHERE schemaname <> ALL($1) ORDER BY 1, 2, 3",
                &[&managed],
            )
            .await
            .context("Failed to list row-level security policies")?
            .iter()
            .map(|row| Policy {
                schema: row.get(0),
                table: row.get(1),
                name: row.get(2),
                command: row.get(3),
                permissive: row.get(4),
                roles: row.get(5),
                using: row.get(6),
                with_check: row.get(7),
            })
            .collect();

        let managed_roles: Vec<&str> = MANAGED_ROLES.to_vec();
        let roles = client
            .query(
                "SELECT rolname::text, rolcanlogin, rolinherit FROM pg_roles \
                 WHERE rolname !~ '^pg_' AND rolname <> ALL($1) ORDER BY 1",
                &[&managed_roles],
            )
            .await
            .context("Failed to list roles")?
            .iter()
            .map(|row| Role {
                name: row.get(0),
                can_login: row.get(1),
                inherit: row.get(2),
            })
            .collect();

        let publications = client
            .query(
                "SELECT p.pubname::text, p.puballtables, p.pubinsert, p.pubupdate, p.pubdelete, \
                 p.pubtruncate, \
                 COALESCE(array_agg(pt.schemaname || '.' || pt.tablename) \
                   FILTER (WHERE pt.tablename IS NOT NULL), '{}')::text[] \
                 FROM pg_publication p \
                 LEFT JOIN pg_publication_tables pt ON pt.pubname = p.pubname \
                 GROUP BY p.pubname, p.puballtables, p.pubinsert, p.pubupdate, p.pubdelete, p.pubtruncate \
                 ORDER BY 1",
                &[],
            )
            .await
            .context("Failed to list publications")?
            .iter()
            .map(|row| {
                let all_tables: bool = row.get(1);
                let operations = ["insert", "update", "delete", "truncate"]
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| row.get::<_, bool>(i + 2))
                    .map(|(_, op)| op.to_string())
                    .collect();
                Publication {
                    name: row.get(0),
                    all_tables,
                    tables: if all_tables { Vec::new() } else { row.get(6) },
                    operations,
                }
            })
            .collect();

        tracing::debug!(tables = tables.len(), "Inspected database schema");

        Ok(DatabaseSchema {
            extensions,
            tables,
            indexes,
            views,
            functions,
            triggers,
            policies,
            roles,
            publications,
        })
    }
}
