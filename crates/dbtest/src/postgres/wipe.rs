//! Dropping everything tests created on a PostgreSQL server.
//!
//! Databases, schemas and roles are dropped wholesale. The server's own
//! bookkeeping (the maintenance database, the templates, the system
//! schemas and the built-in roles) is never touched.

use sqlx::{Executor, PgPool};
use tracing::debug;

use crate::error::DriverError;

use super::NAME;

/// Databases that belong to the server and survive a wipe.
pub const EXCLUDED_DATABASES: &[&str] = &["postgres", "template0", "template1"];

/// System schemas that survive a wipe. Every other `pg_`-prefixed schema
/// (per-session temp and toast schemas) is kept as well.
pub const EXCLUDED_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "pg_toast"];

/// Roles that survive a wipe: the superuser the driver connects as. The
/// predefined `pg_`-prefixed roles are kept as well.
pub const EXCLUDED_ROLES: &[&str] = &["postgres"];

/// Schema recreated empty after a wipe so unqualified DDL keeps working.
const DEFAULT_SCHEMA: &str = "public";

pub fn is_excluded_database(name: &str) -> bool {
    EXCLUDED_DATABASES.contains(&name)
}

pub fn is_excluded_schema(name: &str) -> bool {
    EXCLUDED_SCHEMAS.contains(&name) || name.starts_with("pg_")
}

pub fn is_excluded_role(name: &str) -> bool {
    EXCLUDED_ROLES.contains(&name) || name.starts_with("pg_")
}

/// Quote an identifier for interpolation into DDL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Drop every non-system database, every non-system schema of the
/// database `pool` is connected to and every non-system role, then
/// recreate `public`.
pub async fn wipe_server(pool: &PgPool) -> Result<(), DriverError> {
    let databases: Vec<String> =
        sqlx::query_scalar("SELECT datname::text FROM pg_database WHERE NOT datistemplate")
            .fetch_all(pool)
            .await
            .map_err(|e| DriverError::backend(NAME, "list databases", e))?;

    for db in databases.iter().filter(|d| !is_excluded_database(d)) {
        debug!(database = %db, "dropping database");
        // FORCE terminates sessions tests left open on it.
        let stmt = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(db));
        pool.execute(stmt.as_str())
            .await
            .map_err(|e| DriverError::backend(NAME, "drop database", e))?;
    }

    let schemas: Vec<String> = sqlx::query_scalar("SELECT nspname::text FROM pg_namespace")
        .fetch_all(pool)
        .await
        .map_err(|e| DriverError::backend(NAME, "list schemas", e))?;

    for schema in schemas.iter().filter(|s| !is_excluded_schema(s)) {
        debug!(schema = %schema, "dropping schema");
        let stmt = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema));
        pool.execute(stmt.as_str())
            .await
            .map_err(|e| DriverError::backend(NAME, "drop schema", e))?;
    }

    let roles: Vec<String> = sqlx::query_scalar("SELECT rolname::text FROM pg_roles")
        .fetch_all(pool)
        .await
        .map_err(|e| DriverError::backend(NAME, "list roles", e))?;

    for role in roles.iter().filter(|r| !is_excluded_role(r)) {
        debug!(role = %role, "dropping role");
        // Other databases are gone, so only objects and grants here can
        // still pin the role.
        for stmt in [
            format!("DROP OWNED BY {}", quote_ident(role)),
            format!("DROP ROLE IF EXISTS {}", quote_ident(role)),
        ] {
            pool.execute(stmt.as_str())
                .await
                .map_err(|e| DriverError::backend(NAME, "drop role", e))?;
        }
    }

    let stmt = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(DEFAULT_SCHEMA));
    pool.execute(stmt.as_str())
        .await
        .map_err(|e| DriverError::backend(NAME, "recreate schema", e))?;

    Ok(())
}
