//! Table contracts and the conflict-tolerant statement builder.
//!
//! Every destination table is described by a declarative contract: the
//! columns an entity cannot be written without, the columns it uses
//! when the destination has them, and the conflict key that makes the
//! write idempotent. One generic builder turns a contract plus the
//! probed column set into a multi-row
//! `INSERT ... ON CONFLICT (key) DO UPDATE SET col = EXCLUDED.col`
//! statement, so re-running a migration replaces rows instead of
//! duplicating or deleting them.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::schema::quote_ident;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlValue {
    Null(SqlNull),
    Bool(bool),
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Type hint for NULL values so the placeholder cast and the bound
/// parameter agree on a PostgreSQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNull {
    Bool,
    BigInt,
    Text,
    Timestamp,
}

impl SqlValue {
    pub fn opt_bigint(value: Option<i64>) -> SqlValue {
        value.map_or(SqlValue::Null(SqlNull::BigInt), SqlValue::BigInt)
    }

    pub fn opt_text(value: Option<String>) -> SqlValue {
        value.map_or(SqlValue::Null(SqlNull::Text), SqlValue::Text)
    }

    pub fn opt_timestamp(value: Option<DateTime<Utc>>) -> SqlValue {
        value.map_or(SqlValue::Null(SqlNull::Timestamp), SqlValue::Timestamp)
    }
}

/// Placeholder cast for a value, e.g. `::bigint`. Pinning the
/// parameter type server-side keeps the statement valid even when a
/// destination column is a narrower type than the bound value.
fn sql_cast(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null(SqlNull::Bool) | SqlValue::Bool(_) => "::boolean",
        SqlValue::Null(SqlNull::BigInt) | SqlValue::BigInt(_) => "::bigint",
        SqlValue::Null(SqlNull::Text) | SqlValue::Text(_) => "::text",
        SqlValue::Null(SqlNull::Timestamp) | SqlValue::Timestamp(_) => "::timestamptz",
    }
}

/// Convert a SqlValue to a boxed, natively-typed parameter.
fn sql_value_to_param(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null(SqlNull::Bool) => Box::new(None::<bool>),
        SqlValue::Null(SqlNull::BigInt) => Box::new(None::<i64>),
        SqlValue::Null(SqlNull::Text) => Box::new(None::<String>),
        SqlValue::Null(SqlNull::Timestamp) => Box::new(None::<DateTime<Utc>>),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::BigInt(n) => Box::new(*n),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Timestamp(t) => Box::new(*t),
    }
}

/// Declarative description of one destination table.
#[derive(Debug, Clone, Copy)]
pub struct TableContract {
    pub table: &'static str,
    /// Columns the entity cannot be written without.
    pub mandatory: &'static [&'static str],
    /// Columns used only when the destination has them.
    pub optional: &'static [&'static str],
    /// Uniqueness key governing insert-or-update resolution.
    pub conflict_key: &'static [&'static str],
}

pub const CLIENTS: TableContract = TableContract {
    table: "clients",
    mandatory: &[
        "id",
        "name",
        "version",
        "type",
        "filename",
        "md5_hash",
        "size",
        "main_class",
        "show",
        "working",
        "launches",
        "downloads",
    ],
    optional: &["created_at"],
    conflict_key: &["id"],
};

pub const FABRIC_DEPENDENCES: TableContract = TableContract {
    table: "fabric_dependences",
    mandatory: &["client_id", "name", "md5_hash", "size"],
    optional: &[],
    conflict_key: &["client_id", "name"],
};

pub const USERS: TableContract = TableContract {
    table: "users",
    mandatory: &["id", "username", "password", "email", "enabled", "role"],
    optional: &["created_at", "updated_at", "last_login_at"],
    conflict_key: &["id"],
};

pub const USER_PROFILES: TableContract = TableContract {
    table: "user_profiles",
    mandatory: &["user_id", "role", "launches_count", "total_playtime_seconds"],
    optional: &["nickname", "created_at", "updated_at"],
    conflict_key: &["user_id"],
};

pub const SOCIAL_LINKS: TableContract = TableContract {
    table: "social_links",
    mandatory: &["profile_id", "platform", "url"],
    optional: &[],
    conflict_key: &["profile_id", "platform"],
};

pub const FRIEND_REQUESTS: TableContract = TableContract {
    table: "friend_requests",
    mandatory: &["requester_id", "addressee_id", "status"],
    optional: &["id", "blocked_by_id", "created_at", "updated_at"],
    conflict_key: &["id"],
};

pub const ANALYTICS_COUNTERS: TableContract = TableContract {
    table: "analytics_counters",
    mandatory: &["counter_key", "value"],
    optional: &[],
    conflict_key: &["counter_key"],
};

impl TableContract {
    /// Resolve the contract against the probed column set. Missing
    /// mandatory columns are fatal; optional columns are kept only
    /// when the destination has them.
    pub fn resolve(&self, probed: &BTreeSet<String>) -> Result<UpsertPlan> {
        let mut missing: Vec<&str> = self
            .mandatory
            .iter()
            .copied()
            .filter(|c| !probed.contains(*c))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(MigrateError::schema_mismatch(
                self.table,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }

        let mut columns: Vec<String> = self.mandatory.iter().map(|c| c.to_string()).collect();
        columns.extend(
            self.optional
                .iter()
                .filter(|c| probed.contains(**c))
                .map(|c| c.to_string()),
        );

        Ok(UpsertPlan {
            table: self.table.to_string(),
            columns,
            conflict_key: self.conflict_key.iter().map(|c| c.to_string()).collect(),
        })
    }
}

/// Friendships key on their snapshot id when the destination has that
/// column; otherwise the (requester, addressee) pair is the identity.
pub fn resolve_friend_requests(probed: &BTreeSet<String>) -> Result<UpsertPlan> {
    let mut plan = FRIEND_REQUESTS.resolve(probed)?;
    if !probed.contains("id") {
        plan.conflict_key = vec!["requester_id".to_string(), "addressee_id".to_string()];
    }
    Ok(plan)
}

/// A contract resolved against a live destination: the exact column
/// list statements use, in order, and the effective conflict key.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    pub table: String,
    pub columns: Vec<String>,
    pub conflict_key: Vec<String>,
}

impl UpsertPlan {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn keys_on(&self, name: &str) -> bool {
        self.conflict_key.len() == 1 && self.conflict_key[0] == name
    }

    fn key_indexes(&self) -> Vec<usize> {
        self.conflict_key
            .iter()
            .filter_map(|key| self.columns.iter().position(|c| c == key))
            .collect()
    }

    /// Build the parameterized multi-row upsert statement for `rows`.
    fn statement(&self, rows: &[Vec<SqlValue>]) -> (String, Vec<Box<dyn ToSql + Sync + Send>>) {
        let col_list: String = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let key_list: String = self
            .conflict_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let update_cols: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.conflict_key.contains(c))
            .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
            .collect();

        // Column casts come from the first row; every row in a batch
        // has the same shape.
        let col_casts: Vec<&'static str> = rows
            .first()
            .map(|row| row.iter().map(sql_cast).collect())
            .unwrap_or_default();

        let mut placeholders = Vec::with_capacity(rows.len());
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        let mut idx = 1;
        for row in rows {
            let row_placeholders: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(col_idx, value)| {
                    let p = format!("${idx}");
                    idx += 1;
                    let cast = col_casts
                        .get(col_idx)
                        .copied()
                        .unwrap_or_else(|| sql_cast(value));
                    format!("{p}{cast}")
                })
                .collect();
            placeholders.push(format!("({})", row_placeholders.join(", ")));

            for value in row {
                params.push(sql_value_to_param(value));
            }
        }

        let sql = if update_cols.is_empty() {
            format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
                quote_ident(&self.table),
                col_list,
                placeholders.join(", "),
                key_list
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {}",
                quote_ident(&self.table),
                col_list,
                placeholders.join(", "),
                key_list,
                update_cols.join(", ")
            )
        };

        (sql, params)
    }

    /// Deduplicate, chunk and execute `rows`. Returns the number of
    /// rows written (inserted or updated).
    pub async fn execute<C: GenericClient>(
        &self,
        client: &C,
        rows: Vec<Vec<SqlValue>>,
        chunk_size: usize,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let rows = dedup_by_key(rows, &self.key_indexes());
        let chunk_size = chunk_size.max(1);

        let mut total = 0u64;
        for chunk in rows.chunks(chunk_size) {
            let (sql, params) = self.statement(chunk);
            let param_refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            total += client.execute(&sql, &param_refs).await?;
            debug!("Upserted {} rows into {}", chunk.len(), self.table);
        }
        Ok(total)
    }
}

/// Collapse rows sharing a conflict-key value: the last occurrence
/// wins, at the first occurrence's position. Sequential upserts would
/// leave the same final state; one multi-row statement must not see
/// the key twice.
fn dedup_by_key(rows: Vec<Vec<SqlValue>>, key_indexes: &[usize]) -> Vec<Vec<SqlValue>> {
    if key_indexes.is_empty() {
        return rows;
    }
    let mut position: HashMap<Vec<SqlValue>, usize> = HashMap::new();
    let mut out: Vec<Vec<SqlValue>> = Vec::with_capacity(rows.len());
    for row in rows {
        let key: Vec<SqlValue> = key_indexes.iter().map(|&i| row[i].clone()).collect();
        match position.get(&key) {
            Some(&at) => out[at] = row,
            None => {
                position.insert(key, out.len());
                out.push(row);
            }
        }
    }
    out
}
