//! Migration orchestrator - main workflow coordinator.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use crate::config::{DbConfig, EntitySelection, MigrateOptions, SnapshotPaths};
use crate::contract::{self, SqlValue, UpsertPlan};
use crate::error::{MigrateError, Result};
use crate::linker::{self, ProfileBatch};
use crate::reconcile::{self, Reconciliation, ResolvedUser};
use crate::schema;
use crate::snapshot::records::ClientRecord;
use crate::snapshot::Snapshot;

/// Destination key for the one migrated analytics counter.
const LOADER_LAUNCHES_KEY: &str = "loader_launches";

/// One-shot snapshot migration: loads the selected JSON files, adapts
/// to the destination's actual column sets, and writes everything in a
/// single transaction.
pub struct Migrator {
    config: DbConfig,
    paths: SnapshotPaths,
    selection: EntitySelection,
    options: MigrateOptions,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Destination description, credentials redacted.
    pub target: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    // Per-entity written and rejected/skipped counts.
    pub clients_written: u64,
    pub clients_rejected: usize,
    pub dependencies_written: u64,
    pub dependencies_skipped: usize,
    pub analytics_written: u64,
    pub analytics_rejected: usize,
    pub users_written: u64,
    pub profiles_written: u64,
    pub profiles_skipped: usize,
    pub social_links_written: u64,
    pub social_links_skipped: usize,
    pub friendships_written: u64,
    pub friendships_skipped: usize,

    /// Users that arrived without a usable id.
    pub users_assigned_ids: usize,

    /// Users whose username or email was replaced with a placeholder.
    pub users_placeholders: usize,

    /// Users manufactured to satisfy profile or friendship references.
    pub users_synthesized: usize,

    /// Profiles manufactured for users the profile export missed.
    pub profiles_synthesized: usize,

    /// Tables whose id sequence was resynchronized.
    pub sequences_reset: Vec<String>,
}

impl MigrationReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Migrator {
    pub fn new(
        config: DbConfig,
        paths: SnapshotPaths,
        selection: EntitySelection,
        options: MigrateOptions,
    ) -> Self {
        Self {
            config,
            paths,
            selection: selection.effective(),
            options,
        }
    }

    /// Run the migration.
    pub async fn run(&self) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        // One timestamp for every fallback value in the run.
        let now = started_at;

        info!("Starting migration run: {}", run_id);

        // Phase 1: Load the snapshot
        info!("Phase 1: Loading snapshot files");
        let mut snapshot = Snapshot::load(&self.paths, &self.selection)?;

        // Phase 2: Connect and anchor the working schema
        info!("Phase 2: Connecting to {}", self.config.display_target());
        let (mut client, connection) =
            tokio_postgres::connect(&self.config.connection_string(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Database connection error: {}", e);
            }
        });
        let tx = client.transaction().await?;

        let Some(schema_name) = schema::resolve_table_schema(&tx, "clients").await? else {
            return Err(MigrateError::schema_mismatch(
                "clients",
                "table not found in any schema",
            ));
        };
        if !schema::active_schemas(&tx).await?.contains(&schema_name) {
            schema::set_search_path(&tx, &schema_name).await?;
        }

        // Phase 3: Clients and their dependencies
        let mut clients_written = 0u64;
        let mut dependencies_written = 0u64;
        let mut dependencies_skipped = 0usize;
        if !snapshot.clients.is_empty() {
            info!("Phase 3: Migrating {} clients", snapshot.clients.len());
            let columns = schema::table_columns(&tx, "clients").await?;
            let plan = contract::CLIENTS.resolve(&columns)?;
            let rows = client_rows(&snapshot.clients, &plan, now);
            clients_written = plan.execute(&tx, rows, self.options.batch_size).await?;

            let dependency_total: usize =
                snapshot.clients.iter().map(|c| c.dependencies.len()).sum();
            if dependency_total > 0 {
                if schema::table_exists(&tx, "fabric_dependences").await? {
                    let columns = schema::table_columns(&tx, "fabric_dependences").await?;
                    let plan = contract::FABRIC_DEPENDENCES.resolve(&columns)?;
                    let (rows, skipped) = dependency_rows(&snapshot.clients, &plan);
                    dependencies_skipped = skipped;
                    dependencies_written =
                        plan.execute(&tx, rows, self.options.batch_size).await?;
                } else {
                    warn!(
                        "Table fabric_dependences not found; skipping {} dependencies",
                        dependency_total
                    );
                    dependencies_skipped = dependency_total;
                }
            }
        }

        // Phase 4: Analytics counter
        let mut analytics_written = 0u64;
        if let Some(count) = snapshot.loader_launches {
            info!("Phase 4: Migrating the loader launch counter");
            if !schema::table_exists(&tx, "analytics_counters").await? {
                return Err(MigrateError::schema_mismatch(
                    "analytics_counters",
                    "table not found",
                ));
            }
            let columns = schema::table_columns(&tx, "analytics_counters").await?;
            let plan = contract::ANALYTICS_COUNTERS.resolve(&columns)?;
            let rows = vec![vec![
                SqlValue::Text(LOADER_LAUNCHES_KEY.to_string()),
                SqlValue::BigInt(count),
            ]];
            analytics_written = plan.execute(&tx, rows, self.options.batch_size).await?;
        }

        // Phase 5: Users, reconciled
        let mut users_written = 0u64;
        let mut reconciliation: Option<Reconciliation> = None;
        if !snapshot.users.is_empty() {
            info!("Phase 5: Migrating {} users", snapshot.users.len());
            if !schema::table_exists(&tx, "users").await? {
                return Err(MigrateError::schema_mismatch("users", "table not found"));
            }
            let columns = schema::table_columns(&tx, "users").await?;
            let plan = contract::USERS.resolve(&columns)?;
            let max_existing = schema::max_id(&tx, "users").await?;

            let outcome = reconcile::reconcile_users(
                std::mem::take(&mut snapshot.users),
                &snapshot.profiles,
                &snapshot.friendships,
                max_existing,
                now,
            );
            info!(
                "Reconciled {} users ({} assigned ids, {} placeholder values, {} synthesized)",
                outcome.users.len(),
                outcome.assigned_ids,
                outcome.placeholder_values,
                outcome.synthetic_users
            );
            let rows = user_rows(&outcome.users, &plan);
            users_written = plan.execute(&tx, rows, self.options.batch_size).await?;
            reconciliation = Some(outcome);
        }

        // Parent set for profiles and friendships: the users written
        // this run, or whatever the destination already holds.
        let (valid_user_ids, users_available) = match &reconciliation {
            Some(outcome) => (outcome.accepted_ids(), true),
            None if !snapshot.profiles.is_empty() || !snapshot.friendships.is_empty() => {
                if schema::table_exists(&tx, "users").await? {
                    let ids = linker::existing_user_ids(&tx).await?;
                    info!("Linking against {} existing destination users", ids.len());
                    (ids, true)
                } else {
                    warn!("Users table not found; profiles and friendships cannot be linked");
                    (HashSet::new(), false)
                }
            }
            None => (HashSet::new(), false),
        };
        let accepted_users: &[ResolvedUser] =
            reconciliation.as_ref().map_or(&[], |o| &o.users);

        // Phase 6: User profiles
        let mut profiles_written = 0u64;
        let mut profiles_skipped = 0usize;
        let mut profiles_synthesized = 0usize;
        let mut profile_key_owners: HashMap<i64, i64> = HashMap::new();
        if !snapshot.profiles.is_empty() || !accepted_users.is_empty() {
            info!("Phase 6: Migrating user profiles");
            if !users_available {
                warn!(
                    "Skipping {} profiles: no users to attach them to",
                    snapshot.profiles.len()
                );
                profiles_skipped = snapshot.profiles.len();
            } else if !schema::table_exists(&tx, "user_profiles").await? {
                warn!("Table user_profiles not found; skipping profile migration");
                profiles_skipped = snapshot.profiles.len();
            } else {
                let columns = schema::table_columns(&tx, "user_profiles").await?;
                let plan = contract::USER_PROFILES.resolve(&columns)?;
                let ProfileBatch {
                    rows,
                    key_owners,
                    skipped,
                    synthesized,
                } = linker::build_profile_rows(
                    &snapshot.profiles,
                    accepted_users,
                    &valid_user_ids,
                    &plan,
                    now,
                );
                profiles_skipped = skipped;
                profiles_synthesized = synthesized;
                profiles_written = plan.execute(&tx, rows, self.options.batch_size).await?;
                profile_key_owners = key_owners;
            }
        }

        // Phase 7: Social links
        let mut social_links_written = 0u64;
        let mut social_links_skipped = 0usize;
        if !snapshot.social_links.is_empty() {
            info!("Phase 7: Migrating {} social links", snapshot.social_links.len());
            if !schema::table_exists(&tx, "social_links").await? {
                warn!("Table social_links not found; skipping social link migration");
                social_links_skipped = snapshot.social_links.len();
            } else {
                let profile_ids =
                    linker::fetch_profile_ids_by_key(&tx, &profile_key_owners).await?;
                let columns = schema::table_columns(&tx, "social_links").await?;
                let plan = contract::SOCIAL_LINKS.resolve(&columns)?;
                let (rows, skipped) =
                    linker::build_social_link_rows(&snapshot.social_links, &profile_ids, &plan);
                social_links_skipped = skipped;
                social_links_written =
                    plan.execute(&tx, rows, self.options.batch_size).await?;
            }
        }

        // Phase 8: Friendships
        let mut friendships_written = 0u64;
        let mut friendships_skipped = 0usize;
        if !snapshot.friendships.is_empty() {
            info!("Phase 8: Migrating {} friendships", snapshot.friendships.len());
            if !users_available {
                warn!(
                    "Skipping {} friendships: no users to link them to",
                    snapshot.friendships.len()
                );
                friendships_skipped = snapshot.friendships.len();
            } else if !schema::table_exists(&tx, "friend_requests").await? {
                warn!("Table friend_requests not found; skipping friendship migration");
                friendships_skipped = snapshot.friendships.len();
            } else {
                let columns = schema::table_columns(&tx, "friend_requests").await?;
                let plan = contract::resolve_friend_requests(&columns)?;
                let (rows, skipped) =
                    linker::build_friendship_rows(&snapshot.friendships, &valid_user_ids, &plan, now);
                friendships_skipped = skipped;
                friendships_written =
                    plan.execute(&tx, rows, self.options.batch_size).await?;
            }
        }

        // Phase 9: Sequence resynchronization
        let mut sequences_reset = Vec::new();
        if self.options.skip_sequence_reset {
            info!("Skipping sequence resynchronization");
        } else {
            info!("Phase 9: Resynchronizing id sequences");
            for table in ["clients", "users"] {
                if schema::table_exists(&tx, table).await?
                    && schema::resync_id_sequence(&tx, table).await?
                {
                    sequences_reset.push(table.to_string());
                }
            }
        }

        tx.commit().await?;

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let (users_assigned_ids, users_placeholders, users_synthesized) = reconciliation
            .as_ref()
            .map_or((0, 0, 0), |o| {
                (o.assigned_ids, o.placeholder_values, o.synthetic_users)
            });

        let report = MigrationReport {
            run_id,
            target: self.config.display_target(),
            started_at,
            completed_at,
            duration_seconds,
            clients_written,
            clients_rejected: snapshot.clients_rejected,
            dependencies_written,
            dependencies_skipped,
            analytics_written,
            analytics_rejected: snapshot.analytics_rejected,
            users_written,
            profiles_written,
            profiles_skipped,
            social_links_written,
            social_links_skipped,
            friendships_written,
            friendships_skipped,
            users_assigned_ids,
            users_placeholders,
            users_synthesized,
            profiles_synthesized,
            sequences_reset,
        };

        info!(
            "Migration completed: {} clients, {} users, {} profiles, {} social links, \
             {} friendships in {:.1}s",
            report.clients_written,
            report.users_written,
            report.profiles_written,
            report.social_links_written,
            report.friendships_written,
            report.duration_seconds
        );

        Ok(report)
    }
}

fn client_rows(
    clients: &[ClientRecord],
    plan: &UpsertPlan,
    now: DateTime<Utc>,
) -> Vec<Vec<SqlValue>> {
    clients
        .iter()
        .map(|client| {
            plan.columns
                .iter()
                .map(|col| match col.as_str() {
                    "id" => SqlValue::BigInt(client.id),
                    "name" => SqlValue::Text(client.name.clone()),
                    "version" => SqlValue::Text(client.version.as_str().to_string()),
                    "type" => SqlValue::Text(client.kind.as_str().to_string()),
                    "filename" => SqlValue::opt_text(client.filename.clone()),
                    "md5_hash" => SqlValue::opt_text(client.md5_hash.clone()),
                    "size" => SqlValue::BigInt(client.size),
                    "main_class" => SqlValue::Text(client.main_class.clone()),
                    "show" => SqlValue::Bool(client.show),
                    "working" => SqlValue::Bool(client.working),
                    "launches" => SqlValue::BigInt(client.launches),
                    "downloads" => SqlValue::BigInt(client.downloads),
                    "created_at" => SqlValue::Timestamp(client.created_at.unwrap_or(now)),
                    other => unreachable!("no value for clients column {other}"),
                })
                .collect()
        })
        .collect()
}

/// Dependency rows ride on the merged client batch. A dependency with
/// no name cannot take part in conflict resolution and is skipped.
fn dependency_rows(clients: &[ClientRecord], plan: &UpsertPlan) -> (Vec<Vec<SqlValue>>, usize) {
    let mut rows = Vec::new();
    let mut skipped = 0;

    for client in clients {
        for dependency in &client.dependencies {
            let Some(name) = dependency.name.as_deref().filter(|n| !n.is_empty()) else {
                warn!("Skipping unnamed dependency of client {}", client.id);
                skipped += 1;
                continue;
            };
            rows.push(
                plan.columns
                    .iter()
                    .map(|col| match col.as_str() {
                        "client_id" => SqlValue::BigInt(client.id),
                        "name" => SqlValue::Text(name.to_string()),
                        "md5_hash" => SqlValue::opt_text(dependency.md5_hash.clone()),
                        "size" => SqlValue::BigInt(dependency.size),
                        other => unreachable!("no value for fabric_dependences column {other}"),
                    })
                    .collect(),
            );
        }
    }

    (rows, skipped)
}

fn user_rows(users: &[ResolvedUser], plan: &UpsertPlan) -> Vec<Vec<SqlValue>> {
    users
        .iter()
        .map(|user| {
            plan.columns
                .iter()
                .map(|col| match col.as_str() {
                    "id" => SqlValue::BigInt(user.id),
                    "username" => SqlValue::Text(user.username.clone()),
                    "password" => SqlValue::Text(user.password.clone()),
                    "email" => SqlValue::Text(user.email.clone()),
                    "enabled" => SqlValue::Bool(user.enabled),
                    "role" => SqlValue::Text(user.role.as_str().to_string()),
                    "created_at" => SqlValue::Timestamp(user.created_at),
                    "updated_at" => SqlValue::Timestamp(user.updated_at),
                    "last_login_at" => SqlValue::opt_timestamp(user.last_login_at),
                    other => unreachable!("no value for users column {other}"),
                })
                .collect()
        })
        .collect()
}
