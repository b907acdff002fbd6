//! Cross-batch reference resolution.
//!
//! Profiles reference users, social links reference profiles by the
//! profile's snapshot-local primary key, and friendships reference two
//! users. Users and profiles get their destination ids during the write,
//! so dependent rows are built in waves: write the parent batch, read
//! its destination keys back by natural key, then resolve the children
//! against those mappings. Anything that still fails to resolve is
//! skipped with a warning, never written broken.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;
use tracing::warn;

use crate::contract::{SqlNull, SqlValue, UpsertPlan};
use crate::error::Result;
use crate::reconcile::ResolvedUser;
use crate::snapshot::canon::{FriendStatus, ProfileRole, SocialPlatform};
use crate::snapshot::records::{FriendshipRecord, ProfileRecord, SocialLinkRecord};

/// The profile batch plus the bookkeeping later waves need.
#[derive(Debug, Default)]
pub struct ProfileBatch {
    pub rows: Vec<Vec<SqlValue>>,
    /// Snapshot-local profile key → owning user id, for written rows.
    pub key_owners: HashMap<i64, i64>,
    pub skipped: usize,
    pub synthesized: usize,
}

fn profile_row(
    plan: &UpsertPlan,
    user_id: i64,
    nickname: Option<String>,
    role: ProfileRole,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Vec<SqlValue> {
    plan.columns
        .iter()
        .map(|col| match col.as_str() {
            "user_id" => SqlValue::BigInt(user_id),
            "role" => SqlValue::Text(role.as_str().to_string()),
            // Usage counters restart from zero on the new stack.
            "launches_count" | "total_playtime_seconds" => SqlValue::BigInt(0),
            "nickname" => SqlValue::opt_text(nickname.clone()),
            "created_at" => SqlValue::Timestamp(created_at),
            "updated_at" => SqlValue::Timestamp(updated_at),
            other => unreachable!("no value for user_profiles column {other}"),
        })
        .collect()
}

/// Nickname for a profile synthesized from its user: the declared full
/// name when there is one, otherwise the username.
fn synthesized_nickname(user: &ResolvedUser) -> String {
    let full_name = [user.first_name.as_deref(), user.last_name.as_deref()]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();
    if full_name.is_empty() {
        user.username.clone()
    } else {
        full_name
    }
}

/// Build the profile batch: every snapshot profile owned by a valid
/// user, plus a synthesized profile for each migrated user the
/// snapshot left without one. Profiles for unknown users are skipped.
pub fn build_profile_rows(
    profiles: &[ProfileRecord],
    users: &[ResolvedUser],
    valid_user_ids: &HashSet<i64>,
    plan: &UpsertPlan,
    now: DateTime<Utc>,
) -> ProfileBatch {
    let mut batch = ProfileBatch::default();
    let mut covered: HashSet<i64> = HashSet::new();

    for profile in profiles {
        if !valid_user_ids.contains(&profile.user_id) {
            warn!(
                "Skipping profile for user {} not present in the destination",
                profile.user_id
            );
            batch.skipped += 1;
            continue;
        }
        let nickname = profile
            .nickname
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let created_at = profile.created_at.unwrap_or(now);
        batch.rows.push(profile_row(
            plan,
            profile.user_id,
            nickname,
            ProfileRole::from_raw(profile.role.as_deref()),
            created_at,
            profile.updated_at.unwrap_or(created_at),
        ));
        covered.insert(profile.user_id);
        if let Some(key) = profile.snapshot_key {
            batch.key_owners.insert(key, profile.user_id);
        }
    }

    // Destination semantics want a profile per user, so users the
    // profile export missed get one synthesized from their own record.
    for user in users {
        if covered.contains(&user.id) {
            continue;
        }
        batch.rows.push(profile_row(
            plan,
            user.id,
            Some(synthesized_nickname(user)),
            ProfileRole::from_raw(user.raw_role.as_deref()),
            user.created_at,
            user.updated_at,
        ));
        batch.synthesized += 1;
    }

    batch
}

/// Read back destination profile ids for the written batch and resolve
/// each snapshot-local profile key to its destination profile id.
pub async fn fetch_profile_ids_by_key<C: GenericClient>(
    client: &C,
    key_owners: &HashMap<i64, i64>,
) -> Result<HashMap<i64, i64>> {
    if key_owners.is_empty() {
        return Ok(HashMap::new());
    }

    let user_ids: Vec<i64> = key_owners.values().copied().collect();
    let rows = client
        .query(
            "SELECT id::bigint, user_id::bigint FROM user_profiles \
             WHERE user_id = ANY($1::bigint[])",
            &[&user_ids],
        )
        .await?;
    let profile_by_user: HashMap<i64, i64> = rows
        .iter()
        .map(|row| (row.get::<_, i64>(1), row.get::<_, i64>(0)))
        .collect();

    Ok(key_owners
        .iter()
        .filter_map(|(key, user_id)| profile_by_user.get(user_id).map(|id| (*key, *id)))
        .collect())
}

/// Ids already present in the destination users table. Fallback parent
/// set for runs that migrate dependents without migrating users.
pub async fn existing_user_ids<C: GenericClient>(client: &C) -> Result<HashSet<i64>> {
    let rows = client.query("SELECT id::bigint FROM users", &[]).await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Resolve social links against the profile-key mapping. Links whose
/// key never resolved or whose platform is unrecognized are skipped.
pub fn build_social_link_rows(
    links: &[SocialLinkRecord],
    profile_ids_by_key: &HashMap<i64, i64>,
    plan: &UpsertPlan,
) -> (Vec<Vec<SqlValue>>, usize) {
    let mut rows = Vec::new();
    let mut skipped = 0;

    for link in links {
        let Some(profile_id) = profile_ids_by_key.get(&link.profile_key) else {
            warn!(
                "Skipping social link for unresolved profile key {}",
                link.profile_key
            );
            skipped += 1;
            continue;
        };
        let Some(platform) = SocialPlatform::parse(&link.platform) else {
            warn!(
                "Skipping social link with unsupported platform {:?}",
                link.platform
            );
            skipped += 1;
            continue;
        };
        rows.push(
            plan.columns
                .iter()
                .map(|col| match col.as_str() {
                    "profile_id" => SqlValue::BigInt(*profile_id),
                    "platform" => SqlValue::Text(platform.as_str().to_string()),
                    "url" => SqlValue::Text(link.url.clone()),
                    other => unreachable!("no value for social_links column {other}"),
                })
                .collect(),
        );
    }

    (rows, skipped)
}

/// Resolve friendships against the valid user set. Skips records
/// referencing unknown users, unrecognized statuses, and records
/// without a snapshot id when the destination keys on id.
pub fn build_friendship_rows(
    friendships: &[FriendshipRecord],
    valid_user_ids: &HashSet<i64>,
    plan: &UpsertPlan,
    now: DateTime<Utc>,
) -> (Vec<Vec<SqlValue>>, usize) {
    let mut rows = Vec::new();
    let mut skipped = 0;

    for friendship in friendships {
        if !valid_user_ids.contains(&friendship.requester_id)
            || !valid_user_ids.contains(&friendship.addressee_id)
        {
            warn!(
                "Skipping friendship {} -> {}: user not present in the destination",
                friendship.requester_id, friendship.addressee_id
            );
            skipped += 1;
            continue;
        }
        let Some(status) = FriendStatus::parse(&friendship.status) else {
            warn!(
                "Skipping friendship {} -> {} with unsupported status {:?}",
                friendship.requester_id, friendship.addressee_id, friendship.status
            );
            skipped += 1;
            continue;
        };
        if plan.keys_on("id") && friendship.id.is_none() {
            warn!(
                "Skipping friendship {} -> {} without a snapshot id; destination keys on id",
                friendship.requester_id, friendship.addressee_id
            );
            skipped += 1;
            continue;
        }

        let blocked_by = if status == FriendStatus::Blocked {
            Some(friendship.requester_id)
        } else {
            None
        };
        let created_at = friendship.created_at.unwrap_or(now);
        rows.push(
            plan.columns
                .iter()
                .map(|col| match col.as_str() {
                    "id" => SqlValue::opt_bigint(friendship.id),
                    "requester_id" => SqlValue::BigInt(friendship.requester_id),
                    "addressee_id" => SqlValue::BigInt(friendship.addressee_id),
                    "status" => SqlValue::Text(status.as_str().to_string()),
                    "blocked_by_id" => SqlValue::opt_bigint(blocked_by),
                    "created_at" => SqlValue::Timestamp(created_at),
                    "updated_at" => {
                        SqlValue::Timestamp(friendship.updated_at.unwrap_or(created_at))
                    }
                    other => unreachable!("no value for friend_requests column {other}"),
                })
                .collect(),
        );
    }

    (rows, skipped)
}
