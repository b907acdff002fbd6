//! Identity reconciliation for user records.
//!
//! The destination enforces what the snapshot never did: a primary key
//! on every user, global uniqueness on username and email, and foreign
//! keys from profiles and friendships into `users`. This module takes
//! the loose snapshot and produces a batch that satisfies all three,
//! purely: no store connection, the destination's current maximum id
//! and the run timestamp come in as values.
//!
//! Identifier-less users drain the queue of ids that downstream
//! references demand (so a profile pointing at user 42 finds a user 42),
//! then fall back to a counter past the destination maximum. Colliding
//! or missing usernames/emails are replaced with placeholders
//! deterministic in the assigned id, and any reference still unmet after
//! the snapshot users are processed is satisfied by a synthetic disabled
//! user. Nothing is ever dropped; every repair is logged.

use std::collections::{BTreeSet, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::snapshot::canon::UserRole;
use crate::snapshot::records::{DeclaredId, FriendshipRecord, ProfileRecord, UserRecord};

/// Credential written for users that arrive without a usable password
/// hash, synthetic placeholders included.
pub const DEFAULT_PASSWORD_HASH: &str =
    "$2b$12$XLYH1iXVxLR/xRHTBVa3QeLIp0W2vnidFGgO.z7vLuSTRs47fJdZm";

/// A user with every destination-mandatory attribute populated.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
    pub enabled: bool,
    pub role: UserRole,
    /// Raw declared role tag, kept for profile-role derivation.
    pub raw_role: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// Username or email had to be synthesized.
    pub placeholder: bool,
    /// Manufactured purely to satisfy a reference; no snapshot record.
    pub synthetic: bool,
}

/// Outcome of identity reconciliation, in write order.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub users: Vec<ResolvedUser>,
    /// Users that had no usable declared id.
    pub assigned_ids: usize,
    /// Users whose username or email was replaced.
    pub placeholder_values: usize,
    /// Users manufactured for unmet references.
    pub synthetic_users: usize,
}

impl Reconciliation {
    /// Ids of every user in the batch.
    pub fn accepted_ids(&self) -> HashSet<i64> {
        self.users.iter().map(|u| u.id).collect()
    }
}

/// Identifier assignment state: the queue of reference-demanded ids,
/// the overflow counter, and every id granted so far.
struct IdAllocator {
    queue: VecDeque<i64>,
    next: i64,
    used: HashSet<i64>,
}

impl IdAllocator {
    fn new(required: &BTreeSet<i64>, explicit: &HashSet<i64>, max_existing: i64) -> Self {
        // BTreeSet iteration gives the queue its smallest-first order.
        let queue = required
            .iter()
            .copied()
            .filter(|id| !explicit.contains(id))
            .collect();
        Self {
            queue,
            next: max_existing + 1,
            used: HashSet::new(),
        }
    }

    /// Record a declared id as taken. False when it was already granted
    /// this run.
    fn claim(&mut self, id: i64) -> bool {
        self.used.insert(id)
    }

    /// Next id for a user that declared none: drain the required-id
    /// queue first, then fall back to the counter.
    fn assign(&mut self) -> i64 {
        while let Some(id) = self.queue.pop_front() {
            if self.used.insert(id) {
                return id;
            }
        }
        self.assign_from_counter()
    }

    /// Counter-only assignment, for unparseable declared ids.
    fn assign_from_counter(&mut self) -> i64 {
        while !self.used.insert(self.next) {
            self.next += 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Accept `desired` when non-empty and unclaimed, otherwise synthesize
/// `user_<id>` with a numeric suffix until free. True in the second
/// slot means a substitution happened.
fn ensure_unique_username(
    id: i64,
    desired: Option<&str>,
    seen: &mut HashSet<String>,
) -> (String, bool) {
    if let Some(name) = desired.filter(|n| !n.is_empty()) {
        if !seen.contains(name) {
            seen.insert(name.to_string());
            return (name.to_string(), false);
        }
    }
    let base = format!("user_{id}");
    let mut candidate = base.clone();
    let mut n = 1;
    while seen.contains(&candidate) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    seen.insert(candidate.clone());
    (candidate, true)
}

/// Email counterpart of [`ensure_unique_username`]: the placeholder is
/// `user_<id>@invalid.local`, numeric suffix before the domain.
fn ensure_unique_email(
    id: i64,
    desired: Option<&str>,
    seen: &mut HashSet<String>,
) -> (String, bool) {
    if let Some(email) = desired.filter(|e| !e.is_empty()) {
        if !seen.contains(email) {
            seen.insert(email.to_string());
            return (email.to_string(), false);
        }
    }
    let base = format!("user_{id}");
    let mut candidate = format!("{base}@invalid.local");
    let mut n = 1;
    while seen.contains(&candidate) {
        candidate = format!("{base}_{n}@invalid.local");
        n += 1;
    }
    seen.insert(candidate.clone());
    (candidate, true)
}

/// Every user id that downstream records reference.
fn required_ids(profiles: &[ProfileRecord], friendships: &[FriendshipRecord]) -> BTreeSet<i64> {
    let mut ids = BTreeSet::new();
    for profile in profiles {
        ids.insert(profile.user_id);
    }
    for friendship in friendships {
        ids.insert(friendship.requester_id);
        ids.insert(friendship.addressee_id);
    }
    ids
}

/// Reconcile snapshot users against the ids that profiles and
/// friendships demand. `max_existing_id` is the destination's current
/// maximum user id; `now` is the run timestamp used for every
/// created-at fallback.
pub fn reconcile_users(
    users: Vec<UserRecord>,
    profiles: &[ProfileRecord],
    friendships: &[FriendshipRecord],
    max_existing_id: i64,
    now: DateTime<Utc>,
) -> Reconciliation {
    let required = required_ids(profiles, friendships);
    let explicit: HashSet<i64> = users
        .iter()
        .filter_map(|u| match u.id {
            DeclaredId::Known(id) => Some(id),
            _ => None,
        })
        .collect();
    let mut allocator = IdAllocator::new(&required, &explicit, max_existing_id);

    // Oldest-first processing only matters when an id must be invented:
    // it makes queue and counter assignment deterministic and favors
    // long-standing accounts in uniqueness contests. With every id
    // declared, snapshot order stands.
    let any_missing = users.iter().any(|u| !matches!(u.id, DeclaredId::Known(_)));
    let mut ordered: Vec<(usize, UserRecord)> = users.into_iter().enumerate().collect();
    if any_missing {
        ordered.sort_by_key(|(index, user)| {
            (user.created_at.unwrap_or(DateTime::<Utc>::MAX_UTC), *index)
        });
    }

    let mut outcome = Reconciliation::default();
    let mut seen_usernames: HashSet<String> = HashSet::new();
    let mut seen_emails: HashSet<String> = HashSet::new();

    for (_, user) in ordered {
        let id = match user.id {
            DeclaredId::Known(id) => {
                if !allocator.claim(id) {
                    warn!("User id {id} declared more than once; the later record wins at write");
                }
                id
            }
            DeclaredId::Missing => {
                let id = allocator.assign();
                info!(
                    "Assigned id {id} to user {:?} with no declared id",
                    user.username.as_deref().unwrap_or("<unnamed>")
                );
                outcome.assigned_ids += 1;
                id
            }
            DeclaredId::Invalid => {
                let id = allocator.assign_from_counter();
                warn!(
                    "User {:?} declared an unparseable id; assigned {id} from the counter",
                    user.username.as_deref().unwrap_or("<unnamed>")
                );
                outcome.assigned_ids += 1;
                id
            }
        };

        let (username, username_substituted) =
            ensure_unique_username(id, user.username.as_deref(), &mut seen_usernames);
        let (email, email_substituted) =
            ensure_unique_email(id, user.email.as_deref(), &mut seen_emails);
        let placeholder = username_substituted || email_substituted;
        if username_substituted {
            warn!("User {id}: username missing or taken, substituted {username}");
        }
        if email_substituted {
            warn!("User {id}: email missing or taken, substituted {email}");
        }
        if placeholder {
            outcome.placeholder_values += 1;
        }

        let created_at = user.created_at.unwrap_or(now);
        outcome.users.push(ResolvedUser {
            id,
            username,
            email,
            password: user
                .password
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PASSWORD_HASH.to_string()),
            // A repaired identity is not safe to leave signed in.
            enabled: if placeholder {
                false
            } else {
                user.enabled.unwrap_or(true)
            },
            role: UserRole::from_raw(user.role.as_deref()),
            raw_role: user.role,
            first_name: user.first_name,
            last_name: user.last_name,
            created_at,
            updated_at: user.updated_at.unwrap_or(created_at),
            last_login_at: user.last_login_at,
            placeholder,
            synthetic: false,
        });
    }

    // Whatever references still dangle gets a disabled stand-in so no
    // foreign key can fail.
    for id in &required {
        if allocator.used.contains(id) {
            continue;
        }
        allocator.claim(*id);
        let (username, _) = ensure_unique_username(*id, None, &mut seen_usernames);
        let (email, _) = ensure_unique_email(*id, None, &mut seen_emails);
        warn!("Synthesizing placeholder user {id} required by profile/friendship references");
        outcome.synthetic_users += 1;
        outcome.users.push(ResolvedUser {
            id: *id,
            username,
            email,
            password: DEFAULT_PASSWORD_HASH.to_string(),
            enabled: false,
            role: UserRole::User,
            raw_role: None,
            first_name: None,
            last_name: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            placeholder: true,
            synthetic: true,
        });
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn user(id: DeclaredId, username: &str, email: &str) -> UserRecord {
        UserRecord {
            id,
            username: Some(username.to_string()),
            email: Some(email.to_string()),
            ..Default::default()
        }
    }

    fn profile_for(user_id: i64) -> ProfileRecord {
        ProfileRecord {
            snapshot_key: None,
            user_id,
            nickname: None,
            role: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn friendship(requester: i64, addressee: i64) -> FriendshipRecord {
        FriendshipRecord {
            id: None,
            requester_id: requester,
            addressee_id: addressee,
            status: "PENDING".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_fully_declared_users_keep_ids_and_order() {
        let users = vec![
            user(DeclaredId::Known(5), "b", "b@example.com"),
            user(DeclaredId::Known(2), "a", "a@example.com"),
        ];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        assert_eq!(outcome.users.len(), 2);
        assert_eq!(outcome.users[0].id, 5);
        assert_eq!(outcome.users[1].id, 2);
        assert_eq!(outcome.assigned_ids, 0);
        assert_eq!(outcome.synthetic_users, 0);
        assert!(outcome.users.iter().all(|u| u.enabled));
    }

    #[test]
    fn test_missing_id_drains_required_queue_smallest_first() {
        let users = vec![
            user(DeclaredId::Missing, "first", "first@example.com"),
            user(DeclaredId::Missing, "second", "second@example.com"),
        ];
        let profiles = vec![profile_for(42), profile_for(7)];
        let friendships = vec![friendship(9, 42)];

        let outcome = reconcile_users(users, &profiles, &friendships, 100, now());
        assert_eq!(outcome.users[0].id, 7);
        assert_eq!(outcome.users[1].id, 9);
        assert_eq!(outcome.assigned_ids, 2);
        // 42 was never granted to a snapshot user, so it comes back as
        // a synthetic placeholder.
        let synthetic: Vec<&ResolvedUser> =
            outcome.users.iter().filter(|u| u.synthetic).collect();
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].id, 42);
    }

    #[test]
    fn test_queue_excludes_ids_declared_explicitly() {
        let users = vec![
            user(DeclaredId::Known(42), "steve", "steve@example.com"),
            user(DeclaredId::Missing, "noid", "noid@example.com"),
        ];
        let profiles = vec![profile_for(42)];
        let outcome = reconcile_users(users, &profiles, &[], 100, now());
        // The reference to 42 is satisfied by the explicit user; the
        // id-less one falls through to the counter.
        let noid = outcome.users.iter().find(|u| u.username == "noid").unwrap();
        assert_eq!(noid.id, 101);
        assert_eq!(outcome.synthetic_users, 0);
    }

    #[test]
    fn test_invalid_id_goes_to_counter_not_queue() {
        let users = vec![user(DeclaredId::Invalid, "broken", "broken@example.com")];
        let profiles = vec![profile_for(7)];
        let outcome = reconcile_users(users, &profiles, &[], 100, now());
        let broken = outcome.users.iter().find(|u| u.username == "broken").unwrap();
        assert_eq!(broken.id, 101);
        // The queue id is materialized synthetically instead.
        assert!(outcome.users.iter().any(|u| u.id == 7 && u.synthetic));
    }

    #[test]
    fn test_counter_skips_ids_already_granted() {
        let users = vec![
            user(DeclaredId::Known(101), "taken", "taken@example.com"),
            user(DeclaredId::Invalid, "broken", "broken@example.com"),
        ];
        let outcome = reconcile_users(users, &[], &[], 100, now());
        let broken = outcome.users.iter().find(|u| u.username == "broken").unwrap();
        assert_eq!(broken.id, 102);
    }

    #[test]
    fn test_timestamp_order_applies_only_when_an_id_is_missing() {
        let mut older = user(DeclaredId::Missing, "older", "older@example.com");
        older.created_at = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut newer = user(DeclaredId::Missing, "newer", "newer@example.com");
        newer.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let profiles = vec![profile_for(3), profile_for(8)];
        let outcome = reconcile_users(
            vec![newer.clone(), older.clone()],
            &profiles,
            &[],
            100,
            now(),
        );
        // Oldest drains the queue first even though it came second.
        assert_eq!(outcome.users[0].username, "older");
        assert_eq!(outcome.users[0].id, 3);
        assert_eq!(outcome.users[1].username, "newer");
        assert_eq!(outcome.users[1].id, 8);
    }

    #[test]
    fn test_undated_users_sort_last_when_ordering_applies() {
        let mut dated = user(DeclaredId::Missing, "dated", "dated@example.com");
        dated.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let undated = user(DeclaredId::Missing, "undated", "undated@example.com");

        let outcome = reconcile_users(vec![undated, dated], &[], &[], 0, now());
        assert_eq!(outcome.users[0].username, "dated");
        assert_eq!(outcome.users[0].id, 1);
        assert_eq!(outcome.users[1].id, 2);
    }

    #[test]
    fn test_duplicate_username_second_is_placeholder_and_disabled() {
        let users = vec![
            user(DeclaredId::Known(1), "steve", "one@example.com"),
            user(DeclaredId::Known(2), "steve", "two@example.com"),
        ];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        let first = &outcome.users[0];
        let second = &outcome.users[1];
        assert_eq!(first.username, "steve");
        assert!(first.enabled);
        assert!(!first.placeholder);
        assert_eq!(second.username, "user_2");
        assert!(!second.enabled);
        assert!(second.placeholder);
        assert_eq!(outcome.placeholder_values, 1);
    }

    #[test]
    fn test_placeholder_collision_appends_numeric_suffix() {
        let users = vec![
            user(DeclaredId::Known(1), "user_2", "a@example.com"),
            UserRecord {
                id: DeclaredId::Known(2),
                email: Some("b@example.com".to_string()),
                ..Default::default()
            },
        ];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        assert_eq!(outcome.users[1].username, "user_2_1");
    }

    #[test]
    fn test_email_placeholder_suffix_stays_before_domain() {
        let users = vec![
            user(DeclaredId::Known(1), "a", "user_2@invalid.local"),
            user(DeclaredId::Known(2), "b", "user_2@invalid.local"),
        ];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        assert_eq!(outcome.users[1].email, "user_2_1@invalid.local");
        assert!(!outcome.users[1].enabled);
    }

    #[test]
    fn test_empty_username_and_email_are_treated_as_missing() {
        let users = vec![user(DeclaredId::Known(4), "", "")];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        assert_eq!(outcome.users[0].username, "user_4");
        assert_eq!(outcome.users[0].email, "user_4@invalid.local");
        assert!(outcome.users[0].placeholder);
    }

    #[test]
    fn test_synthetic_user_shape() {
        let outcome = reconcile_users(Vec::new(), &[profile_for(42)], &[], 10, now());
        assert_eq!(outcome.users.len(), 1);
        let synthetic = &outcome.users[0];
        assert_eq!(synthetic.id, 42);
        assert_eq!(synthetic.username, "user_42");
        assert_eq!(synthetic.email, "user_42@invalid.local");
        assert_eq!(synthetic.password, DEFAULT_PASSWORD_HASH);
        assert!(!synthetic.enabled);
        assert_eq!(synthetic.role, UserRole::User);
        assert_eq!(synthetic.created_at, now());
        assert!(synthetic.placeholder && synthetic.synthetic);
        assert_eq!(outcome.synthetic_users, 1);
    }

    #[test]
    fn test_synthetic_users_come_out_sorted() {
        let friendships = vec![friendship(30, 10), friendship(20, 30)];
        let outcome = reconcile_users(Vec::new(), &[], &friendships, 0, now());
        let ids: Vec<i64> = outcome.users.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_password_and_enabled_defaults() {
        let declared = UserRecord {
            id: DeclaredId::Known(1),
            username: Some("a".to_string()),
            email: Some("a@example.com".to_string()),
            password: Some("$2b$12$declared".to_string()),
            enabled: Some(false),
            ..Default::default()
        };
        let bare = user(DeclaredId::Known(2), "b", "b@example.com");
        let outcome = reconcile_users(vec![declared, bare], &[], &[], 10, now());
        assert_eq!(outcome.users[0].password, "$2b$12$declared");
        assert!(!outcome.users[0].enabled);
        assert_eq!(outcome.users[1].password, DEFAULT_PASSWORD_HASH);
        assert!(outcome.users[1].enabled);
    }

    #[test]
    fn test_timestamp_fallback_chain() {
        let created = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let updated = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let full = UserRecord {
            id: DeclaredId::Known(1),
            username: Some("a".to_string()),
            email: Some("a@example.com".to_string()),
            created_at: Some(created),
            updated_at: Some(updated),
            ..Default::default()
        };
        let only_created = UserRecord {
            id: DeclaredId::Known(2),
            username: Some("b".to_string()),
            email: Some("b@example.com".to_string()),
            created_at: Some(created),
            ..Default::default()
        };
        let bare = user(DeclaredId::Known(3), "c", "c@example.com");

        let outcome = reconcile_users(vec![full, only_created, bare], &[], &[], 10, now());
        assert_eq!(outcome.users[0].updated_at, updated);
        assert_eq!(outcome.users[1].created_at, created);
        assert_eq!(outcome.users[1].updated_at, created);
        assert_eq!(outcome.users[2].created_at, now());
        assert_eq!(outcome.users[2].updated_at, now());
    }

    #[test]
    fn test_role_mapping_keeps_raw_tag() {
        let mut admin = user(DeclaredId::Known(1), "a", "a@example.com");
        admin.role = Some("owner".to_string());
        let outcome = reconcile_users(vec![admin], &[], &[], 10, now());
        assert_eq!(outcome.users[0].role, UserRole::Admin);
        assert_eq!(outcome.users[0].raw_role.as_deref(), Some("owner"));
    }

    #[test]
    fn test_duplicate_explicit_ids_both_kept_for_last_write_wins() {
        let users = vec![
            user(DeclaredId::Known(7), "a", "a@example.com"),
            user(DeclaredId::Known(7), "b", "b@example.com"),
        ];
        let outcome = reconcile_users(users, &[], &[], 10, now());
        assert_eq!(outcome.users.len(), 2);
        assert!(outcome.users.iter().all(|u| u.id == 7));
    }

    #[test]
    fn test_deterministic_across_runs() {
        let build = || {
            let users = vec![
                user(DeclaredId::Missing, "steve", "steve@example.com"),
                user(DeclaredId::Known(3), "steve", "other@example.com"),
                user(DeclaredId::Invalid, "", ""),
            ];
            let profiles = vec![profile_for(12), profile_for(3)];
            reconcile_users(users, &profiles, &[friendship(3, 50)], 100, now())
        };
        let first = build();
        let second = build();
        let summarize = |r: &Reconciliation| -> Vec<(i64, String, String, bool)> {
            r.users
                .iter()
                .map(|u| (u.id, u.username.clone(), u.email.clone(), u.enabled))
                .collect()
        };
        assert_eq!(summarize(&first), summarize(&second));
    }
}
