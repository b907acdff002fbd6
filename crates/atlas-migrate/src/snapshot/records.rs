//! Normalized snapshot records and the per-entity normalizers.
//!
//! Snapshot files arrive in two legacy shapes: flat objects, and wrapped
//! objects carrying a `model` discriminator with the real attributes
//! nested under `fields`. Normalizers accept both where the exporter
//! produced both, filter on the discriminator where it is authoritative,
//! and drop records missing a hard-required reference. Mandatory enums
//! (client version/variant) reject the record instead; optional values
//! degrade to their documented defaults at write time.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::snapshot::canon::{self, ClientKind, GameVersion};

/// A canonicalized client ready for writing, dependencies attached.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: i64,
    pub name: String,
    pub version: GameVersion,
    pub kind: ClientKind,
    pub filename: Option<String>,
    pub md5_hash: Option<String>,
    pub size: i64,
    pub main_class: String,
    pub show: bool,
    pub working: bool,
    pub launches: i64,
    pub downloads: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<DependencyRecord>,
}

/// A nested client dependency (fabric loader artifacts).
#[derive(Debug, Clone)]
pub struct DependencyRecord {
    pub name: Option<String>,
    pub md5_hash: Option<String>,
    pub size: i64,
}

/// Declared snapshot identifier state for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeclaredId {
    /// No identifier in the snapshot; eligible for the required-id queue.
    #[default]
    Missing,
    /// An identifier was present but unparseable; assigned from the
    /// fallback counter, never the queue.
    Invalid,
    /// A usable identifier.
    Known(i64),
}

/// A user as declared by the snapshot, before identity reconciliation.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub id: DeclaredId,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub enabled: Option<bool>,
    pub role: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// A profile as declared by the snapshot.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    /// Snapshot-local primary key; social links reference profiles by it.
    pub snapshot_key: Option<i64>,
    pub user_id: i64,
    pub nickname: Option<String>,
    pub role: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A social link referencing a profile by its snapshot-local key.
#[derive(Debug, Clone)]
pub struct SocialLinkRecord {
    pub profile_key: i64,
    /// Raw platform tag; canonicalized (and possibly skipped) at write time.
    pub platform: String,
    pub url: String,
}

/// A friendship between two users, referenced by user id.
#[derive(Debug, Clone)]
pub struct FriendshipRecord {
    pub id: Option<i64>,
    pub requester_id: i64,
    pub addressee_id: i64,
    /// Raw status tag; canonicalized (and possibly skipped) at write time.
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Best-effort integer coercion: JSON numbers (including whole floats)
/// and numeric strings.
pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// String coercion: strings as-is, numbers rendered (legacy records
/// occasionally carry numeric tags).
fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(as_i64)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(as_bool)
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(as_string)
}

fn timestamp_field(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key)
        .and_then(Value::as_str)
        .and_then(canon::parse_timestamp)
}

/// True when the record's `model` discriminator matches `expected`
/// (case-insensitive, whitespace-tolerant).
fn model_matches(obj: &Map<String, Value>, expected: &str) -> bool {
    obj.get("model")
        .and_then(Value::as_str)
        .map(|m| m.trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// The nested `fields` mapping of a wrapped record, if it has one.
fn wrapped_fields(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    obj.get("fields").and_then(Value::as_object)
}

fn non_null<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

/// Canonicalize one client record. Mandatory: id, name, and a version
/// that canonicalizes; the variant tag must canonicalize when present.
/// `with_dependencies` keeps the nested dependency list (only the primary
/// client file contributes dependencies).
pub fn normalize_client(raw: &Value, with_dependencies: bool) -> Result<ClientRecord> {
    let obj = raw
        .as_object()
        .ok_or_else(|| MigrateError::Validation("client record is not an object".into()))?;

    let id = int_field(obj, "id")
        .ok_or_else(|| MigrateError::Validation("client record has no usable id".into()))?;
    let name = string_field(obj, "name")
        .ok_or_else(|| MigrateError::Validation(format!("client {id} has no name")))?;
    let version = match string_field(obj, "version") {
        Some(v) => GameVersion::parse(&v)?,
        None => {
            return Err(MigrateError::Validation(format!(
                "client {id} has no version"
            )))
        }
    };
    let kind = match string_field(obj, "client_type") {
        Some(v) => ClientKind::parse(&v)?,
        None => ClientKind::Vanilla,
    };

    let dependencies = if with_dependencies {
        obj.get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_object)
                    .map(|dep| DependencyRecord {
                        name: string_field(dep, "name"),
                        md5_hash: string_field(dep, "md5_hash"),
                        size: int_field(dep, "size").unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(ClientRecord {
        id,
        name,
        version,
        kind,
        filename: string_field(obj, "filename"),
        md5_hash: string_field(obj, "md5_hash"),
        size: int_field(obj, "size").unwrap_or(0),
        main_class: string_field(obj, "main_class")
            .unwrap_or_else(|| "net.minecraft.client.main.Main".to_string()),
        show: bool_field(obj, "show").unwrap_or(true),
        working: bool_field(obj, "working").unwrap_or(true),
        launches: int_field(obj, "launches").unwrap_or(0),
        downloads: int_field(obj, "downloads").unwrap_or(0),
        created_at: timestamp_field(obj, "created_at"),
        dependencies,
    })
}

/// Canonicalize a client list. Records failing validation are rejected
/// with a warning and counted; the rest of the batch continues.
pub fn normalize_clients(raw: &[Value], with_dependencies: bool) -> (Vec<ClientRecord>, usize) {
    let mut accepted = Vec::with_capacity(raw.len());
    let mut rejected = 0;
    for item in raw {
        match normalize_client(item, with_dependencies) {
            Ok(record) => accepted.push(record),
            Err(e) => {
                warn!("Rejecting client record: {e}");
                rejected += 1;
            }
        }
    }
    (accepted, rejected)
}

/// Normalize one user record, flat or wrapped `auth.user` shape.
/// Returns `None` only for records that are not JSON objects.
pub fn normalize_user(raw: &Value) -> Option<UserRecord> {
    let obj = raw.as_object()?;
    let fields = wrapped_fields(obj);
    let attrs = fields.unwrap_or(obj);
    let wrapped = fields.is_some();

    // Wrapped records key the user by "pk"; an item-level "id" is the
    // fallback, then whatever the nested fields carry.
    let id_value = if wrapped {
        non_null(obj, "pk")
            .or_else(|| non_null(obj, "id"))
            .or_else(|| non_null(attrs, "id"))
    } else {
        non_null(attrs, "id")
    };
    let id = match id_value {
        None => DeclaredId::Missing,
        Some(v) => as_i64(v).map_or(DeclaredId::Invalid, DeclaredId::Known),
    };

    let enabled = bool_field(attrs, "enabled")
        .or_else(|| if wrapped { bool_field(attrs, "is_active") } else { None });

    let created_at = timestamp_field(attrs, "created_at").or_else(|| {
        if wrapped {
            timestamp_field(attrs, "date_joined")
        } else {
            None
        }
    });
    let last_login_at = timestamp_field(attrs, "last_login_at").or_else(|| {
        if wrapped {
            timestamp_field(attrs, "last_login")
        } else {
            None
        }
    });

    let role = string_field(attrs, "role").or_else(|| {
        let has_flags =
            wrapped && (attrs.contains_key("is_superuser") || attrs.contains_key("is_staff"));
        if has_flags {
            let elevated = bool_field(attrs, "is_superuser").unwrap_or(false)
                || bool_field(attrs, "is_staff").unwrap_or(false);
            Some(if elevated { "ADMIN" } else { "USER" }.to_string())
        } else {
            None
        }
    });

    Some(UserRecord {
        id,
        username: string_field(attrs, "username"),
        email: string_field(attrs, "email"),
        password: string_field(attrs, "password"),
        enabled,
        role,
        first_name: string_field(attrs, "first_name"),
        last_name: string_field(attrs, "last_name"),
        created_at,
        updated_at: timestamp_field(attrs, "updated_at"),
        last_login_at,
    })
}

pub fn normalize_users(raw: &[Value]) -> Vec<UserRecord> {
    raw.iter().filter_map(normalize_user).collect()
}

/// Normalize one `users.userprofile` record. Returns `None` when the
/// discriminator does not match or the user reference is missing.
pub fn normalize_profile(raw: &Value) -> Option<ProfileRecord> {
    let obj = raw.as_object()?;
    if !model_matches(obj, "users.userprofile") {
        return None;
    }

    let fields = wrapped_fields(obj);
    let (user_id, nickname, role, created_at, updated_at) = match fields {
        Some(fields) => (
            int_field(fields, "user"),
            string_field(fields, "nickname"),
            string_field(fields, "role"),
            timestamp_field(fields, "created_at"),
            timestamp_field(fields, "updated_at"),
        ),
        None => (
            int_field(obj, "user").or_else(|| int_field(obj, "user_id")),
            string_field(obj, "nickname"),
            string_field(obj, "role"),
            timestamp_field(obj, "created_at"),
            timestamp_field(obj, "updated_at"),
        ),
    };

    Some(ProfileRecord {
        snapshot_key: int_field(obj, "pk").or_else(|| int_field(obj, "id")),
        user_id: user_id?,
        nickname,
        role,
        created_at,
        updated_at,
    })
}

pub fn normalize_profiles(raw: &[Value]) -> Vec<ProfileRecord> {
    raw.iter().filter_map(normalize_profile).collect()
}

/// Normalize one `users.sociallink` record. Requires a profile
/// reference, a platform tag and a non-empty URL.
pub fn normalize_social_link(raw: &Value) -> Option<SocialLinkRecord> {
    let obj = raw.as_object()?;
    if !model_matches(obj, "users.sociallink") {
        return None;
    }
    let fields = wrapped_fields(obj)?;

    let profile_key =
        int_field(fields, "user_profile").or_else(|| int_field(fields, "profile"))?;
    let url = string_field(fields, "url").filter(|u| !u.is_empty())?;
    let platform = string_field(fields, "platform").filter(|p| !p.is_empty())?;

    Some(SocialLinkRecord {
        profile_key,
        platform,
        url,
    })
}

pub fn normalize_social_links(raw: &[Value]) -> Vec<SocialLinkRecord> {
    raw.iter().filter_map(normalize_social_link).collect()
}

/// Normalize one `users.friendship` record. Requires requester,
/// addressee and a status tag.
pub fn normalize_friendship(raw: &Value) -> Option<FriendshipRecord> {
    let obj = raw.as_object()?;
    if !model_matches(obj, "users.friendship") {
        return None;
    }
    let fields = wrapped_fields(obj)?;

    Some(FriendshipRecord {
        id: int_field(obj, "pk"),
        requester_id: int_field(fields, "requester")?,
        addressee_id: int_field(fields, "addressee")?,
        status: string_field(fields, "status")?,
        created_at: timestamp_field(fields, "created_at"),
        updated_at: timestamp_field(fields, "updated_at"),
    })
}

pub fn normalize_friendships(raw: &[Value]) -> Vec<FriendshipRecord> {
    raw.iter().filter_map(normalize_friendship).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_defaults_fill_optional_attributes() {
        let record = normalize_client(
            &json!({"id": 7, "name": "Wild", "version": "1.16.5"}),
            true,
        )
        .unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.kind, ClientKind::Vanilla);
        assert_eq!(record.main_class, "net.minecraft.client.main.Main");
        assert!(record.show);
        assert!(record.working);
        assert_eq!(record.size, 0);
        assert_eq!(record.launches, 0);
        assert!(record.created_at.is_none());
        assert!(record.dependencies.is_empty());
    }

    #[test]
    fn test_client_rejected_on_bad_version_or_variant() {
        let bad_version = json!({"id": 1, "name": "X", "version": "1.99"});
        assert!(normalize_client(&bad_version, false).is_err());

        let bad_kind =
            json!({"id": 2, "name": "Y", "version": "1.21.1", "client_type": "optifine"});
        assert!(normalize_client(&bad_kind, false).is_err());
    }

    #[test]
    fn test_client_batch_counts_rejections() {
        let raw = vec![
            json!({"id": 1, "name": "A", "version": "1.21.1"}),
            json!({"id": 2, "name": "B", "version": "1.99"}),
            json!({"id": 3, "name": "C", "version": "1.8.9", "client_type": "FABRIC"}),
        ];
        let (accepted, rejected) = normalize_clients(&raw, false);
        assert_eq!(accepted.len(), 2);
        assert_eq!(rejected, 1);
        assert_eq!(accepted[1].kind, ClientKind::Fabric);
    }

    #[test]
    fn test_client_dependencies_only_when_requested() {
        let raw = json!({
            "id": 5,
            "name": "Fab",
            "version": "1.21.1",
            "client_type": "fabric",
            "dependencies": [
                {"name": "fabric-loader", "md5_hash": "abc", "size": 1024},
                {"name": "intermediary"}
            ]
        });
        let with = normalize_client(&raw, true).unwrap();
        assert_eq!(with.dependencies.len(), 2);
        assert_eq!(with.dependencies[0].name.as_deref(), Some("fabric-loader"));
        assert_eq!(with.dependencies[1].size, 0);

        let without = normalize_client(&raw, false).unwrap();
        assert!(without.dependencies.is_empty());
    }

    #[test]
    fn test_wrapped_user_maps_django_fields() {
        let raw = json!({
            "model": "auth.user",
            "pk": 11,
            "fields": {
                "username": "steve",
                "email": "steve@example.com",
                "password": "$2b$12$hash",
                "is_active": true,
                "is_superuser": true,
                "is_staff": false,
                "first_name": "Steve",
                "last_name": "Stone",
                "date_joined": "2023-06-01T10:00:00Z",
                "last_login": "2024-01-01T08:00:00Z"
            }
        });
        let user = normalize_user(&raw).unwrap();
        assert_eq!(user.id, DeclaredId::Known(11));
        assert_eq!(user.username.as_deref(), Some("steve"));
        assert_eq!(user.enabled, Some(true));
        assert_eq!(user.role.as_deref(), Some("ADMIN"));
        assert!(user.created_at.is_some());
        assert!(user.last_login_at.is_some());
        assert_eq!(user.first_name.as_deref(), Some("Steve"));
    }

    #[test]
    fn test_wrapped_user_without_staff_flags_gets_no_role() {
        let raw = json!({
            "model": "auth.user",
            "pk": 3,
            "fields": {"username": "plain", "email": "p@example.com"}
        });
        let user = normalize_user(&raw).unwrap();
        assert!(user.role.is_none());
    }

    #[test]
    fn test_flat_user_passes_through() {
        let raw = json!({
            "id": "42",
            "username": "alex",
            "email": "alex@example.com",
            "enabled": false,
            "role": "owner"
        });
        let user = normalize_user(&raw).unwrap();
        assert_eq!(user.id, DeclaredId::Known(42));
        assert_eq!(user.enabled, Some(false));
        assert_eq!(user.role.as_deref(), Some("owner"));
    }

    #[test]
    fn test_user_id_states() {
        assert_eq!(
            normalize_user(&json!({"username": "a"})).unwrap().id,
            DeclaredId::Missing
        );
        assert_eq!(
            normalize_user(&json!({"id": null, "username": "a"})).unwrap().id,
            DeclaredId::Missing
        );
        assert_eq!(
            normalize_user(&json!({"id": "4x", "username": "a"})).unwrap().id,
            DeclaredId::Invalid
        );
        assert!(normalize_user(&json!("not an object")).is_none());
    }

    #[test]
    fn test_profile_requires_model_tag_and_user() {
        let ok = json!({
            "model": "users.userprofile",
            "pk": 9,
            "fields": {"user": 42, "nickname": "Steve S", "role": "TESTER"}
        });
        let profile = normalize_profile(&ok).unwrap();
        assert_eq!(profile.snapshot_key, Some(9));
        assert_eq!(profile.user_id, 42);
        assert_eq!(profile.nickname.as_deref(), Some("Steve S"));

        let wrong_model = json!({"model": "users.sociallink", "pk": 9, "fields": {"user": 1}});
        assert!(normalize_profile(&wrong_model).is_none());

        let no_user = json!({"model": "users.userprofile", "pk": 9, "fields": {"nickname": "x"}});
        assert!(normalize_profile(&no_user).is_none());
    }

    #[test]
    fn test_flat_profile_with_model_tag() {
        let raw = json!({
            "model": "users.userprofile",
            "id": 4,
            "user_id": 17,
            "role": "user"
        });
        let profile = normalize_profile(&raw).unwrap();
        assert_eq!(profile.snapshot_key, Some(4));
        assert_eq!(profile.user_id, 17);
    }

    #[test]
    fn test_social_link_requires_reference_platform_and_url() {
        let ok = json!({
            "model": "users.sociallink",
            "pk": 1,
            "fields": {"user_profile": 9, "platform": "DISCORD", "url": "https://d.gg/x"}
        });
        let link = normalize_social_link(&ok).unwrap();
        assert_eq!(link.profile_key, 9);
        assert_eq!(link.platform, "DISCORD");

        let alt_key = json!({
            "model": "users.sociallink",
            "fields": {"profile": 9, "platform": "GITHUB", "url": "https://g.h/x"}
        });
        assert_eq!(normalize_social_link(&alt_key).unwrap().profile_key, 9);

        let empty_url = json!({
            "model": "users.sociallink",
            "fields": {"user_profile": 9, "platform": "DISCORD", "url": ""}
        });
        assert!(normalize_social_link(&empty_url).is_none());

        let no_platform = json!({
            "model": "users.sociallink",
            "fields": {"user_profile": 9, "url": "https://d.gg/x"}
        });
        assert!(normalize_social_link(&no_platform).is_none());
    }

    #[test]
    fn test_friendship_requires_both_sides_and_status() {
        let ok = json!({
            "model": "users.friendship",
            "pk": 6,
            "fields": {
                "requester": 1,
                "addressee": 2,
                "status": "ACCEPTED",
                "created_at": "2024-02-02T00:00:00Z"
            }
        });
        let friendship = normalize_friendship(&ok).unwrap();
        assert_eq!(friendship.id, Some(6));
        assert_eq!(friendship.requester_id, 1);
        assert_eq!(friendship.addressee_id, 2);
        assert!(friendship.created_at.is_some());

        let missing_side = json!({
            "model": "users.friendship",
            "fields": {"requester": 1, "status": "PENDING"}
        });
        assert!(normalize_friendship(&missing_side).is_none());
    }
}
