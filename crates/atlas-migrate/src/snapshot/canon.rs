//! Enum and timestamp canonicalization for snapshot values.
//!
//! The destination stores enums as strings, so every canonicalizer here
//! produces the exact discriminator the schema expects. Mandatory enums
//! (client version, client variant) reject unknown values; optional ones
//! degrade to a safe default or `None`.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{MigrateError, Result};

/// Game versions the destination accepts, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameVersion {
    V1_21_11,
    V1_21_8,
    V1_21_1,
    V1_21_4,
    V1_16_5,
    V1_12_2,
    V1_8_9,
}

impl GameVersion {
    pub const ALL: [GameVersion; 7] = [
        GameVersion::V1_21_11,
        GameVersion::V1_21_8,
        GameVersion::V1_21_1,
        GameVersion::V1_21_4,
        GameVersion::V1_16_5,
        GameVersion::V1_12_2,
        GameVersion::V1_8_9,
    ];

    /// Destination enum discriminator, e.g. `V_1_21_1`.
    pub fn as_str(self) -> &'static str {
        match self {
            GameVersion::V1_21_11 => "V_1_21_11",
            GameVersion::V1_21_8 => "V_1_21_8",
            GameVersion::V1_21_1 => "V_1_21_1",
            GameVersion::V1_21_4 => "V_1_21_4",
            GameVersion::V1_16_5 => "V_1_16_5",
            GameVersion::V1_12_2 => "V_1_12_2",
            GameVersion::V1_8_9 => "V_1_8_9",
        }
    }

    /// Canonicalize a raw version string.
    ///
    /// Matching is case-insensitive and treats periods and hyphens as
    /// underscores, with an optional leading `v`/`V_` prefix, so
    /// `1.21.1`, `1_21_1`, `V_1_21_1` and `v1.21.1` all canonicalize to
    /// the same variant.
    pub fn parse(raw: &str) -> Result<GameVersion> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MigrateError::Validation("missing version value".into()));
        }
        let raw_lower = trimmed.to_lowercase();
        let candidate = raw_lower.replace(['.', '-'], "_");

        for version in GameVersion::ALL {
            let canonical = version.as_str().to_lowercase();
            let bare = canonical.trim_start_matches("v_");
            if candidate == canonical
                || candidate == bare
                || candidate == format!("v{bare}")
                || raw_lower == bare.replace('_', ".")
            {
                return Ok(version);
            }
        }
        Err(MigrateError::Validation(format!(
            "unsupported version value: {trimmed}"
        )))
    }
}

/// Client variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Vanilla,
    Fabric,
    Forge,
}

impl ClientKind {
    /// Destination discriminator value.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientKind::Vanilla => "Vanilla",
            ClientKind::Fabric => "FABRIC",
            ClientKind::Forge => "FORGE",
        }
    }

    /// Canonicalize a raw variant tag. Accepts the destination
    /// discriminator or the legacy API value (`default` for Vanilla),
    /// case-insensitively.
    pub fn parse(raw: &str) -> Result<ClientKind> {
        match raw.trim().to_lowercase().as_str() {
            "vanilla" | "default" => Ok(ClientKind::Vanilla),
            "fabric" => Ok(ClientKind::Fabric),
            "forge" => Ok(ClientKind::Forge),
            _ => Err(MigrateError::Validation(format!(
                "unsupported client_type value: {}",
                raw.trim()
            ))),
        }
    }
}

/// Account role in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::User => "USER",
            UserRole::Admin => "ADMIN",
        }
    }

    /// Admin-equivalent legacy roles collapse to ADMIN; anything else,
    /// including no role at all, is USER. Never fails.
    pub fn from_raw(raw: Option<&str>) -> UserRole {
        match raw.map(|r| r.trim().to_lowercase()) {
            Some(r) if matches!(r.as_str(), "admin" | "owner" | "developer") => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

/// Profile role in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileRole {
    User,
    Tester,
    Admin,
    Developer,
    Owner,
}

impl ProfileRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileRole::User => "USER",
            ProfileRole::Tester => "TESTER",
            ProfileRole::Admin => "ADMIN",
            ProfileRole::Developer => "DEVELOPER",
            ProfileRole::Owner => "OWNER",
        }
    }

    /// Unrecognized or missing roles default to USER. Never fails.
    pub fn from_raw(raw: Option<&str>) -> ProfileRole {
        match raw.map(|r| r.trim().to_uppercase()).as_deref() {
            Some("TESTER") => ProfileRole::Tester,
            Some("ADMIN") => ProfileRole::Admin,
            Some("DEVELOPER") => ProfileRole::Developer,
            Some("OWNER") => ProfileRole::Owner,
            _ => ProfileRole::User,
        }
    }
}

/// Social platforms the destination accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialPlatform {
    Discord,
    Telegram,
    Github,
    Youtube,
}

impl SocialPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            SocialPlatform::Discord => "DISCORD",
            SocialPlatform::Telegram => "TELEGRAM",
            SocialPlatform::Github => "GITHUB",
            SocialPlatform::Youtube => "YOUTUBE",
        }
    }

    /// Unknown platforms yield `None`; the caller skips the record.
    pub fn parse(raw: &str) -> Option<SocialPlatform> {
        match raw.trim().to_uppercase().as_str() {
            "DISCORD" => Some(SocialPlatform::Discord),
            "TELEGRAM" => Some(SocialPlatform::Telegram),
            "GITHUB" => Some(SocialPlatform::Github),
            "YOUTUBE" => Some(SocialPlatform::Youtube),
            _ => None,
        }
    }
}

/// Friendship statuses the destination accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendStatus {
    Pending,
    Accepted,
    Blocked,
}

impl FriendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FriendStatus::Pending => "PENDING",
            FriendStatus::Accepted => "ACCEPTED",
            FriendStatus::Blocked => "BLOCKED",
        }
    }

    /// Unknown statuses yield `None`; the caller skips the record.
    pub fn parse(raw: &str) -> Option<FriendStatus> {
        match raw.trim().to_uppercase().as_str() {
            "PENDING" => Some(FriendStatus::Pending),
            "ACCEPTED" => Some(FriendStatus::Accepted),
            "BLOCKED" => Some(FriendStatus::Blocked),
            _ => None,
        }
    }
}

/// Parse an ISO-8601 timestamp into UTC. The exporter writes a UTC `Z`
/// designator, but older snapshots carry naive timestamps; those are
/// taken as UTC. Missing or unparseable values yield `None`; callers
/// apply their documented fallback.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_spellings_canonicalize_to_one_variant() {
        for raw in ["1.21.1", "1_21_1", "V_1_21_1", "v1.21.1", "v1_21_1", "1-21-1"] {
            assert_eq!(
                GameVersion::parse(raw).unwrap(),
                GameVersion::V1_21_1,
                "input {raw:?}"
            );
        }
    }

    #[test]
    fn test_every_canonical_version_round_trips() {
        for version in GameVersion::ALL {
            assert_eq!(GameVersion::parse(version.as_str()).unwrap(), version);
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        assert!(matches!(
            GameVersion::parse("1.99"),
            Err(MigrateError::Validation(_))
        ));
        assert!(matches!(
            GameVersion::parse(""),
            Err(MigrateError::Validation(_))
        ));
    }

    #[test]
    fn test_two_part_versions_do_not_match_longer_ones() {
        // "1.21.1" must not be claimed by V_1_21_11 and vice versa.
        assert_eq!(GameVersion::parse("1.21.11").unwrap(), GameVersion::V1_21_11);
        assert_eq!(GameVersion::parse("1.21.1").unwrap(), GameVersion::V1_21_1);
    }

    #[test]
    fn test_client_kind_accepts_discriminator_and_api_value() {
        assert_eq!(ClientKind::parse("Vanilla").unwrap(), ClientKind::Vanilla);
        assert_eq!(ClientKind::parse("default").unwrap(), ClientKind::Vanilla);
        assert_eq!(ClientKind::parse("FABRIC").unwrap(), ClientKind::Fabric);
        assert_eq!(ClientKind::parse("forge").unwrap(), ClientKind::Forge);
        assert!(ClientKind::parse("optifine").is_err());
    }

    #[test]
    fn test_user_role_collapses_admin_equivalents() {
        assert_eq!(UserRole::from_raw(Some("admin")), UserRole::Admin);
        assert_eq!(UserRole::from_raw(Some("Owner")), UserRole::Admin);
        assert_eq!(UserRole::from_raw(Some("DEVELOPER")), UserRole::Admin);
        assert_eq!(UserRole::from_raw(Some("moderator")), UserRole::User);
        assert_eq!(UserRole::from_raw(None), UserRole::User);
    }

    #[test]
    fn test_profile_role_allow_list() {
        assert_eq!(ProfileRole::from_raw(Some("tester")), ProfileRole::Tester);
        assert_eq!(ProfileRole::from_raw(Some("OWNER")), ProfileRole::Owner);
        assert_eq!(ProfileRole::from_raw(Some("sysop")), ProfileRole::User);
        assert_eq!(ProfileRole::from_raw(None), ProfileRole::User);
    }

    #[test]
    fn test_social_platform_and_friend_status() {
        assert_eq!(
            SocialPlatform::parse("discord"),
            Some(SocialPlatform::Discord)
        );
        assert_eq!(SocialPlatform::parse("myspace"), None);
        assert_eq!(FriendStatus::parse(" blocked "), Some(FriendStatus::Blocked));
        assert_eq!(FriendStatus::parse("FRIENDED"), None);
    }

    #[test]
    fn test_timestamp_parses_utc_z_designator() {
        let parsed = parse_timestamp("2024-03-05T12:30:00.123Z").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_timestamp_converts_numeric_offsets_to_utc() {
        let parsed = parse_timestamp("2024-03-05T15:30:00+03:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_timestamp_without_offset_is_taken_as_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-05T12:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-05 12:30:00").unwrap(), expected);
    }

    #[test]
    fn test_unparseable_timestamp_is_none() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("2024-13-45T99:99:99Z").is_none());
    }
}
