//! Environment-driven configuration.
//!
//! Connection settings come from `DATABASE_URL` or the individual
//! `POSTGRES_*` variables, matching the environment the legacy stack
//! already ships. A `.env` file discoverable from the working directory
//! upward is loaded first and never overrides real environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::{MigrateError, Result};

/// Rows per statement chunk for batched upserts.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Destination connection settings.
#[derive(Clone)]
pub struct DbConfig {
    /// Full connection string; wins over the individual fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Read connection settings from the environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = get("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            return Ok(Self {
                url: Some(url),
                host: String::new(),
                port: 0,
                dbname: String::new(),
                user: String::new(),
                password: String::new(),
            });
        }

        let port = match get("POSTGRES_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                MigrateError::Config(format!("POSTGRES_PORT is not a valid port: {raw}"))
            })?,
            None => 5433,
        };

        Ok(Self {
            url: None,
            host: get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            dbname: get("POSTGRES_DB").unwrap_or_else(|| "atlas".to_string()),
            user: get("POSTGRES_USER").unwrap_or_else(|| "atlas_user".to_string()),
            password: get("POSTGRES_PASSWORD").unwrap_or_else(|| "atlas_password".to_string()),
        })
    }

    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "host={} port={} dbname={} user={} password={}",
                self.host, self.port, self.dbname, self.user, self.password
            ),
        }
    }

    /// Human-readable destination label with no credentials in it.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.dbname),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Load a `.env` file if one is discoverable. Existing environment
/// variables always win over file contents.
pub fn load_dotenv() {
    let _ = dotenv::dotenv();
}

/// Paths to the JSON snapshot files. Every file is optional on disk;
/// a missing file is an empty input, not an error.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub clients: PathBuf,
    pub fabric_clients: PathBuf,
    pub forge_clients: PathBuf,
    pub analytics: PathBuf,
    pub users: PathBuf,
    pub user_profiles: PathBuf,
    pub social_links: PathBuf,
    pub friendships: PathBuf,
}

impl Default for SnapshotPaths {
    fn default() -> Self {
        Self {
            clients: PathBuf::from("migration/clients.json"),
            fabric_clients: PathBuf::from("migration/fabric-clients.json"),
            forge_clients: PathBuf::from("migration/forge-clients.json"),
            analytics: PathBuf::from("migration/analytics.json"),
            users: PathBuf::from("migration/users.json"),
            user_profiles: PathBuf::from("migration/user_data.json"),
            social_links: PathBuf::from("migration/social_links.json"),
            friendships: PathBuf::from("migration/friendships.json"),
        }
    }
}

/// Which entities this run migrates. Selector flags narrow the run;
/// with no selector set, every entity with available input runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitySelection {
    pub clients: bool,
    pub fabric: bool,
    pub forge: bool,
    pub analytics: bool,
    pub users: bool,
    pub user_profiles: bool,
    pub social_links: bool,
    pub friendships: bool,
}

impl EntitySelection {
    /// All entities selected.
    pub fn all() -> Self {
        Self {
            clients: true,
            fabric: true,
            forge: true,
            analytics: true,
            users: true,
            user_profiles: true,
            social_links: true,
            friendships: true,
        }
    }

    fn any(&self) -> bool {
        self.clients
            || self.fabric
            || self.forge
            || self.analytics
            || self.users
            || self.user_profiles
            || self.social_links
            || self.friendships
    }

    /// Resolve the selector flags: when nothing was selected, everything
    /// runs.
    pub fn effective(self) -> Self {
        if self.any() {
            self
        } else {
            Self::all()
        }
    }
}

/// Runtime toggles for a migration run.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Skip resynchronizing the clients/users id sequences after writing.
    pub skip_sequence_reset: bool,

    /// Rows per statement chunk.
    pub batch_size: usize,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            skip_sequence_reset: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults_match_legacy_stack() {
        let config = DbConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5433);
        assert_eq!(config.dbname, "atlas");
        assert_eq!(config.user, "atlas_user");
        assert_eq!(config.password, "atlas_password");
        assert!(config.url.is_none());
    }

    #[test]
    fn test_database_url_wins_over_parts() {
        let config = DbConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://u:p@db:5432/atlas"),
            ("POSTGRES_HOST", "ignored"),
        ]))
        .unwrap();
        assert_eq!(
            config.connection_string(),
            "postgres://u:p@db:5432/atlas"
        );
    }

    #[test]
    fn test_blank_database_url_falls_back_to_parts() {
        let config =
            DbConfig::from_lookup(lookup(&[("DATABASE_URL", "  "), ("POSTGRES_HOST", "db")]))
                .unwrap();
        assert!(config.url.is_none());
        assert_eq!(config.host, "db");
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let err = DbConfig::from_lookup(lookup(&[("POSTGRES_PORT", "54cd")])).unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_connection_string_from_parts() {
        let config = DbConfig::from_lookup(lookup(&[
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_PORT", "6432"),
            ("POSTGRES_DB", "atlas_prod"),
        ]))
        .unwrap();
        assert_eq!(
            config.connection_string(),
            "host=db.internal port=6432 dbname=atlas_prod user=atlas_user password=atlas_password"
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = DbConfig::from_lookup(lookup(&[("POSTGRES_PASSWORD", "hunter2")])).unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));

        let with_url =
            DbConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://u:hunter2@db/x")]))
                .unwrap();
        let debug = format!("{:?}", with_url);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_selection_defaults_to_everything() {
        let effective = EntitySelection::default().effective();
        assert_eq!(effective, EntitySelection::all());
    }

    #[test]
    fn test_selection_narrows_when_any_flag_set() {
        let effective = EntitySelection {
            users: true,
            ..Default::default()
        }
        .effective();
        assert!(effective.users);
        assert!(!effective.clients);
        assert!(!effective.friendships);
    }

    #[test]
    fn test_default_paths_point_at_migration_dir() {
        let paths = SnapshotPaths::default();
        assert_eq!(paths.clients, PathBuf::from("migration/clients.json"));
        assert_eq!(
            paths.fabric_clients,
            PathBuf::from("migration/fabric-clients.json")
        );
        assert_eq!(
            paths.user_profiles,
            PathBuf::from("migration/user_data.json")
        );
    }
}
