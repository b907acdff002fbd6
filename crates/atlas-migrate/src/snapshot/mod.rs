//! Snapshot loading and normalization.
//!
//! One immutable read per run: every selected entity file is loaded,
//! parsed and normalized up front, before a single statement runs. Each
//! file is optional on disk (missing file == empty input), but a file
//! that exists must parse and carry the expected top-level shape; that
//! failure is fatal because it means the export is broken, not merely
//! incomplete.

pub mod canon;
pub mod records;

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{EntitySelection, SnapshotPaths};
use crate::error::{MigrateError, Result};
pub use records::{
    ClientRecord, DeclaredId, DependencyRecord, FriendshipRecord, ProfileRecord, SocialLinkRecord,
    UserRecord,
};

/// Source counter consumed from the analytics export.
const LOADER_LAUNCHES_SOURCE_KEY: &str = "total_loader_launches";

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).map_err(|e| MigrateError::snapshot(path, e.to_string()))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| MigrateError::snapshot(path, format!("invalid JSON: {e}")))?;
    Ok(Some(value))
}

/// Load an optional JSON array file. A present file with any other
/// top-level shape is a fatal snapshot error.
fn load_array(path: &Path) -> Result<Vec<Value>> {
    match read_json(path)? {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(MigrateError::snapshot(
            path,
            format!("expected a JSON array, found {}", json_kind(&other)),
        )),
    }
}

/// Load an optional JSON object file. A present file with any other
/// top-level shape is a fatal snapshot error.
fn load_object(path: &Path) -> Result<Map<String, Value>> {
    match read_json(path)? {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(MigrateError::snapshot(
            path,
            format!("expected a JSON object, found {}", json_kind(&other)),
        )),
    }
}

/// Everything one run consumes, normalized and counted.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Merged client batch: primary, then fabric, then forge lists.
    pub clients: Vec<ClientRecord>,
    pub clients_rejected: usize,
    /// The one analytics counter this tool migrates.
    pub loader_launches: Option<i64>,
    pub analytics_rejected: usize,
    pub users: Vec<UserRecord>,
    pub profiles: Vec<ProfileRecord>,
    pub social_links: Vec<SocialLinkRecord>,
    pub friendships: Vec<FriendshipRecord>,
}

impl Snapshot {
    /// Load and normalize every selected entity file.
    pub fn load(paths: &SnapshotPaths, selection: &EntitySelection) -> Result<Self> {
        let mut snapshot = Snapshot::default();

        // Dependencies ride along on the primary client list only; the
        // fabric/forge exports carry them too but those copies are stale.
        let client_sources = [
            (selection.clients, &paths.clients, true, "client"),
            (selection.fabric, &paths.fabric_clients, false, "fabric client"),
            (selection.forge, &paths.forge_clients, false, "forge client"),
        ];
        for (selected, path, with_dependencies, label) in client_sources {
            if !selected {
                continue;
            }
            let raw = load_array(path)?;
            let (accepted, rejected) = records::normalize_clients(&raw, with_dependencies);
            if !raw.is_empty() {
                info!(
                    "Loaded {} {} records from {} ({} rejected)",
                    accepted.len(),
                    label,
                    path.display(),
                    rejected
                );
            }
            snapshot.clients.extend(accepted);
            snapshot.clients_rejected += rejected;
        }

        if selection.analytics {
            let counters = load_object(&paths.analytics)?;
            match counters.get(LOADER_LAUNCHES_SOURCE_KEY).filter(|v| !v.is_null()) {
                None => {}
                Some(value) => match records::as_i64(value) {
                    Some(count) => snapshot.loader_launches = Some(count),
                    None => {
                        warn!(
                            "Ignoring non-integer {} value: {}",
                            LOADER_LAUNCHES_SOURCE_KEY, value
                        );
                        snapshot.analytics_rejected = 1;
                    }
                },
            }
        }

        if selection.users {
            let raw = load_array(&paths.users)?;
            snapshot.users = records::normalize_users(&raw);
            if !raw.is_empty() {
                info!(
                    "Loaded {} user records from {}",
                    snapshot.users.len(),
                    paths.users.display()
                );
            }
        }

        if selection.user_profiles {
            let raw = load_array(&paths.user_profiles)?;
            snapshot.profiles = records::normalize_profiles(&raw);
            if !raw.is_empty() {
                info!(
                    "Loaded {} profile records from {}",
                    snapshot.profiles.len(),
                    paths.user_profiles.display()
                );
            }
        }

        if selection.social_links {
            let raw = load_array(&paths.social_links)?;
            snapshot.social_links = records::normalize_social_links(&raw);
            if !raw.is_empty() {
                info!(
                    "Loaded {} social link records from {}",
                    snapshot.social_links.len(),
                    paths.social_links.display()
                );
            }
        }

        if selection.friendships {
            let raw = load_array(&paths.friendships)?;
            snapshot.friendships = records::normalize_friendships(&raw);
            if !raw.is_empty() {
                info!(
                    "Loaded {} friendship records from {}",
                    snapshot.friendships.len(),
                    paths.friendships.display()
                );
            }
        }

        Ok(snapshot)
    }
}
