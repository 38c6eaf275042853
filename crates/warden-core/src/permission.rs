//! Permission strings: `category.action[:scope]`.
//!
//! Plugins declare these in their manifest (e.g. `filesystem.write:/notes`,
//! `network.request:*.example.com`). The sandbox forwards the declared list
//! to a [`PermissionRegistry`]; the privileged backends consult the registry
//! before touching disk, network, or persistent storage.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, WardenError};

/// The capability family a permission applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionCategory {
    Filesystem,
    Network,
    Storage,
    /// Any category this host has no dedicated matching rules for.
    Other(String),
}

impl PermissionCategory {
    pub fn parse(s: &str) -> Self {
        match s {
            "filesystem" | "fs" => PermissionCategory::Filesystem,
            "network" | "http" => PermissionCategory::Network,
            "storage" => PermissionCategory::Storage,
            other => PermissionCategory::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PermissionCategory::Filesystem => "filesystem",
            PermissionCategory::Network => "network",
            PermissionCategory::Storage => "storage",
            PermissionCategory::Other(s) => s,
        }
    }
}

/// A single parsed permission grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub category: PermissionCategory,
    pub action: String,
    pub scope: Option<String>,
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Permission {
    /// Parse `category.action[:scope]`. `*` is accepted as the action.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| WardenError::InvalidPermission {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let (head, scope) = match trimmed.split_once(':') {
            Some((head, scope)) => {
                if scope.is_empty() {
                    return Err(invalid("empty scope after ':'"));
                }
                (head, Some(scope.to_string()))
            }
            None => (trimmed, None),
        };

        let (category, action) = head
            .split_once('.')
            .ok_or_else(|| invalid("expected 'category.action'"))?;

        if !is_identifier(category) {
            return Err(invalid("category must be a non-empty identifier"));
        }
        if action != "*" && !is_identifier(action) {
            return Err(invalid("action must be an identifier or '*'"));
        }

        Ok(Self {
            category: PermissionCategory::parse(category),
            action: action.to_string(),
            scope,
        })
    }

    /// Whether this grant covers `action` on `target`.
    pub fn allows(&self, category: &PermissionCategory, action: &str, target: Option<&str>) -> bool {
        if &self.category != category {
            return false;
        }
        if self.action != "*" && self.action != action {
            return false;
        }
        let scope = match self.scope.as_deref() {
            None | Some("*") => return true,
            Some(scope) => scope,
        };
        // A scoped grant needs something to compare against.
        let Some(target) = target else {
            return false;
        };
        match &self.category {
            PermissionCategory::Filesystem => path_in_scope(scope, target),
            PermissionCategory::Network => host_in_scope(scope, target),
            _ => match scope.strip_suffix('*') {
                Some(prefix) => target.starts_with(prefix),
                None => scope == target,
            },
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category.as_str(), self.action)?;
        if let Some(scope) = &self.scope {
            write!(f, ":{}", scope)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Permission {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Permission::parse(s)
    }
}

/// Segment-wise prefix match: `/notes` covers `/notes` and `/notes/a.txt`,
/// never `/notes2`.
fn path_in_scope(scope: &str, target: &str) -> bool {
    let scope = scope.trim_end_matches("/*");
    let norm = |p: &str| -> Vec<String> {
        p.split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect()
    };
    let scope_parts = norm(scope);
    let target_parts = norm(target);
    target_parts.len() >= scope_parts.len()
        && scope_parts
            .iter()
            .zip(target_parts.iter())
            .all(|(a, b)| a == b)
}

/// Host match with optional `*.` suffix wildcard. `target` may be a bare host
/// or a full URL.
fn host_in_scope(scope: &str, target: &str) -> bool {
    let host = url::Url::parse(target)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| target.to_string())
        .to_ascii_lowercase();
    let scope = scope.to_ascii_lowercase();
    match scope.strip_prefix("*.") {
        Some(domain) => host == domain || host.ends_with(&format!(".{}", domain)),
        None => host == scope,
    }
}

/// The set of grants held by one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    grants: Vec<Permission>,
}

impl PermissionSet {
    pub fn new(grants: Vec<Permission>) -> Self {
        Self { grants }
    }

    /// Parse every string, failing on the first malformed entry.
    pub fn parse_all<S: AsRef<str>>(inputs: &[S]) -> Result<Self> {
        inputs
            .iter()
            .map(|s| Permission::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    /// Parse every string, skipping (and logging) malformed entries.
    pub fn parse_lenient<S: AsRef<str>>(inputs: &[S]) -> Self {
        let grants = inputs
            .iter()
            .filter_map(|s| match Permission::parse(s.as_ref()) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(error = %e, "ignoring malformed permission");
                    None
                }
            })
            .collect();
        Self { grants }
    }

    pub fn allows(&self, category: &PermissionCategory, action: &str, target: Option<&str>) -> bool {
        self.grants
            .iter()
            .any(|g| g.allows(category, action, target))
    }

    pub fn grants(&self) -> &[Permission] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }
}

/// Shared `plugin_id → PermissionSet` table consulted by the backends.
#[derive(Debug, Clone, Default)]
pub struct PermissionRegistry {
    sets: Arc<RwLock<HashMap<String, PermissionSet>>>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the grants held by `plugin_id`.
    pub fn grant(&self, plugin_id: &str, set: PermissionSet) {
        debug!(plugin_id, grants = set.len(), "permissions granted");
        self.sets.write().insert(plugin_id.to_string(), set);
    }

    pub fn revoke(&self, plugin_id: &str) -> bool {
        self.sets.write().remove(plugin_id).is_some()
    }

    pub fn get(&self, plugin_id: &str) -> Option<PermissionSet> {
        self.sets.read().get(plugin_id).cloned()
    }

    pub fn allows(
        &self,
        plugin_id: &str,
        category: &PermissionCategory,
        action: &str,
        target: Option<&str>,
    ) -> bool {
        self.sets
            .read()
            .get(plugin_id)
            .is_some_and(|set| set.allows(category, action, target))
    }

    /// Like `allows`, but produces a `PermissionDenied` error naming the
    /// permission that would have been needed.
    pub fn check(
        &self,
        plugin_id: &str,
        category: PermissionCategory,
        action: &str,
        target: Option<&str>,
    ) -> Result<()> {
        if self.allows(plugin_id, &category, action, target) {
            return Ok(());
        }
        let needed = Permission {
            category,
            action: action.to_string(),
            scope: target.map(str::to_string),
        };
        warn!(plugin_id, permission = %needed, "permission denied");
        Err(WardenError::PermissionDenied {
            plugin_id: plugin_id.to_string(),
            permission: needed.to_string(),
        })
    }
}
