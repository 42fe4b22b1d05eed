//! Target configuration resolved from the process environment.
//!
//! Each target `NAME` reads `NAME_DB_HOST`, `NAME_DB_PORT`, `NAME_DB_USER`,
//! `NAME_DB_PASSWORD`, `NAME_DB_NAME` and `NAME_USE_SSH`. A shared bastion is
//! described by `SSH_BASTION_HOST`, `SSH_BASTION_PORT`, `SSH_BASTION_USER`,
//! `SSH_KEY_PATH` and `SSH_KEY_PASSPHRASE`; every target uses it unless its
//! `NAME_USE_SSH` is `false`.
//!
//! Missing credentials resolve to empty strings. Bad credentials surface at
//! connect time, never here.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{DatabaseTarget, DriverKind, SshDescriptor};

/// Overrides the built-in target list, e.g. `crm=mysql,odoo=postgres`.
pub const TARGETS_VAR: &str = "QUARRY_TARGETS";

/// Targets known when `QUARRY_TARGETS` is unset.
pub const DEFAULT_TARGETS: &[(&str, DriverKind)] =
    &[("laravel", DriverKind::MySql), ("odoo", DriverKind::Postgres)];

/// Read access to environment variables.
pub trait EnvSource {
    /// Look up a variable; `None` when unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Named targets, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct TargetCatalog {
    targets: BTreeMap<String, DatabaseTarget>,
}

impl TargetCatalog {
    /// Build a catalog from already-resolved targets.
    pub fn from_targets(targets: impl IntoIterator<Item = DatabaseTarget>) -> Self {
        Self { targets: targets.into_iter().map(|t| (t.name.clone(), t)).collect() }
    }

    /// Look up a target, failing with the list of known names.
    pub fn get(&self, name: &str) -> QuarryResult<&DatabaseTarget> {
        self.targets
            .get(name)
            .ok_or_else(|| QuarryError::unknown_target(name, self.names()))
    }

    /// Target names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// All targets in name order.
    pub fn iter(&self) -> impl Iterator<Item = &DatabaseTarget> {
        self.targets.values()
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Check if no targets are configured.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Builds the target catalog from environment state.
pub struct ConfigResolver;

impl ConfigResolver {
    /// Resolve every configured target from the given environment.
    pub fn list_targets(env: &impl EnvSource) -> TargetCatalog {
        let bastion = Self::bastion(env);
        let catalog = TargetCatalog::from_targets(
            Self::target_kinds(env)
                .into_iter()
                .map(|(name, driver)| Self::resolve_target(env, &name, driver, bastion.as_ref())),
        );

        tracing::debug!(
            targets = ?catalog.names().collect::<Vec<_>>(),
            bastion = bastion.is_some(),
            "Resolved database targets"
        );
        catalog
    }

    /// Resolve targets from the real process environment.
    pub fn from_process_env() -> TargetCatalog {
        Self::list_targets(&ProcessEnv)
    }

    /// Target names and dialects, from `QUARRY_TARGETS` or the defaults.
    fn target_kinds(env: &impl EnvSource) -> Vec<(String, DriverKind)> {
        let Some(list) = env.var(TARGETS_VAR).filter(|s| !s.trim().is_empty()) else {
            return DEFAULT_TARGETS
                .iter()
                .map(|(name, driver)| (name.to_string(), *driver))
                .collect();
        };

        list.split(',')
            .filter_map(|entry| {
                let (name, driver) = entry.split_once('=')?;
                let name = name.trim().to_lowercase();
                match DriverKind::parse(driver) {
                    Some(driver) if !name.is_empty() => Some((name, driver)),
                    _ => {
                        tracing::warn!(entry = entry.trim(), "Ignoring malformed target entry");
                        None
                    }
                }
            })
            .collect()
    }

    /// Shared bastion descriptor, if `SSH_BASTION_HOST` is set.
    fn bastion(env: &impl EnvSource) -> Option<SshDescriptor> {
        let host = env.var("SSH_BASTION_HOST").filter(|h| !h.trim().is_empty())?;
        let port = env
            .var("SSH_BASTION_PORT")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(22);
        let key_path = env
            .var("SSH_KEY_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_key_path);

        let mut descriptor =
            SshDescriptor::new(host, env.var("SSH_BASTION_USER").unwrap_or_default(), key_path)
                .with_port(port);
        descriptor.key_passphrase = env.var("SSH_KEY_PASSPHRASE").filter(|p| !p.is_empty());
        Some(descriptor)
    }

    fn resolve_target(
        env: &impl EnvSource,
        name: &str,
        driver: DriverKind,
        bastion: Option<&SshDescriptor>,
    ) -> DatabaseTarget {
        let prefix = name.to_uppercase();
        let var = |suffix: &str| env.var(&format!("{prefix}_{suffix}")).unwrap_or_default();

        let port = var("DB_PORT").trim().parse().unwrap_or_else(|_| driver.default_port());
        let ssh_disabled = var("USE_SSH").trim().eq_ignore_ascii_case("false");

        DatabaseTarget {
            name: name.to_string(),
            driver,
            host: var("DB_HOST"),
            port,
            username: var("DB_USER"),
            password: var("DB_PASSWORD"),
            database: var("DB_NAME"),
            ssh: if ssh_disabled { None } else { bastion.cloned() },
        }
    }
}

/// `~/.ssh/id_rsa`, or a relative path when no home directory is known.
fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from(".ssh/id_rsa"))
}
