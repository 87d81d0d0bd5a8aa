// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Store-wide CC configuration
//!
//! The CC algorithm is chosen once per store; every row created through a
//! [`crate::CcContext`] uses it. The configuration is plain TOML:
//!
//! ```toml
//! algorithm = "locking"
//!
//! [lock]
//! wait_policy = "always_wait"
//! queue_behind_waiters = false
//! initial_pool_capacity = 4
//!
//! [priority]
//! skip_lowest_reservation = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CcError, CcResult};

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "DOTCC_CONFIG";
/// Environment variable overriding the algorithm
pub const ALGORITHM_ENV: &str = "DOTCC_ALGORITHM";

/// Row-level CC algorithm used by the whole store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CcAlgorithm {
    /// Retirement-aware lock manager
    #[default]
    Locking,
    /// Priority-preemptive optimistic protocol
    Priority,
}

impl CcAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            CcAlgorithm::Locking => "locking",
            CcAlgorithm::Priority => "priority",
        }
    }

    fn parse(value: &str) -> CcResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "locking" | "lock" => Ok(CcAlgorithm::Locking),
            "priority" | "prio" => Ok(CcAlgorithm::Priority),
            other => Err(CcError::Config(format!("unknown CC algorithm '{other}'"))),
        }
    }
}

/// Built-in deadlock-avoidance policies for the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicyKind {
    /// Always queue; an external detector aborts victims
    #[default]
    AlwaysWait,
    /// Abort on any conflict
    NoWait,
    /// Older requesters wait, younger ones abort
    WaitDie,
}

/// Lock manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Avoidance policy consulted when a request conflicts
    pub wait_policy: WaitPolicyKind,
    /// Queue compatible newcomers behind existing waiters instead of granting them
    pub queue_behind_waiters: bool,
    /// Entries preallocated in each row's pool
    pub initial_pool_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_policy: WaitPolicyKind::AlwaysWait,
            queue_behind_waiters: false,
            initial_pool_capacity: 4,
        }
    }
}

/// Priority protocol settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Do not take a reservation when both the row and the caller sit at the lowest level
    pub skip_lowest_reservation: bool,
}

/// Store-wide CC configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcConfig {
    pub algorithm: CcAlgorithm,
    pub lock: LockConfig,
    pub priority: PriorityConfig,
}

impl CcConfig {
    /// Configuration for the lock manager algorithm
    pub fn locking() -> Self {
        Self { algorithm: CcAlgorithm::Locking, ..Self::default() }
    }

    /// Configuration for the priority algorithm
    pub fn priority() -> Self {
        Self { algorithm: CcAlgorithm::Priority, ..Self::default() }
    }

    pub fn from_toml_str(content: &str) -> CcResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> CcResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> CcResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> CcResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Resolve the effective configuration.
    ///
    /// Order: explicit path, then `DOTCC_CONFIG`, then defaults.
    /// `DOTCC_ALGORITHM` overrides the algorithm of whichever was loaded.
    pub fn resolve(cli_config: Option<PathBuf>) -> CcResult<Self> {
        let env_config = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let env_algorithm = std::env::var(ALGORITHM_ENV).ok();
        Self::resolve_from(cli_config, env_config, env_algorithm.as_deref())
    }

    fn resolve_from(cli_config: Option<PathBuf>, env_config: Option<PathBuf>, env_algorithm: Option<&str>) -> CcResult<Self> {
        let mut config = match cli_config.or(env_config) {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        if let Some(algorithm) = env_algorithm {
            config.algorithm = CcAlgorithm::parse(algorithm)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no row could be built with
    pub fn validate(&self) -> CcResult<()> {
        if self.lock.initial_pool_capacity > u32::MAX as usize {
            return Err(CcError::Config(format!("initial_pool_capacity {} exceeds the entry handle range", self.lock.initial_pool_capacity)));
        }
        Ok(())
    }
}
