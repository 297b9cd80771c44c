//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};

/// Which satisfiability backend the resolver hands its problem to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SolverBackend {
    /// Deterministic depth-first search with backtracking
    #[default]
    Greedy,
    /// CDCL search through resolvo
    Sat,
}

/// Exponential backoff between plan execution retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (starting at 0), doubling up to the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

/// Resolver settings, built once at startup and passed by reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolverConfig {
    pub solver: SolverBackend,
    /// Catalogs in this namespace are visible to subscriptions in every namespace
    pub global_catalog_namespace: String,
    /// Upper bound on solver decisions before a resolution is abandoned
    pub search_budget: usize,
    pub backoff: BackoffConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            solver: SolverBackend::Greedy,
            global_catalog_namespace: "olm".to_string(),
            search_budget: 100_000,
            backoff: BackoffConfig::default(),
        }
    }
}
