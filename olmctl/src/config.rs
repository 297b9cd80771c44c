//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::OlmctlError;
use libolm::config::{ResolverConfig, SolverBackend};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "olmctl.kdl";

/// Contents of `olmctl.kdl`
///
/// ```kdl
/// catalog "community" namespace="olm" path="./catalogs/community" format="declcfg"
/// resolver {
///     solver "sat"
///     global-namespace "olm"
///     backoff-initial-ms 500
/// }
/// ```
#[derive(Debug, knuffel::Decode, Clone, Default)]
pub struct Config {
    #[knuffel(children(name = "catalog"))]
    pub catalogs: Vec<CatalogConfig>,
    #[knuffel(child)]
    pub resolver: Option<ResolverSettings>,
}

#[derive(Debug, knuffel::Decode, Clone)]
pub struct CatalogConfig {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(property)]
    pub namespace: Option<String>,
    #[knuffel(property)]
    pub path: PathBuf,
    #[knuffel(property)]
    pub format: Option<String>,
}

#[derive(Debug, knuffel::Decode, Clone)]
pub struct ResolverSettings {
    #[knuffel(child, unwrap(argument))]
    pub solver: Option<String>,
    #[knuffel(child, unwrap(argument))]
    pub global_namespace: Option<String>,
    #[knuffel(child, unwrap(argument))]
    pub search_budget: Option<u64>,
    #[knuffel(child, unwrap(argument))]
    pub backoff_initial_ms: Option<u64>,
    #[knuffel(child, unwrap(argument))]
    pub backoff_max_ms: Option<u64>,
}

impl Config {
    /// Load the config at `path`, or `olmctl.kdl` in the working directory if
    /// it exists. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> crate::error::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG);
                if !default.is_file() {
                    return Ok(Config::default());
                }
                default
            }
        };
        let content = fs::read_to_string(&path).map_err(|source| OlmctlError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(path.to_str().unwrap_or(DEFAULT_CONFIG), &content)
    }

    pub fn parse(name: &str, content: &str) -> crate::error::Result<Self> {
        knuffel::parse(name, content)
            .map_err(|e| OlmctlError::Config(format!("failed to parse {}: {:?}", name, e)))
    }

    /// Resolver settings on top of the library defaults
    pub fn resolver_config(&self) -> crate::error::Result<ResolverConfig> {
        let mut cfg = ResolverConfig::default();
        let Some(settings) = &self.resolver else {
            return Ok(cfg);
        };
        if let Some(solver) = &settings.solver {
            cfg.solver = parse_solver(solver)?;
        }
        if let Some(ns) = &settings.global_namespace {
            cfg.global_catalog_namespace = ns.clone();
        }
        if let Some(budget) = settings.search_budget {
            cfg.search_budget = usize::try_from(budget)
                .map_err(|_| OlmctlError::Config(format!("search-budget {} is too large", budget)))?;
        }
        if let Some(ms) = settings.backoff_initial_ms {
            cfg.backoff.initial_ms = ms;
        }
        if let Some(ms) = settings.backoff_max_ms {
            cfg.backoff.max_ms = ms;
        }
        if cfg.backoff.initial_ms > cfg.backoff.max_ms {
            return Err(OlmctlError::Config(format!(
                "backoff-initial-ms {} exceeds backoff-max-ms {}",
                cfg.backoff.initial_ms, cfg.backoff.max_ms
            )));
        }
        Ok(cfg)
    }
}

pub fn parse_solver(s: &str) -> crate::error::Result<SolverBackend> {
    s.parse()
        .map_err(|_| OlmctlError::Config(format!("unknown solver {}, expected greedy or sat", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalogs_and_resolver() {
        let cfg = Config::parse(
            "test.kdl",
            r#"
catalog "community" namespace="olm" path="/srv/community" format="declcfg"
catalog "legacy" path="/srv/legacy"
resolver {
    solver "sat"
    global-namespace "operators-global"
    backoff-initial-ms 250
}
"#,
        )
        .unwrap();
        assert_eq!(cfg.catalogs.len(), 2);
        assert_eq!(cfg.catalogs[0].namespace.as_deref(), Some("olm"));
        assert_eq!(cfg.catalogs[1].format, None);

        let resolver = cfg.resolver_config().unwrap();
        assert_eq!(resolver.solver, SolverBackend::Sat);
        assert_eq!(resolver.global_catalog_namespace, "operators-global");
        assert_eq!(resolver.backoff.initial_ms, 250);
        assert_eq!(resolver.backoff.max_ms, 60_000);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::parse("empty.kdl", "").unwrap();
        assert!(cfg.catalogs.is_empty());
        assert_eq!(cfg.resolver_config().unwrap(), ResolverConfig::default());
    }

    #[test]
    fn rejects_bad_settings() {
        let cfg = Config::parse("bad.kdl", "resolver {\n    solver \"magic\"\n}\n").unwrap();
        assert!(cfg.resolver_config().is_err());

        let cfg = Config::parse(
            "bad.kdl",
            "resolver {\n    backoff-initial-ms 5000\n    backoff-max-ms 10\n}\n",
        )
        .unwrap();
        assert!(cfg.resolver_config().is_err());
    }
}
