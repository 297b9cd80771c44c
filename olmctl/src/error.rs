//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use libolm::catalog::CatalogError;
use libolm::crd::CrdError;
use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for olmctl operations
pub type Result<T> = std::result::Result<T, OlmctlError>;

/// Errors that can occur in olmctl operations
#[derive(Debug, Error, Diagnostic)]
pub enum OlmctlError {
    #[error("failed to read {path}")]
    #[diagnostic(
        code(olmctl::io_error),
        help("Check that the path exists and is readable")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}")]
    #[diagnostic(
        code(olmctl::yaml_error),
        help("Check the YAML syntax of the file")
    )]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON error: {0}")]
    #[diagnostic(code(olmctl::json_error))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Crd(#[from] CrdError),

    #[error("invalid configuration: {0}")]
    #[diagnostic(
        code(olmctl::config_error),
        help("See the olmctl.kdl example in the README")
    )]
    Config(String),

    #[error("unknown catalog format: {0}")]
    #[diagnostic(
        code(olmctl::unknown_format),
        help("Supported catalog formats: auto, manifests, declcfg")
    )]
    UnknownFormat(String),

    #[error("invalid catalog reference {0}")]
    #[diagnostic(
        code(olmctl::invalid_catalog_ref),
        help("Catalogs are given as NAME/NAMESPACE=PATH")
    )]
    InvalidCatalogRef(String),

    #[error("{count} continuity violation(s) found")]
    #[diagnostic(
        code(olmctl::continuity_violations),
        help("Every replaces edge of the new release must lead back into the previous release")
    )]
    ContinuityViolations { count: usize },

    #[error("resolution failed in {count} namespace(s)")]
    #[diagnostic(
        code(olmctl::resolution_failed),
        help("The failure of each namespace is listed in the output")
    )]
    ResolutionFailed { count: usize },

    #[error("logging environment setup error: {0}")]
    #[diagnostic(
        code(olmctl::logging_env_error),
        help("Check the RUST_LOG environment variable")
    )]
    LoggingEnv(String),
}
