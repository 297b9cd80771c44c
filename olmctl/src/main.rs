//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

mod catalogs;
mod config;
mod error;

use catalogs::{load_catalog, CatalogFormat, CatalogRef};
use config::Config;
use error::{OlmctlError, Result};

use clap::{Parser, Subcommand};
use libolm::catalog::{check_continuity, Querier, SourceKey};
use libolm::cluster::{ClusterState, Subscription};
use libolm::crd::{ensure_v1_crd_versions, parse_crd, stored_versions};
use libolm::plan::InstallPlan;
use libolm::reconcile::{Operator, SyncOutcome};
use libolm::registry::SourceRegistry;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

/// olmctl - offline tooling for Operator Lifecycle Manager catalogs
///
/// Validates catalogs, checks that a new catalog release keeps every
/// upgrade path of the previous one, and resolves cluster snapshots into
/// InstallPlans without talking to a cluster.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct App {
    /// Path to an olmctl.kdl config file
    ///
    /// Defaults to olmctl.kdl in the working directory when present.
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a catalog and check its channel heads and replaces chains
    Validate {
        /// Catalog directory or file
        path: PathBuf,

        #[clap(long, value_enum, default_value = "auto")]
        format: CatalogFormat,
    },

    /// Check that a new catalog release keeps the upgrade paths of the previous one
    ///
    /// Every replaces edge in NEXT must name a bundle of PREVIOUS, directly or
    /// through bundles that are new in NEXT.
    Continuity {
        previous: PathBuf,
        next: PathBuf,

        #[clap(long, value_enum, default_value = "auto")]
        format: CatalogFormat,
    },

    /// Resolve the subscriptions of a cluster snapshot into InstallPlans
    ///
    /// Reads a YAML cluster state (subscriptions, operatorGroups, installed,
    /// installPlans) and prints the updated subscriptions and plans as JSON.
    Resolve {
        /// Cluster state YAML file
        state: PathBuf,

        /// Catalog to register, as NAME/NAMESPACE=PATH (repeatable)
        #[clap(long = "catalog", short = 'k')]
        catalogs: Vec<String>,

        /// Only resolve this namespace
        #[clap(short, long)]
        namespace: Option<String>,

        /// Solver backend: greedy or sat
        #[clap(long)]
        solver: Option<String>,
    },

    /// Check that updating a CRD keeps every stored version
    CheckCrd {
        /// The CRD as it is on the cluster, status included
        existing: PathBuf,
        /// The CRD about to be applied
        new: PathBuf,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveOutput {
    subscriptions: Vec<Subscription>,
    install_plans: Vec<InstallPlan>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<FailureOutput>,
}

#[derive(Serialize)]
struct FailureOutput {
    namespace: String,
    reason: String,
    message: String,
}

fn main() -> miette::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env()
        .map_err(|e| OlmctlError::LoggingEnv(format!("failed to parse environment filter: {}", e)))?;

    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .without_time()
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = App::parse();
    debug!(command = ?cli.command, "parsed command line");
    run(cli)?;
    Ok(())
}

fn run(cli: App) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Validate { path, format } => validate(&path, format),
        Commands::Continuity {
            previous,
            next,
            format,
        } => continuity(&previous, &next, format),
        Commands::Resolve {
            state,
            catalogs,
            namespace,
            solver,
        } => resolve(&config, &state, &catalogs, namespace.as_deref(), solver.as_deref()),
        Commands::CheckCrd { existing, new } => check_crd(&existing, &new),
    }
}

fn local_source() -> SourceKey {
    SourceKey::new("local", "olm")
}

fn validate(path: &Path, format: CatalogFormat) -> Result<()> {
    let catalog = load_catalog(path, format, local_source())?;
    catalog.validate()?;
    for package in catalog.packages() {
        for channel in &package.channels {
            let marker = if channel.name == package.default_channel_name {
                " (default)"
            } else {
                ""
            };
            println!(
                "{}\t{}{}\t{}",
                package.name, channel.name, marker, channel.current_csv_name
            );
        }
    }
    println!(
        "catalog is valid: {} package(s), {} bundle(s)",
        catalog.packages().count(),
        catalog.bundles().count()
    );
    Ok(())
}

fn continuity(previous: &Path, next: &Path, format: CatalogFormat) -> Result<()> {
    let previous = load_catalog(previous, format, SourceKey::new("previous", "olm"))?;
    let next = load_catalog(next, format, SourceKey::new("next", "olm"))?;
    let issues = check_continuity(&previous, &next)?;
    if issues.is_empty() {
        println!(
            "all {} bundle(s) of the new release connect to the previous release",
            next.list_services()?.len()
        );
        return Ok(());
    }
    for issue in &issues {
        println!("{}", issue);
    }
    Err(OlmctlError::ContinuityViolations {
        count: issues.len(),
    })
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|source| OlmctlError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| OlmctlError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve(
    config: &Config,
    state_path: &Path,
    catalog_args: &[String],
    only_namespace: Option<&str>,
    solver: Option<&str>,
) -> Result<()> {
    let mut resolver_config = config.resolver_config()?;
    if let Some(solver) = solver {
        resolver_config.solver = config::parse_solver(solver)?;
    }
    let global = resolver_config.global_catalog_namespace.clone();

    let mut refs = config
        .catalogs
        .iter()
        .map(|c| CatalogRef::from_config(c, &global))
        .collect::<Result<Vec<_>>>()?;
    for arg in catalog_args {
        refs.push(CatalogRef::parse(arg, &global)?);
    }
    if refs.is_empty() {
        warn!("no catalogs configured; only installed operators can satisfy subscriptions");
    }

    let registry = SourceRegistry::new();
    for r in &refs {
        registry.register(r.load()?);
    }

    let mut state: ClusterState = read_yaml(state_path)?;
    let namespaces: Vec<String> = match only_namespace {
        Some(ns) => vec![ns.to_string()],
        None => state.namespaces().into_iter().map(str::to_string).collect(),
    };

    let operator = Operator::new(&resolver_config, &registry);
    let now = chrono::Utc::now();
    let mut failures = Vec::new();
    for ns in &namespaces {
        match operator.sync_namespace(&mut state, ns, now) {
            SyncOutcome::UpToDate => info!(namespace = %ns, "up to date"),
            SyncOutcome::PlanCreated { name } => info!(namespace = %ns, plan = %name, "plan created"),
            SyncOutcome::PlanInFlight { name } => info!(namespace = %ns, plan = %name, "plan in flight"),
            SyncOutcome::ResolutionFailed(e) => failures.push(FailureOutput {
                namespace: ns.clone(),
                reason: e.reason().to_string(),
                message: e.to_string(),
            }),
            SyncOutcome::PlanFailed(e) => failures.push(FailureOutput {
                namespace: ns.clone(),
                reason: "Invalid".to_string(),
                message: e.to_string(),
            }),
        }
    }

    let failed = failures.len();
    let output = ResolveOutput {
        subscriptions: state.subscriptions,
        install_plans: state.install_plans,
        failures,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    if failed > 0 {
        return Err(OlmctlError::ResolutionFailed { count: failed });
    }
    Ok(())
}

fn check_crd(existing: &Path, new: &Path) -> Result<()> {
    let existing = parse_crd(&read_yaml::<serde_json::Value>(existing)?)?;
    let new = parse_crd(&read_yaml::<serde_json::Value>(new)?)?;
    ensure_v1_crd_versions(&existing, &new)?;
    let stored = stored_versions(&existing);
    println!(
        "{}: update keeps stored version(s) {}",
        new.metadata.name.as_deref().unwrap_or_default(),
        if stored.is_empty() {
            "(none recorded)".to_string()
        } else {
            stored.join(", ")
        }
    );
    Ok(())
}
