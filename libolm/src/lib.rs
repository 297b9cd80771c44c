//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Operator Lifecycle Manager core.
//!
//! Catalog content is loaded into [`catalog::Catalog`]s and registered with a
//! [`registry::SourceRegistry`]. The [`resolver`] turns the subscriptions of a
//! namespace into the set of bundles to install, [`plan`] renders that set
//! into ordered InstallPlan steps and executes them, and [`reconcile`] ties
//! the pieces together into a single sync pass over a cluster snapshot.

#[allow(clippy::result_large_err)]
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod crd;
pub mod plan;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod solver;
pub mod version;
