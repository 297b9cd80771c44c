//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Satisfiability over bundle selections.
//!
//! The resolver encodes its choices as a [`Problem`]:
//! - every candidate bundle is a [`Variable`] belonging to a group (its
//!   package); at most one variable per group may be selected
//! - a [`Requirement`] says that if its subject is selected, at least one of
//!   its candidates must be selected too. Requirements without a subject are
//!   mandatory. Candidates are listed in order of preference
//! - a [`Conflict`] says at most one of its members may be selected
//!
//! A [`Satisfier`] turns the problem into an [`Assignment`]. Two backends are
//! provided: [`GreedySatisfier`], a deterministic depth-first search that
//! honors candidate preference exactly, and [`SatSatisfier`], which delegates
//! to resolvo's CDCL solver.

mod greedy;
mod sat;

pub use greedy::GreedySatisfier;
pub use sat::SatSatisfier;

use crate::config::{ResolverConfig, SolverBackend};
use miette::Diagnostic;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub type VarId = usize;

#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("constraints not satisfiable: {}", reasons.join("; "))]
    #[diagnostic(
        code(olm::solver_error::unsatisfiable),
        help("Each reason names a requirement no remaining candidate could meet")
    )]
    Unsatisfiable { reasons: Vec<String> },

    #[error("search abandoned after {budget} decisions")]
    #[diagnostic(
        code(olm::solver_error::budget_exceeded),
        help("Raise the resolver search budget or reduce the number of candidate bundles")
    )]
    BudgetExceeded { budget: usize },

    #[error("malformed problem: {0}")]
    #[diagnostic(code(olm::solver_error::invalid_problem))]
    InvalidProblem(String),
}

pub type Result<T> = std::result::Result<T, SolverError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub label: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// `None` for mandatory requirements
    pub subject: Option<VarId>,
    /// Alternatives, most preferred first
    pub candidates: Vec<VarId>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub members: Vec<VarId>,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct Problem {
    variables: Vec<Variable>,
    requirements: Vec<Requirement>,
    conflicts: Vec<Conflict>,
    by_subject: BTreeMap<VarId, Vec<usize>>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, label: impl Into<String>, group: impl Into<String>) -> VarId {
        self.variables.push(Variable {
            label: label.into(),
            group: group.into(),
        });
        self.variables.len() - 1
    }

    /// If `subject` is selected, one of `candidates` must be
    pub fn require(&mut self, subject: VarId, candidates: Vec<VarId>, description: impl Into<String>) {
        self.by_subject
            .entry(subject)
            .or_default()
            .push(self.requirements.len());
        self.requirements.push(Requirement {
            subject: Some(subject),
            candidates,
            description: description.into(),
        });
    }

    /// One of `candidates` must be selected
    pub fn mandatory(&mut self, candidates: Vec<VarId>, description: impl Into<String>) {
        self.requirements.push(Requirement {
            subject: None,
            candidates,
            description: description.into(),
        });
    }

    /// At most one of `members` may be selected
    pub fn at_most_one(&mut self, members: Vec<VarId>, description: impl Into<String>) {
        self.conflicts.push(Conflict {
            members,
            description: description.into(),
        });
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.variables.get(id)
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn mandatory_requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| r.subject.is_none())
    }

    pub fn requirements_of(&self, subject: VarId) -> impl Iterator<Item = &Requirement> {
        self.by_subject
            .get(&subject)
            .into_iter()
            .flatten()
            .map(|&i| &self.requirements[i])
    }

    /// Reject references to variables that do not exist
    pub fn check(&self) -> Result<()> {
        let n = self.variables.len();
        let bad = self
            .requirements
            .iter()
            .flat_map(|r| r.subject.iter().chain(r.candidates.iter()))
            .chain(self.conflicts.iter().flat_map(|c| c.members.iter()))
            .find(|&&v| v >= n);
        match bad {
            Some(v) => Err(SolverError::InvalidProblem(format!(
                "variable {} referenced but only {} declared",
                v, n
            ))),
            None => Ok(()),
        }
    }

    /// Describe the first constraint `assignment` violates, if any
    pub fn violation(&self, assignment: &Assignment) -> Option<String> {
        let mut groups: BTreeMap<&str, VarId> = BTreeMap::new();
        for &v in assignment.selected() {
            let group = self.variables.get(v)?.group.as_str();
            if let Some(other) = groups.insert(group, v) {
                return Some(format!(
                    "{} and {} are both selected from {}",
                    self.variables[other].label, self.variables[v].label, group
                ));
            }
        }
        for r in &self.requirements {
            let active = r.subject.map_or(true, |s| assignment.is_selected(s));
            if active && !r.candidates.iter().any(|&c| assignment.is_selected(c)) {
                return Some(r.description.clone());
            }
        }
        for c in &self.conflicts {
            if c.members.iter().filter(|&&m| assignment.is_selected(m)).count() > 1 {
                return Some(c.description.clone());
            }
        }
        None
    }
}

/// The set of selected variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    selected: BTreeSet<VarId>,
}

impl Assignment {
    pub fn new(selected: impl IntoIterator<Item = VarId>) -> Self {
        Assignment {
            selected: selected.into_iter().collect(),
        }
    }

    pub fn is_selected(&self, v: VarId) -> bool {
        self.selected.contains(&v)
    }

    pub fn selected(&self) -> impl Iterator<Item = &VarId> {
        self.selected.iter()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// A satisfiability backend
pub trait Satisfier {
    fn name(&self) -> &'static str;

    fn satisfy(&self, problem: &Problem) -> Result<Assignment>;
}

/// Construct the backend selected by `config`
pub fn satisfier_for(config: &ResolverConfig) -> Box<dyn Satisfier + Send + Sync> {
    match config.solver {
        SolverBackend::Greedy => Box::new(GreedySatisfier::new(config.search_budget)),
        SolverBackend::Sat => Box::new(SatSatisfier),
    }
}
