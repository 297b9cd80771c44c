//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{Assignment, Problem, Requirement, Result, Satisfier, SolverError, VarId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Depth-first search with chronological backtracking.
///
/// Mandatory requirements are visited in insertion order, then the
/// requirements of each selected variable in selection order. Every
/// requirement tries its candidates in the order given, so the first model
/// found is the most preferred one and identical problems always yield
/// identical assignments.
#[derive(Debug, Clone, Copy)]
pub struct GreedySatisfier {
    budget: usize,
}

impl GreedySatisfier {
    pub fn new(budget: usize) -> Self {
        GreedySatisfier { budget }
    }
}

impl Default for GreedySatisfier {
    fn default() -> Self {
        GreedySatisfier::new(100_000)
    }
}

impl Satisfier for GreedySatisfier {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn satisfy(&self, problem: &Problem) -> Result<Assignment> {
        problem.check()?;
        let mut search = Search {
            problem,
            budget: self.budget,
            decisions: 0,
            order: Vec::new(),
            chosen: BTreeSet::new(),
            groups: BTreeMap::new(),
            dead_ends: BTreeSet::new(),
        };
        if search.descend()? {
            debug!(selected = search.order.len(), decisions = search.decisions, "greedy search found a model");
            Ok(Assignment::new(search.order))
        } else {
            Err(SolverError::Unsatisfiable {
                reasons: search.dead_ends.into_iter().collect(),
            })
        }
    }
}

struct Search<'p> {
    problem: &'p Problem,
    budget: usize,
    decisions: usize,
    /// Selected variables in selection order
    order: Vec<VarId>,
    chosen: BTreeSet<VarId>,
    groups: BTreeMap<&'p str, VarId>,
    /// Requirements that ran out of selectable candidates
    dead_ends: BTreeSet<String>,
}

impl<'p> Search<'p> {
    fn next_unsatisfied(&self) -> Option<&'p Requirement> {
        let problem = self.problem;
        let satisfied = |r: &Requirement| r.candidates.iter().any(|c| self.chosen.contains(c));
        problem
            .mandatory_requirements()
            .find(|r| !satisfied(r))
            .or_else(|| {
                self.order
                    .iter()
                    .flat_map(|&v| problem.requirements_of(v))
                    .find(|r| !satisfied(r))
            })
    }

    fn selectable(&self, v: VarId) -> bool {
        let group = self.problem.variables()[v].group.as_str();
        if self.groups.get(group).is_some_and(|&owner| owner != v) {
            return false;
        }
        !self.problem.conflicts().iter().any(|c| {
            c.members.contains(&v)
                && c
                    .members
                    .iter()
                    .any(|m| *m != v && self.chosen.contains(m))
        })
    }

    fn select(&mut self, v: VarId) {
        let group = self.problem.variables()[v].group.as_str();
        self.groups.insert(group, v);
        self.chosen.insert(v);
        self.order.push(v);
    }

    fn undo(&mut self, v: VarId) {
        let group = self.problem.variables()[v].group.as_str();
        self.groups.remove(group);
        self.chosen.remove(&v);
        self.order.pop();
    }

    fn descend(&mut self) -> Result<bool> {
        let Some(requirement) = self.next_unsatisfied() else {
            return Ok(true);
        };
        let mut tried = false;
        for &candidate in &requirement.candidates {
            if !self.selectable(candidate) {
                continue;
            }
            tried = true;
            self.decisions += 1;
            if self.decisions > self.budget {
                return Err(SolverError::BudgetExceeded {
                    budget: self.budget,
                });
            }
            trace!(
                candidate = %self.problem.variables()[candidate].label,
                requirement = %requirement.description,
                "trying candidate"
            );
            self.select(candidate);
            if self.descend()? {
                return Ok(true);
            }
            self.undo(candidate);
        }
        if !tried {
            self.dead_ends.insert(requirement.description.clone());
        }
        Ok(false)
    }
}
