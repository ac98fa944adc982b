//! Load order from `before`/`after` rules.
//!
//! Every mod becomes a node; each ordering rule is resolved against the
//! candidate mods with the reference matcher and turned into an edge pointing
//! from the mod that must load first to the one that must load later. A cycle
//! does not fail the sort: the mods come back in their original order and the
//! cycle members are reported for manual correction.

use crate::{
    library::{ModEntry, ModRule, RuleType},
    reference,
};
use petgraph::{
    algo::tarjan_scc,
    graph::{DiGraph, NodeIndex},
    Direction,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Supplies rules recorded outside the mod itself, e.g. from a metadata cache.
pub trait RuleLookup {
    fn rules_for(&self, mod_entry: &ModEntry) -> Vec<ModRule>;
}

/// Lookup used when no external rule source is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuleLookup;

impl RuleLookup for NoRuleLookup {
    fn rules_for(&self, _mod_entry: &ModEntry) -> Vec<ModRule> {
        Vec::new()
    }
}

impl<F> RuleLookup for F
where
    F: Fn(&ModEntry) -> Vec<ModRule>,
{
    fn rules_for(&self, mod_entry: &ModEntry) -> Vec<ModRule> {
        self(mod_entry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOutcome {
    /// Mod ids in ascending priority.
    pub order: Vec<String>,
    /// Members of each dependency cycle, in input order. Empty when sorted.
    pub cycles: Vec<Vec<String>>,
}

impl SortOutcome {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

pub fn sort_mods(mods: &[ModEntry], lookup: &dyn RuleLookup) -> SortOutcome {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..mods.len()).map(|idx| graph.add_node(idx)).collect();

    for (subject, mod_entry) in mods.iter().enumerate() {
        let mut rules = mod_entry.rules.clone();
        rules.extend(lookup.rules_for(mod_entry));

        for rule in rules.iter().filter(|rule| rule.kind.affects_order()) {
            for (object, candidate) in mods.iter().enumerate() {
                if object == subject || !reference::matches(candidate, &rule.reference) {
                    continue;
                }
                let (from, to) = match rule.kind {
                    RuleType::Before => (subject, object),
                    _ => (object, subject),
                };
                if !graph.contains_edge(nodes[from], nodes[to]) {
                    debug!(
                        first = %mods[from].id,
                        then = %mods[to].id,
                        "order edge"
                    );
                    graph.add_edge(nodes[from], nodes[to], ());
                }
            }
        }
    }

    let cycles = find_cycles(&graph, mods);
    if !cycles.is_empty() {
        for cycle in &cycles {
            warn!(members = %cycle.join(", "), "dependency cycle, keeping unsorted order");
        }
        return SortOutcome {
            order: mods.iter().map(|m| m.id.clone()).collect(),
            cycles,
        };
    }

    SortOutcome {
        order: stable_topological_order(&graph, &nodes)
            .into_iter()
            .map(|idx| mods[idx].id.clone())
            .collect(),
        cycles: Vec::new(),
    }
}

/// Reorders `mods` to follow the sorted id list.
pub fn apply_order(mods: &[ModEntry], outcome: &SortOutcome) -> Vec<ModEntry> {
    let by_id: HashMap<&str, &ModEntry> = mods.iter().map(|m| (m.id.as_str(), m)).collect();
    outcome
        .order
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|m| (*m).clone()))
        .collect()
}

fn find_cycles(graph: &DiGraph<usize, ()>, mods: &[ModEntry]) -> Vec<Vec<String>> {
    let mut cycles: Vec<Vec<usize>> = tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let mut members: Vec<usize> = component.into_iter().map(|node| graph[node]).collect();
            members.sort_unstable();
            members
        })
        .collect();
    cycles.sort();
    cycles
        .into_iter()
        .map(|members| members.into_iter().map(|idx| mods[idx].id.clone()).collect())
        .collect()
}

// Kahn's algorithm; among ready nodes the one earliest in the input wins so
// unrelated mods keep their relative order.
fn stable_topological_order(graph: &DiGraph<usize, ()>, nodes: &[NodeIndex]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|node| graph.neighbors_directed(*node, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for next in graph.neighbors_directed(nodes[idx], Direction::Outgoing) {
            let next = graph[next];
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    order
}
