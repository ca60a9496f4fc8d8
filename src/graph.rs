// Causal graph and backdoor adjustment sets.
//
// The graph is small and hand-specified, so adjustment sets are found by
// brute force: candidate subsets are tried smallest first and checked with
// a d-separation test on the moralised ancestral graph.

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::graphmap::UnGraphMap;
use petgraph::visit::{Bfs, IntoNeighbors, Reversed, Visitable};
use petgraph::Direction::Incoming;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CausalGraph {
    graph: DiGraph<String, ()>,
    nodes: BTreeMap<String, NodeIndex>,
    treatment: String,
    outcome: String,
}

impl CausalGraph {
    pub fn new(treatment: &str, outcome: &str) -> Self {
        let mut g = CausalGraph {
            graph: DiGraph::new(),
            nodes: BTreeMap::new(),
            treatment: treatment.to_string(),
            outcome: outcome.to_string(),
        };
        g.node(treatment);
        g.node(outcome);
        g
    }

    pub fn from_edges(treatment: &str, outcome: &str, edges: &[(&str, &str)]) -> Result<Self> {
        let mut g = CausalGraph::new(treatment, outcome);
        for (from, to) in edges {
            g.add_edge(from, to)?;
        }
        Ok(g)
    }

    // The household survey graph: nets reduce malaria risk, and income,
    // health and temperature drive both net use and risk.
    pub fn mosquito_nets() -> Result<Self> {
        CausalGraph::from_edges(
            "net",
            "malaria_risk",
            &[
                ("net", "malaria_risk"),
                ("income", "net"),
                ("income", "malaria_risk"),
                ("income", "health"),
                ("income", "eligible"),
                ("health", "net"),
                ("health", "malaria_risk"),
                ("temperature", "net"),
                ("temperature", "malaria_risk"),
                ("resistance", "malaria_risk"),
                ("eligible", "net"),
                ("household_size", "net"),
                ("household_size", "eligible"),
            ],
        )
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), idx);
        idx
    }

    fn index(&self, name: &str) -> Result<NodeIndex> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| Error::Graph(format!("unknown node `{name}`")))
    }

    // Add `from -> to`, creating nodes as needed. Edges closing a cycle are
    // rejected.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let a = self.node(from);
        let b = self.node(to);
        if a == b || has_path_connecting(&self.graph, b, a, None) {
            return Err(Error::Graph(format!("edge {from} -> {to} would create a cycle")));
        }
        self.graph.update_edge(a, b, ());
        Ok(())
    }

    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn parents(&self, name: &str) -> Result<BTreeSet<String>> {
        let idx = self.index(name)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Incoming)
            .map(|n| self.graph[n].clone())
            .collect())
    }

    // Every node reachable from `name`, excluding `name` itself.
    pub fn descendants(&self, name: &str) -> Result<BTreeSet<String>> {
        let idx = self.index(name)?;
        let reached = reachable(&self.graph, [idx]);
        Ok(reached
            .into_iter()
            .filter(|n| *n != idx)
            .map(|n| self.graph[n].clone())
            .collect())
    }

    fn indices<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<NodeIndex>> {
        names.iter().map(|n| self.index(n.as_ref())).collect()
    }

    // Whether `xs` and `ys` are d-separated given `given`.
    pub fn is_d_separated<S: AsRef<str>>(&self, xs: &[S], ys: &[S], given: &[S]) -> Result<bool> {
        Ok(d_separated(
            &self.graph,
            &self.indices(xs)?,
            &self.indices(ys)?,
            &self.indices(given)?,
        ))
    }

    // Backdoor criterion: no member of `set` descends from the treatment,
    // and `set` blocks every path into the treatment.
    pub fn satisfies_backdoor(&self, set: &BTreeSet<String>) -> Result<bool> {
        let descendants = self.descendants(&self.treatment)?;
        if set.iter().any(|s| descendants.contains(s)) {
            return Ok(false);
        }
        let t = self.index(&self.treatment)?;
        let y = self.index(&self.outcome)?;
        let mut backdoor = self.graph.clone();
        backdoor.retain_edges(|g, e| g.edge_endpoints(e).map_or(true, |(src, _)| src != t));
        let names: Vec<&String> = set.iter().collect();
        let z = self.indices(&names)?;
        Ok(d_separated(&backdoor, &BTreeSet::from([t]), &BTreeSet::from([y]), &z))
    }

    // Smallest set of observed nodes that satisfies the backdoor
    // criterion. Among sets of equal size the lexicographically first
    // (by node name) wins.
    pub fn adjustment_set(&self) -> Result<BTreeSet<String>> {
        let descendants = self.descendants(&self.treatment)?;
        let candidates: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| **n != self.treatment && **n != self.outcome && !descendants.contains(*n))
            .cloned()
            .collect();

        for size in 0..=candidates.len() {
            for subset in combinations(&candidates, size) {
                let set: BTreeSet<String> = subset.into_iter().collect();
                if self.satisfies_backdoor(&set)? {
                    debug!(?set, "found adjustment set");
                    return Ok(set);
                }
            }
        }
        Err(Error::Graph(format!(
            "no backdoor adjustment set exists for {} -> {}",
            self.treatment, self.outcome
        )))
    }
}

// Every node a breadth first walk reaches from any of `starts`, the starts
// included. Pass `Reversed(graph)` to walk against the edges.
fn reachable<G, I>(graph: G, starts: I) -> BTreeSet<G::NodeId>
where
    G: IntoNeighbors + Visitable,
    G::NodeId: Ord,
    I: IntoIterator<Item = G::NodeId>,
{
    let mut seen = BTreeSet::new();
    for start in starts {
        if seen.contains(&start) {
            continue;
        }
        let mut bfs = Bfs::new(graph, start);
        while let Some(n) = bfs.next(graph) {
            seen.insert(n);
        }
    }
    seen
}

// Lauritzen's criterion: restrict to ancestors of all three sets, marry
// co-parents, drop directions, remove the conditioning set, test
// connectivity.
fn d_separated(
    graph: &DiGraph<String, ()>,
    xs: &BTreeSet<NodeIndex>,
    ys: &BTreeSet<NodeIndex>,
    given: &BTreeSet<NodeIndex>,
) -> bool {
    if xs.iter().any(|x| ys.contains(x)) {
        return false;
    }
    let ancestral = reachable(Reversed(graph), xs.iter().chain(ys).chain(given).copied());

    let mut moral: UnGraphMap<NodeIndex, ()> = UnGraphMap::new();
    for &child in &ancestral {
        moral.add_node(child);
        let parents: Vec<NodeIndex> = graph.neighbors_directed(child, Incoming).collect();
        for (i, &p) in parents.iter().enumerate() {
            moral.add_edge(p, child, ());
            for &q in &parents[i + 1..] {
                moral.add_edge(p, q, ());
            }
        }
    }
    for g in given {
        moral.remove_node(*g);
    }

    let starts = xs.iter().filter(|x| moral.contains_node(**x)).copied();
    reachable(&moral, starts).is_disjoint(ys)
}

fn combinations(items: &[String], k: usize) -> Vec<Vec<String>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if items.len() < k {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (i, head) in items.iter().enumerate() {
        for mut tail in combinations(&items[i + 1..], k - 1) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mosquito_graph_adjustment_set() {
        let g = CausalGraph::mosquito_nets().unwrap();
        assert_eq!(g.node_names().len(), 8);
        assert_eq!(
            g.adjustment_set().unwrap(),
            set(&["health", "income", "temperature"])
        );
    }

    #[test]
    fn partial_sets_leave_backdoor_open() {
        let g = CausalGraph::mosquito_nets().unwrap();
        assert!(!g.satisfies_backdoor(&set(&["income", "temperature"])).unwrap());
        assert!(!g.satisfies_backdoor(&set(&[])).unwrap());
        // parents of the treatment always close the backdoor
        let parents = g.parents("net").unwrap();
        assert!(g.satisfies_backdoor(&parents).unwrap());
    }

    #[test]
    fn mediator_is_never_adjusted_for() {
        let g = CausalGraph::from_edges(
            "x",
            "y",
            &[("x", "m"), ("m", "y"), ("c", "x"), ("c", "y")],
        )
        .unwrap();
        assert!(!g.satisfies_backdoor(&set(&["c", "m"])).unwrap());
        assert_eq!(g.adjustment_set().unwrap(), set(&["c"]));
    }

    #[test]
    fn collider_opens_path_when_conditioned() {
        let g = CausalGraph::from_edges("a", "b", &[("a", "c"), ("b", "c")]).unwrap();
        assert!(g.is_d_separated(&["a"], &["b"], &[]).unwrap());
        assert!(!g.is_d_separated(&["a"], &["b"], &["c"]).unwrap());
    }

    #[test]
    fn chain_is_blocked_by_middle() {
        let g = CausalGraph::from_edges("a", "c", &[("a", "b"), ("b", "c")]).unwrap();
        assert!(!g.is_d_separated(&["a"], &["c"], &[]).unwrap());
        assert!(g.is_d_separated(&["a"], &["c"], &["b"]).unwrap());
    }

    #[test]
    fn rejects_cycles() {
        let mut g = CausalGraph::new("a", "c");
        g.add_edge("a", "b").unwrap();
        g.add_edge("b", "c").unwrap();
        assert!(matches!(g.add_edge("c", "a"), Err(Error::Graph(_))));
        assert!(g.add_edge("a", "a").is_err());
    }

    #[test]
    fn reversed_walk_collects_ancestors() {
        let g = CausalGraph::mosquito_nets().unwrap();
        let net = g.index("net").unwrap();
        let names: BTreeSet<String> = reachable(Reversed(&g.graph), [net])
            .into_iter()
            .map(|n| g.graph[n].clone())
            .collect();
        assert_eq!(
            names,
            set(&["eligible", "health", "household_size", "income", "net", "temperature"])
        );
    }

    #[test]
    fn descendants_follow_edges() {
        let g = CausalGraph::mosquito_nets().unwrap();
        assert_eq!(g.descendants("net").unwrap(), set(&["malaria_risk"]));
        assert_eq!(
            g.descendants("household_size").unwrap(),
            set(&["eligible", "malaria_risk", "net"])
        );
    }
}
