// Declarative transition graphs: allowed edges plus permission annotations

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

use super::types::State;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("transition graph has no states")]
    Empty,

    #[error("state '{to}' is reachable from '{from}' but is not declared in the graph")]
    DanglingState { from: State, to: State },

    #[error("permissions declared for '{from}' -> '{to}', which is not an edge")]
    UnknownPermissionEdge { from: State, to: State },
}

/// Immutable table of legal `(from, to)` pairs for one entity kind.
///
/// Every state reachable through an edge is also a key of the table, so a
/// state with an empty outgoing set is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGraph {
    edges: BTreeMap<State, BTreeSet<State>>,
    permissions: BTreeMap<(State, State), BTreeSet<String>>,
}

static NO_STATES: BTreeSet<State> = BTreeSet::new();
static NO_PERMISSIONS: BTreeSet<String> = BTreeSet::new();

impl TransitionGraph {
    pub fn builder() -> TransitionGraphBuilder {
        TransitionGraphBuilder::default()
    }

    /// States directly reachable from `from`
    pub fn allowed_from(&self, from: &State) -> &BTreeSet<State> {
        self.edges.get(from).unwrap_or(&NO_STATES)
    }

    pub fn is_edge(&self, from: &State, to: &State) -> bool {
        self.allowed_from(from).contains(to)
    }

    pub fn required_permissions(&self, from: &State, to: &State) -> &BTreeSet<String> {
        self.permissions
            .get(&(from.clone(), to.clone()))
            .unwrap_or(&NO_PERMISSIONS)
    }

    pub fn contains(&self, state: &State) -> bool {
        self.edges.contains_key(state)
    }

    pub fn is_terminal(&self, state: &State) -> bool {
        self.allowed_from(state).is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.edges.keys()
    }

    pub fn terminal_states(&self) -> impl Iterator<Item = &State> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.is_empty())
            .map(|(state, _)| state)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&State, &State)> {
        self.edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from, to)))
    }
}

#[derive(Debug, Default)]
pub struct TransitionGraphBuilder {
    edges: BTreeMap<State, BTreeSet<State>>,
    permissions: BTreeMap<(State, State), BTreeSet<String>>,
}

impl TransitionGraphBuilder {
    /// Declare a state, e.g. a terminal one
    pub fn state(mut self, state: impl Into<State>) -> Self {
        self.edges.entry(state.into()).or_default();
        self
    }

    pub fn edge(mut self, from: impl Into<State>, to: impl Into<State>) -> Self {
        self.edges.entry(from.into()).or_default().insert(to.into());
        self
    }

    /// Declare every edge leaving `from` at once
    pub fn transitions<I, S>(mut self, from: impl Into<State>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<State>,
    {
        let entry = self.edges.entry(from.into()).or_default();
        entry.extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn edge_requiring<I, P>(self, from: impl Into<State>, to: impl Into<State>, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let from = from.into();
        let to = to.into();
        self.edge(from.clone(), to.clone())
            .require(from, to, permissions)
    }

    /// Annotate an edge with required permissions
    pub fn require<I, P>(mut self, from: impl Into<State>, to: impl Into<State>, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.permissions
            .entry((from.into(), to.into()))
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Build the graph. Targets that were never declared become terminal states.
    pub fn build(mut self) -> Result<TransitionGraph, GraphError> {
        let undeclared: Vec<State> = self
            .edges
            .values()
            .flatten()
            .filter(|to| !self.edges.contains_key(*to))
            .cloned()
            .collect();
        for state in undeclared {
            debug!(state = %state, "declaring undeclared target as terminal state");
            self.edges.entry(state).or_default();
        }
        self.finish()
    }

    /// Build the graph, rejecting targets that were never declared
    pub fn build_strict(self) -> Result<TransitionGraph, GraphError> {
        for (from, targets) in &self.edges {
            if let Some(to) = targets.iter().find(|to| !self.edges.contains_key(*to)) {
                return Err(GraphError::DanglingState {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        self.finish()
    }

    fn finish(self) -> Result<TransitionGraph, GraphError> {
        if self.edges.is_empty() {
            return Err(GraphError::Empty);
        }

        for (from, to) in self.permissions.keys() {
            let is_edge = self
                .edges
                .get(from)
                .map(|targets| targets.contains(to))
                .unwrap_or(false);
            if !is_edge {
                return Err(GraphError::UnknownPermissionEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }

        Ok(TransitionGraph {
            edges: self.edges,
            permissions: self.permissions,
        })
    }
}
