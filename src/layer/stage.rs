//! Stage dependency graph
//!
//! Stages form a DAG declared by name. The graph is validated once on
//! construction (unknown dependencies, cycles) and then provides a stable
//! topological order and the shifted order used when stages change.

use crate::error::{ImgdepsError, ImgdepsResult};
use crate::hasher::ContentHasher;
use crate::layer::declaration::StageDeclaration;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Validated stage DAG
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageGraph {
    stages: Vec<StageDeclaration>,
}

impl StageGraph {
    /// Build and validate a graph from declared stages
    pub fn new(stages: Vec<StageDeclaration>) -> ImgdepsResult<Self> {
        let mut names = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(ImgdepsError::validation("stage with empty name"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ImgdepsError::validation(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
        }

        for stage in &stages {
            for dep in &stage.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(ImgdepsError::validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
            }
        }

        let graph = Self { stages };
        if let Some(stage) = graph.find_cycle() {
            return Err(ImgdepsError::validation(format!(
                "circular stage dependencies involving '{}'",
                stage
            )));
        }
        Ok(graph)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[StageDeclaration] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageDeclaration> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// DFS with a recursion stack; returns a stage on the first cycle found
    fn find_cycle(&self) -> Option<String> {
        fn visit<'a>(
            name: &'a str,
            graph: &HashMap<&'a str, &'a [String]>,
            visited: &mut HashSet<&'a str>,
            on_stack: &mut HashSet<&'a str>,
        ) -> Option<String> {
            if on_stack.contains(name) {
                return Some(name.to_string());
            }
            if !visited.insert(name) {
                return None;
            }
            on_stack.insert(name);
            for dep in graph.get(name).copied().unwrap_or_default() {
                if let Some(found) = visit(dep, graph, visited, on_stack) {
                    return Some(found);
                }
            }
            on_stack.remove(name);
            None
        }

        let graph: HashMap<&str, &[String]> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.dependencies.as_slice()))
            .collect();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.stages
            .iter()
            .find_map(|s| visit(&s.name, &graph, &mut visited, &mut on_stack))
    }

    /// Kahn's algorithm; ties resolved by declaration order
    pub fn topological_order(&self) -> Vec<String> {
        let mut placed: Vec<String> = Vec::with_capacity(self.stages.len());
        let mut done: HashSet<&str> = HashSet::new();
        while placed.len() < self.stages.len() {
            let next = self.stages.iter().find(|s| {
                !done.contains(s.name.as_str())
                    && s.dependencies.iter().all(|d| done.contains(d.as_str()))
            });
            match next {
                Some(stage) => {
                    done.insert(stage.name.as_str());
                    placed.push(stage.name.clone());
                }
                None => break,
            }
        }
        placed
    }

    /// Execution order after moving changed stages to the end.
    ///
    /// Starts from `previous` (the order persisted by the last successful
    /// build) when available. Unchanged stages keep their relative order;
    /// changed stages and everything depending on them go last, still in
    /// dependency order.
    pub fn shifted_order(
        &self,
        previous: Option<&[String]>,
        changed: &BTreeSet<String>,
    ) -> Vec<String> {
        let base_order = match previous {
            Some(prev) => {
                let mut order: Vec<String> = prev
                    .iter()
                    .filter(|name| self.get(name).is_some())
                    .cloned()
                    .collect();
                for name in self.topological_order() {
                    if !order.contains(&name) {
                        order.push(name);
                    }
                }
                self.sort_by_dependencies(&order, &[])
            }
            None => self.topological_order(),
        };

        let mut reordered: Vec<String> = Vec::with_capacity(base_order.len());
        for name in &base_order {
            if changed.contains(name) {
                continue;
            }
            if self.can_place(name, &reordered) {
                reordered.push(name.clone());
            }
        }

        let remaining: Vec<String> = base_order
            .iter()
            .filter(|n| !reordered.contains(n))
            .cloned()
            .collect();
        let tail = self.sort_by_dependencies(&remaining, &reordered);
        reordered.extend(tail);
        reordered
    }

    fn can_place(&self, name: &str, placed: &[String]) -> bool {
        self.get(name)
            .map(|s| s.dependencies.iter().all(|d| placed.contains(d)))
            .unwrap_or(false)
    }

    /// Stable dependency sort of `items`, given stages already placed
    fn sort_by_dependencies(&self, items: &[String], already: &[String]) -> Vec<String> {
        let mut placed: Vec<String> = already.to_vec();
        let mut result = Vec::with_capacity(items.len());
        let mut remaining: Vec<String> = items.to_vec();

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut i = 0;
            while i < remaining.len() {
                if self.can_place(&remaining[i], &placed) {
                    let name = remaining.remove(i);
                    placed.push(name.clone());
                    result.push(name);
                } else {
                    i += 1;
                }
            }
            if remaining.len() == before {
                // Unreachable for a validated graph
                result.append(&mut remaining);
            }
        }
        result
    }

    /// Hash of every stage's name, sorted dependencies and commands
    pub fn stage_hashes(&self, hasher: &ContentHasher) -> BTreeMap<String, String> {
        self.stages
            .iter()
            .map(|stage| {
                let mut deps = stage.dependencies.clone();
                deps.sort();
                let value = json!({
                    "name": stage.name,
                    "dependencies": deps,
                    "commands": stage.commands,
                });
                (stage.name.clone(), hasher.digest_value(&value))
            })
            .collect()
    }
}
