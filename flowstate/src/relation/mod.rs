// Bidirectional reference tracking between documents.

use std::collections::HashMap;
use std::fmt;

/// Composite document key. Using a struct rather than a concatenated string
/// keeps ids containing separators unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        DocKey {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Two inverse adjacency maps: what a document references, and what
/// references it. The maps are kept mutual inverses at all times; an
/// adjacency list that empties is removed entirely.
#[derive(Debug, Default)]
pub struct RelationGraph {
    relations: HashMap<DocKey, Vec<DocKey>>,
    in_use: HashMap<DocKey, Vec<DocKey>>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner -> target`. Idempotent.
    pub fn add(&mut self, owner: DocKey, target: DocKey) {
        let targets = self.relations.entry(owner.clone()).or_default();
        if !targets.contains(&target) {
            targets.push(target.clone());
        }
        let owners = self.in_use.entry(target).or_default();
        if !owners.contains(&owner) {
            owners.push(owner);
        }
    }

    /// Remove the `owner -> target` pairing from both maps.
    pub fn remove(&mut self, owner: &DocKey, target: &DocKey) {
        if let Some(targets) = self.relations.get_mut(owner) {
            targets.retain(|t| t != target);
            if targets.is_empty() {
                self.relations.remove(owner);
            }
        }
        if let Some(owners) = self.in_use.get_mut(target) {
            owners.retain(|o| o != owner);
            if owners.is_empty() {
                self.in_use.remove(target);
            }
        }
    }

    /// Drop every outgoing edge of `owner`, returning the targets it
    /// referenced (in insertion order).
    pub fn remove_owner(&mut self, owner: &DocKey) -> Vec<DocKey> {
        let targets = self.relations.remove(owner).unwrap_or_default();
        for target in &targets {
            if let Some(owners) = self.in_use.get_mut(target) {
                owners.retain(|o| o != owner);
                if owners.is_empty() {
                    self.in_use.remove(target);
                }
            }
        }
        targets
    }

    /// Documents referenced by `owner`, in insertion order.
    pub fn targets(&self, owner: &DocKey) -> &[DocKey] {
        self.relations.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Documents referencing `target`.
    pub fn referenced_by(&self, target: &DocKey) -> &[DocKey] {
        self.in_use.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_in_use(&self, target: &DocKey) -> bool {
        !self.referenced_by(target).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(collection: &str, id: &str) -> DocKey {
        DocKey::new(collection, id)
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut graph = RelationGraph::new();
        graph.add(key("users", "u1"), key("tags", "t1"));
        graph.add(key("users", "u1"), key("tags", "t1"));

        assert_eq!(graph.targets(&key("users", "u1")).len(), 1);
        assert_eq!(graph.referenced_by(&key("tags", "t1")).len(), 1);
    }

    #[test]
    fn test_mutual_inverse_invariant() {
        let mut graph = RelationGraph::new();
        graph.add(key("users", "u1"), key("tags", "t1"));
        graph.add(key("users", "u1"), key("tags", "t2"));
        graph.add(key("users", "u2"), key("tags", "t1"));

        for owner in ["u1", "u2"] {
            for target in graph.targets(&key("users", owner)).to_vec() {
                assert!(graph
                    .referenced_by(&target)
                    .contains(&key("users", owner)));
            }
        }

        graph.remove(&key("users", "u1"), &key("tags", "t1"));
        assert!(!graph
            .referenced_by(&key("tags", "t1"))
            .contains(&key("users", "u1")));
        assert!(graph.is_in_use(&key("tags", "t1"))); // u2 still points at it
    }

    #[test]
    fn test_empty_adjacency_entries_removed() {
        let mut graph = RelationGraph::new();
        graph.add(key("users", "u1"), key("tags", "t1"));
        graph.remove(&key("users", "u1"), &key("tags", "t1"));

        assert!(graph.relations.is_empty());
        assert!(graph.in_use.is_empty());
    }

    #[test]
    fn test_remove_owner_returns_targets_in_order() {
        let mut graph = RelationGraph::new();
        graph.add(key("users", "u1"), key("tags", "t2"));
        graph.add(key("users", "u1"), key("tags", "t1"));

        let targets = graph.remove_owner(&key("users", "u1"));
        assert_eq!(targets, vec![key("tags", "t2"), key("tags", "t1")]);
        assert!(!graph.is_in_use(&key("tags", "t1")));
        assert!(!graph.is_in_use(&key("tags", "t2")));
    }
}
