//! Category hierarchy snapshot and cycle guard
//!
//! The snapshot is built from one `(id, parent_id)` query and then walked in
//! memory, so guarding a reparent costs a single round trip regardless of how
//! deep the tree is. Children keep the order the edges were supplied in.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

/// In-memory adjacency of the category parent graph
#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    order: Vec<String>,
    parents: HashMap<String, Option<String>>,
    children: HashMap<String, Vec<String>>,
}

impl CategoryTree {
    /// Build from `(id, parent_id)` pairs
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        let mut tree = CategoryTree::default();
        for (id, parent_id) in edges {
            if let Some(ref parent) = parent_id {
                tree.children.entry(parent.clone()).or_default().push(id.clone());
            }
            if tree.parents.insert(id.clone(), parent_id).is_none() {
                tree.order.push(id);
            }
        }
        tree
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parents.get(id).and_then(|p| p.as_deref())
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All descendants of `id`, excluding `id` itself
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<&str> = self.children_of(id).iter().map(String::as_str).collect();

        while let Some(current) = stack.pop() {
            if !visited.insert(current.to_string()) {
                continue;
            }
            stack.extend(self.children_of(current).iter().map(String::as_str));
        }

        visited.remove(id);
        visited
    }

    /// True if making `proposed_parent_id` the parent of `category_id` would
    /// close a loop: either the two ids match or the proposed parent already
    /// sits below `category_id`.
    pub fn would_create_cycle(&self, category_id: &str, proposed_parent_id: &str) -> bool {
        if category_id == proposed_parent_id {
            return true;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![category_id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for child in self.children_of(current) {
                if child == proposed_parent_id {
                    return true;
                }
                stack.push(child);
            }
        }

        false
    }

    /// Ancestor chain from the immediate parent up to the root
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = self.parent_of(id);

        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent.to_string());
            current = self.parent_of(parent);
        }

        chain
    }

    /// Nested view of the forest, roots first. `label` supplies node data.
    pub fn to_nodes<F, T>(&self, mut label: F) -> Vec<TreeNode<T>>
    where
        F: FnMut(&str) -> T,
    {
        let roots: Vec<&String> = self
            .order
            .iter()
            .filter(|id| match self.parent_of(id) {
                None => true,
                // Dangling parent reference: surface as a root
                Some(p) => !self.parents.contains_key(p),
            })
            .collect();

        roots
            .into_iter()
            .map(|root| self.build_node(root, &mut label))
            .collect()
    }

    fn build_node<F, T>(&self, root: &str, label: &mut F) -> TreeNode<T>
    where
        F: FnMut(&str) -> T,
    {
        // Iterative post-order so deep trees never recurse on the call stack
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, bool)> = vec![(root, false)];
        let mut built: HashMap<&str, TreeNode<T>> = HashMap::new();

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                let children = self
                    .children_of(id)
                    .iter()
                    .filter_map(|c| built.remove(c.as_str()))
                    .collect();
                built.insert(id, TreeNode { id: id.to_string(), data: label(id), children });
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for child in self.children_of(id).iter().rev() {
                stack.push((child.as_str(), false));
            }
        }

        built.remove(root).unwrap_or_else(|| TreeNode {
            id: root.to_string(),
            data: label(root),
            children: Vec::new(),
        })
    }
}

/// Node of the nested category tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode<T> {
    pub id: String,
    #[serde(flatten)]
    pub data: T,
    pub children: Vec<TreeNode<T>>,
}
