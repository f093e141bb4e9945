use std::collections::btree_map;

use pt_core::TensorHandle;
use pt_serialize::join_path;

use crate::node::PARAMS_SCOPE;
use crate::{Node, Parameter};

/// Persisted path of parameter `key` on the node at `node_path`.
pub(crate) fn param_path(node_path: &str, key: &str) -> String {
    join_path(&join_path(node_path, PARAMS_SCOPE), key)
}

/// Pre-order iterator over a subtree, returned by [`Node::visit_nodes`].
///
/// Holds shared borrows of the tree, so the structure cannot change while
/// it is alive.
#[derive(Debug)]
pub struct Nodes<'a, T: TensorHandle> {
    stack: Vec<&'a Node<T>>,
}

impl<'a, T: TensorHandle> Nodes<'a, T> {
    pub(crate) fn new(root: &'a Node<T>) -> Self {
        Self { stack: vec![root] }
    }
}

impl<'a, T: TensorHandle> Iterator for Nodes<'a, T> {
    type Item = &'a Node<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        match node {
            Node::Leaf(_) => {}
            Node::Dict(dict) => self.stack.extend(dict.values().rev()),
            Node::List(list) => self.stack.extend(list.iter().rev()),
        }
        Some(node)
    }
}

/// `(path, parameter)` pairs of a subtree, returned by [`Node::visit_params`].
#[derive(Debug)]
pub struct Params<'a, T: TensorHandle> {
    nodes: Nodes<'a, T>,
    current: Option<(&'a str, btree_map::Iter<'a, String, Parameter<T>>)>,
}

impl<'a, T: TensorHandle> Params<'a, T> {
    pub(crate) fn new(root: &'a Node<T>) -> Self {
        Self {
            nodes: Nodes::new(root),
            current: None,
        }
    }
}

impl<'a, T: TensorHandle> Iterator for Params<'a, T> {
    type Item = (String, &'a Parameter<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((node_path, params)) = self.current.as_mut() {
                if let Some((key, param)) = params.next() {
                    return Some((param_path(node_path, key), param));
                }
            }
            let node = self.nodes.next()?;
            let data = node.data();
            self.current = Some((data.path(), data.params().iter()));
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use pt_core::{DType, DenseTensor};

    use super::param_path;
    use crate::{Leaf, ListNode, Node};

    fn leaf_with(keys: &[&str]) -> Node {
        keys.iter()
            .fold(Leaf::new(), |leaf, key| {
                let data =
                    DenseTensor::from_values(vec![0.0], vec![1], DType::F64).expect("tensor");
                leaf.with_param(*key, data)
            })
            .into()
    }

    #[test]
    fn param_path_joins_scope() {
        assert_eq!(param_path("", "w"), "/_params/w");
        assert_eq!(param_path("/a/0", "b"), "/a/0/_params/b");
    }

    #[test]
    fn params_within_a_node_are_key_ordered() {
        let node = leaf_with(&["w", "b", "a"]);
        let keys: Vec<String> = node.visit_params().map(|(path, _)| path).collect();
        assert_eq!(keys, vec!["/_params/a", "/_params/b", "/_params/w"]);
    }

    #[test]
    fn fresh_call_restarts_traversal() {
        let node = leaf_with(&["w"]);
        let mut first = node.visit_params();
        assert!(first.next().is_some());
        assert!(first.next().is_none());
        assert_eq!(node.visit_params().count(), 1);
    }

    proptest! {
        #[test]
        fn prop_list_visits_every_child_once(width in 0usize..12) {
            let children: Vec<Node> = (0..width).map(|_| leaf_with(&["w"])).collect();
            let list: Node = ListNode::from_children(children).expect("list").into();
            prop_assert_eq!(list.visit_nodes().count(), width + 1);
            let paths: Vec<String> = list.visit_params().map(|(path, _)| path).collect();
            let expected: Vec<String> = (0..width).map(|i| format!("/{i}/_params/w")).collect();
            prop_assert_eq!(paths, expected);
        }
    }
}
