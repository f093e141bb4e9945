use pt_core::{DenseTensor, TensorHandle};
use pt_serialize::{SerializeError, Serializer};

use crate::node::{NodeData, child_path, ensure_detached};
use crate::{CopyMode, Node, TreeError};

/// Node whose children are addressed by string keys, kept in insertion order.
///
/// Every child is named `self.path + "/" + key`. Removing a child resets its
/// path to empty so it can be attached elsewhere.
#[derive(Debug)]
pub struct DictNode<T: TensorHandle = DenseTensor> {
    data: NodeData<T>,
    children: Vec<(String, Node<T>)>,
}

impl<T: TensorHandle> Default for DictNode<T> {
    fn default() -> Self {
        Self {
            data: NodeData::default(),
            children: Vec::new(),
        }
    }
}

impl<T: TensorHandle> DictNode<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dict from `(key, child)` pairs. Nothing is attached unless
    /// every child is unattached.
    pub fn from_children<K, I>(children: I) -> Result<Self, TreeError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Node<T>)>,
    {
        let children: Vec<(String, Node<T>)> = children
            .into_iter()
            .map(|(key, child)| (key.into(), child))
            .collect();
        for (key, child) in &children {
            ensure_key(key)?;
            ensure_detached(child)?;
        }
        let mut dict = Self::new();
        for (key, child) in children {
            dict.install(key, child);
        }
        Ok(dict)
    }

    #[must_use]
    pub fn data(&self) -> &NodeData<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut NodeData<T> {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Node<T>> {
        self.position(key).map(|idx| &self.children[idx].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node<T>> {
        self.position(key).map(|idx| &mut self.children[idx].1)
    }

    /// Attaches `child` under `key`. A child already at `key` is detached
    /// and returned; it keeps its position in iteration order. An empty key
    /// is rejected since the child's path would collide with this node's.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        child: Node<T>,
    ) -> Result<Option<Node<T>>, TreeError> {
        let key = key.into();
        ensure_key(&key)?;
        ensure_detached(&child)?;
        Ok(self.install(key, child))
    }

    /// Detaches and returns the child at `key`.
    pub fn remove(&mut self, key: &str) -> Result<Node<T>, TreeError> {
        self.pop(key).ok_or_else(|| TreeError::KeyNotFound {
            key: key.to_string(),
        })
    }

    pub fn pop(&mut self, key: &str) -> Option<Node<T>> {
        let idx = self.position(key)?;
        let (_, mut child) = self.children.remove(idx);
        child.detach();
        Some(child)
    }

    /// Detaches and returns the most recently inserted entry.
    pub fn pop_item(&mut self) -> Option<(String, Node<T>)> {
        let (key, mut child) = self.children.pop()?;
        child.detach();
        Some((key, child))
    }

    /// Returns the child at `key`, attaching `default` there first when the
    /// key is absent. `default` is only validated when it gets attached.
    pub fn set_default(
        &mut self,
        key: impl Into<String>,
        default: Node<T>,
    ) -> Result<&mut Node<T>, TreeError> {
        let key = key.into();
        let idx = match self.position(&key) {
            Some(idx) => idx,
            None => {
                ensure_key(&key)?;
                ensure_detached(&default)?;
                self.install(key, default);
                self.children.len() - 1
            }
        };
        Ok(&mut self.children[idx].1)
    }

    /// Detaches every child.
    pub fn clear(&mut self) {
        for (_, mut child) in self.children.drain(..) {
            child.detach();
        }
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.children.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &Node<T>> + '_ {
        self.children.iter().map(|(_, child)| child)
    }

    pub fn values_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Node<T>> + '_ {
        self.children.iter_mut().map(|(_, child)| child)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &Node<T>)> + '_ {
        self.children
            .iter()
            .map(|(key, child)| (key.as_str(), child))
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.data.set_path(name);
        for (key, child) in &mut self.children {
            child.set_name(&child_path(name, key));
        }
        log::debug!("rename {} children under {}", self.children.len(), name);
    }

    pub(crate) fn copy(&self, mode: CopyMode) -> Self {
        Self {
            data: self.data.duplicate(mode),
            children: self
                .children
                .iter()
                .map(|(key, child)| (key.clone(), child.copy(mode)))
                .collect(),
        }
    }

    pub(crate) fn split_mut(&mut self) -> (&mut NodeData<T>, Vec<&mut Node<T>>) {
        let children = self.children.iter_mut().map(|(_, child)| child).collect();
        (&mut self.data, children)
    }

    pub(crate) fn serialize(
        &mut self,
        serializer: &mut dyn Serializer<T>,
    ) -> Result<(), SerializeError> {
        self.data.serialize(serializer)?;
        for (key, child) in &mut self.children {
            child.serialize(serializer.scoped(key).as_mut())?;
        }
        Ok(())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.children.iter().position(|(existing, _)| existing == key)
    }

    fn install(&mut self, key: String, mut child: Node<T>) -> Option<Node<T>> {
        child.set_name(&child_path(self.data.path(), &key));
        log::debug!("attach {} under {}", child.name(), self.data.path());
        match self.position(&key) {
            Some(idx) => {
                let mut old = std::mem::replace(&mut self.children[idx].1, child);
                old.detach();
                Some(old)
            }
            None => {
                self.children.push((key, child));
                None
            }
        }
    }
}

fn ensure_key(key: &str) -> Result<(), TreeError> {
    if key.is_empty() {
        return Err(TreeError::EmptyKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pt_core::{DType, DenseTensor};

    use crate::{DictNode, Leaf, Node, TreeError};

    fn leaf() -> Node {
        let data = DenseTensor::from_values(vec![1.0], vec![1], DType::F64).expect("tensor");
        Leaf::new().with_param("w", data).into()
    }

    #[test]
    fn children_are_named_under_the_dict() {
        let dict = DictNode::from_children([("a", leaf()), ("b", leaf())]).expect("dict");
        let names: Vec<&str> = dict.values().map(Node::name).collect();
        assert_eq!(names, vec!["/a", "/b"]);
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(dict.contains_key("a"));
        assert!(!dict.contains_key("c"));
    }

    #[test]
    fn construction_rejects_attached_child() {
        let mut donor = DictNode::new();
        donor.insert("x", leaf()).expect("insert");
        let attached = donor.pop("x").map(|mut node| {
            node.set_name("/elsewhere");
            node
        });
        let fresh = leaf();
        let err = DictNode::from_children([("a", fresh), ("b", attached.expect("node"))])
            .expect_err("attached child must be rejected");
        assert_eq!(
            err,
            TreeError::AlreadyParented {
                name: "/elsewhere".to_string()
            }
        );
    }

    #[test]
    fn replacing_a_key_detaches_the_previous_child() {
        let mut dict = DictNode::new();
        dict.insert("a", leaf()).expect("first");
        dict.insert("b", leaf()).expect("second");
        let old = dict
            .insert("a", leaf())
            .expect("replace")
            .expect("previous child");
        assert_eq!(old.path(), "");
        assert_eq!(dict.get("a").map(Node::name), Some("/a"));
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn remove_missing_key_is_key_not_found() {
        let mut dict = DictNode::<DenseTensor>::new();
        assert_eq!(
            dict.remove("ghost").expect_err("absent"),
            TreeError::KeyNotFound {
                key: "ghost".to_string()
            }
        );
        assert!(dict.pop("ghost").is_none());
    }

    #[test]
    fn pop_item_takes_last_inserted() {
        let mut dict = DictNode::from_children([("a", leaf()), ("b", leaf())]).expect("dict");
        let (key, child) = dict.pop_item().expect("non-empty");
        assert_eq!(key, "b");
        assert_eq!(child.path(), "");
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn set_default_only_attaches_when_absent() {
        let mut dict = DictNode::from_children([("a", leaf())]).expect("dict");
        let existing = dict.set_default("a", Node::leaf()).expect("existing");
        assert_eq!(existing.data().params().len(), 1);

        let inserted = dict.set_default("b", Node::leaf()).expect("inserted");
        assert_eq!(inserted.name(), "/b");
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn empty_key_is_rejected_everywhere() {
        let mut dict = DictNode::new();
        assert_eq!(dict.insert("", leaf()).expect_err("insert"), TreeError::EmptyKey);
        assert_eq!(
            dict.set_default("", leaf()).expect_err("set_default"),
            TreeError::EmptyKey
        );
        assert!(dict.is_empty());
        assert!(matches!(
            DictNode::from_children([("", leaf())]),
            Err(TreeError::EmptyKey)
        ));
    }

    #[test]
    fn clear_detaches_everything() {
        let mut dict = DictNode::from_children([("a", leaf()), ("b", leaf())]).expect("dict");
        dict.clear();
        assert!(dict.is_empty());
    }

    #[test]
    fn rename_cascades_through_nested_dicts() {
        let inner = DictNode::from_children([("leaf", leaf())]).expect("inner");
        let mut outer: Node = DictNode::from_children([("inner", Node::from(inner))])
            .expect("outer")
            .into();
        outer.set_name("/root");
        let names: Vec<&str> = outer.visit_nodes().map(Node::name).collect();
        assert_eq!(names, vec!["/root", "/root/inner", "/root/inner/leaf"]);
    }
}
