use pt_core::{DenseTensor, TensorHandle};
use pt_serialize::{SerializeError, Serializer};

use crate::node::{NodeData, child_path, ensure_detached};
use crate::{CopyMode, Node, TreeError};

/// Node whose children are addressed by position.
///
/// Child `i` is named `self.path + "/" + i`; inserting or removing in the
/// middle renumbers every child after it.
#[derive(Debug)]
pub struct ListNode<T: TensorHandle = DenseTensor> {
    data: NodeData<T>,
    children: Vec<Node<T>>,
}

impl<T: TensorHandle> Default for ListNode<T> {
    fn default() -> Self {
        Self {
            data: NodeData::default(),
            children: Vec::new(),
        }
    }
}

impl<T: TensorHandle> ListNode<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_children(children: impl IntoIterator<Item = Node<T>>) -> Result<Self, TreeError> {
        let children: Vec<Node<T>> = children.into_iter().collect();
        for child in &children {
            ensure_detached(child)?;
        }
        let mut list = Self {
            data: NodeData::default(),
            children,
        };
        list.renumber_from(0);
        for child in &list.children {
            log::debug!("attach {} under {}", child.name(), list.data.path());
        }
        Ok(list)
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
    pub fn get(&self, idx: usize) -> Option<&Node<T>> {
        self.children.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Node<T>> {
        self.children.get_mut(idx)
    }

    pub fn push(&mut self, child: Node<T>) -> Result<(), TreeError> {
        ensure_detached(&child)?;
        self.children.push(child);
        let idx = self.children.len() - 1;
        self.renumber_from(idx);
        self.log_attach(idx);
        Ok(())
    }

    /// Detaches and returns the last child.
    pub fn pop(&mut self) -> Result<Node<T>, TreeError> {
        let mut child = self.children.pop().ok_or(TreeError::EmptySequence)?;
        child.detach();
        Ok(child)
    }

    /// Replaces the child at `idx`, returning the detached previous one.
    pub fn set(&mut self, idx: usize, child: Node<T>) -> Result<Node<T>, TreeError> {
        let len = self.children.len();
        if idx >= len {
            return Err(TreeError::IndexOutOfRange { index: idx, len });
        }
        ensure_detached(&child)?;
        let mut old = std::mem::replace(&mut self.children[idx], child);
        old.detach();
        self.renumber_from(idx);
        self.log_attach(idx);
        Ok(old)
    }

    /// Inserts `child` at `idx`, shifting later children up by one.
    /// `idx == len` appends.
    pub fn insert(&mut self, idx: usize, child: Node<T>) -> Result<(), TreeError> {
        let len = self.children.len();
        if idx > len {
            return Err(TreeError::IndexOutOfRange { index: idx, len });
        }
        ensure_detached(&child)?;
        self.children.insert(idx, child);
        self.renumber_from(idx);
        self.log_attach(idx);
        Ok(())
    }

    pub fn remove(&mut self, idx: usize) -> Result<Node<T>, TreeError> {
        let len = self.children.len();
        if idx >= len {
            return Err(TreeError::IndexOutOfRange { index: idx, len });
        }
        let mut child = self.children.remove(idx);
        child.detach();
        self.renumber_from(idx);
        Ok(child)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node<T>> {
        self.children.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Node<T>> {
        self.children.iter_mut()
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.data.set_path(name);
        self.renumber_from(0);
        log::debug!("rename {} children under {}", self.children.len(), name);
    }

    pub(crate) fn copy(&self, mode: CopyMode) -> Self {
        Self {
            data: self.data.duplicate(mode),
            children: self.children.iter().map(|child| child.copy(mode)).collect(),
        }
    }

    pub(crate) fn split_mut(&mut self) -> (&mut NodeData<T>, Vec<&mut Node<T>>) {
        (&mut self.data, self.children.iter_mut().collect())
    }

    pub(crate) fn serialize(
        &mut self,
        serializer: &mut dyn Serializer<T>,
    ) -> Result<(), SerializeError> {
        self.data.serialize(serializer)?;
        for (idx, child) in self.children.iter_mut().enumerate() {
            child.serialize(serializer.scoped(&idx.to_string()).as_mut())?;
        }
        Ok(())
    }

    fn renumber_from(&mut self, start: usize) {
        let parent = self.data.path();
        for (idx, child) in self.children.iter_mut().enumerate().skip(start) {
            child.set_name(&child_path(parent, &idx.to_string()));
        }
    }

    fn log_attach(&self, idx: usize) {
        if let Some(child) = self.children.get(idx) {
            log::debug!("attach {} under {}", child.name(), self.data.path());
        }
    }
}

impl<'a, T: TensorHandle> IntoIterator for &'a ListNode<T> {
    type Item = &'a Node<T>;
    type IntoIter = std::slice::Iter<'a, Node<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use proptest::prelude::*;
    use pt_core::{DType, DenseTensor};

    use crate::{ListNode, Node, TreeError};

    thread_local! {
        static LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    struct Capture;

    impl log::Log for Capture {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            LINES.with(|lines| lines.borrow_mut().push(record.args().to_string()));
        }

        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture;

    fn tree_lines(action: impl FnOnce()) -> Vec<String> {
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Trace);
        LINES.with(|lines| lines.borrow_mut().clear());
        action();
        LINES.with(|lines| {
            lines
                .borrow_mut()
                .drain(..)
                .filter(|line| line.starts_with("attach") || line.starts_with("rename"))
                .collect()
        })
    }

    fn leaf() -> Node {
        let data = DenseTensor::from_values(vec![1.0], vec![1], DType::F64).expect("tensor");
        crate::Leaf::new().with_param("w", data).into()
    }

    fn names(list: &ListNode) -> Vec<String> {
        list.iter().map(|child| child.name().to_string()).collect()
    }

    #[test]
    fn push_names_by_index() {
        let mut list = ListNode::new();
        list.push(leaf()).expect("push");
        list.push(leaf()).expect("push");
        assert_eq!(names(&list), vec!["/0", "/1"]);
    }

    #[test]
    fn pop_on_empty_list_fails() {
        let mut list = ListNode::<DenseTensor>::new();
        assert_eq!(list.pop().expect_err("empty"), TreeError::EmptySequence);
    }

    #[test]
    fn set_detaches_replaced_child() {
        let mut list = ListNode::from_children([leaf(), leaf()]).expect("list");
        let old = list.set(1, Node::leaf()).expect("set");
        assert_eq!(old.path(), "");
        assert_eq!(list.get(1).map(Node::name), Some("/1"));
        assert!(list.get(1).is_some_and(|node| node.data().params().is_empty()));
        assert_eq!(
            list.set(5, Node::leaf()).expect_err("out of range"),
            TreeError::IndexOutOfRange { index: 5, len: 2 }
        );
    }

    #[test]
    fn attached_child_is_rejected() {
        let mut list = ListNode::new();
        let mut child = leaf();
        child.set_name("/other/3");
        let err = list.push(child).expect_err("attached");
        assert_eq!(
            err,
            TreeError::AlreadyParented {
                name: "/other/3".to_string()
            }
        );
        assert!(list.is_empty());
    }

    #[test]
    fn insert_and_remove_renumber_followers() {
        let mut list = ListNode::from_children([leaf(), leaf()]).expect("list");
        list.insert(0, Node::leaf()).expect("insert");
        assert_eq!(names(&list), vec!["/0", "/1", "/2"]);
        assert!(list.get(0).is_some_and(|node| node.data().params().is_empty()));

        let removed = list.remove(0).expect("remove");
        assert_eq!(removed.path(), "");
        assert_eq!(names(&list), vec!["/0", "/1"]);
        assert!(list.get(0).is_some_and(|node| node.data().params().len() == 1));
        assert!(matches!(
            list.remove(2),
            Err(TreeError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn renumbering_logs_only_the_new_child_as_attached() {
        let list = ListNode::from_children([leaf(), leaf()]).expect("list");
        let mut node: Node = list.into();
        node.set_name("/blocks");
        let list = node.as_list_mut().expect("list variant");

        let lines = tree_lines(|| list.insert(0, leaf()).expect("insert"));
        assert_eq!(lines, vec!["attach /blocks/0 under /blocks"]);

        let lines = tree_lines(|| {
            list.remove(0).expect("remove");
        });
        assert!(lines.is_empty(), "{lines:?}");

        let nested = ListNode::from_children([leaf()]).expect("nested");
        let lines = tree_lines(|| list.push(nested.into()).expect("push"));
        assert_eq!(
            lines,
            vec![
                "rename 1 children under /blocks/2",
                "attach /blocks/2 under /blocks",
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_rename_keeps_index_names(len in 0usize..10, label in "[a-z]{1,6}") {
            let list = ListNode::from_children((0..len).map(|_| leaf())).expect("list");
            let mut node: Node = list.into();
            let root = format!("/{label}");
            node.set_name(&root);
            let list = node.as_list().expect("list variant");
            for (idx, child) in list.iter().enumerate() {
                prop_assert_eq!(child.name(), format!("{root}/{idx}"));
            }
        }
    }
}
