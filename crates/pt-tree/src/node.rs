use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use pt_core::{DenseTensor, Device, TensorHandle};
use pt_device::{DeviceError, DeviceGuard, upload_to_current};
use pt_serialize::{SerializeError, Serializer, join_path};

use crate::visit::{Nodes, Params, param_path};
use crate::{CopyMode, DictNode, ListNode, Parameter, TreeError};

pub(crate) const PARAMS_SCOPE: &str = "_params";
pub(crate) const STATES_SCOPE: &str = "_states";

/// Fields every node carries: its path, parameters and states.
#[derive(Debug)]
pub struct NodeData<T: TensorHandle = DenseTensor> {
    name: String,
    params: BTreeMap<String, Parameter<T>>,
    states: BTreeMap<String, T>,
}

impl<T: TensorHandle> Default for NodeData<T> {
    fn default() -> Self {
        Self {
            name: String::new(),
            params: BTreeMap::new(),
            states: BTreeMap::new(),
        }
    }
}

impl<T: TensorHandle> NodeData<T> {
    /// Path of the node; empty while the node is a standalone root.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_path(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, Parameter<T>> {
        &self.params
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Parameter<T>> {
        self.params.get(key)
    }

    pub fn param_mut(&mut self, key: &str) -> Option<&mut Parameter<T>> {
        self.params.get_mut(key)
    }

    /// Registers `data` as a parameter under `key`, replacing any previous one.
    pub fn add_param(&mut self, key: impl Into<String>, data: T) -> &mut Parameter<T> {
        match self.params.entry(key.into()) {
            Entry::Occupied(mut entry) => {
                entry.insert(Parameter::new(data));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(Parameter::new(data)),
        }
    }

    pub fn remove_param(&mut self, key: &str) -> Option<Parameter<T>> {
        self.params.remove(key)
    }

    #[must_use]
    pub fn states(&self) -> &BTreeMap<String, T> {
        &self.states
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<&T> {
        self.states.get(key)
    }

    pub fn state_mut(&mut self, key: &str) -> Option<&mut T> {
        self.states.get_mut(key)
    }

    pub fn add_state(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        self.states.insert(key.into(), value)
    }

    pub fn remove_state(&mut self, key: &str) -> Option<T> {
        self.states.remove(key)
    }

    pub(crate) fn duplicate(&self, mode: CopyMode) -> Self {
        let params = self
            .params
            .iter()
            .map(|(key, param)| (key.clone(), param.duplicate(mode)))
            .collect();
        let states = self
            .states
            .iter()
            .map(|(key, value)| {
                let value = match mode {
                    CopyMode::Shared => value.clone(),
                    CopyMode::Deep => value.deep_copy(),
                };
                (key.clone(), value)
            })
            .collect();
        Self {
            name: self.name.clone(),
            params,
            states,
        }
    }

    fn to_host(&mut self) {
        for param in self.params.values_mut() {
            param.to_host();
        }
        for value in self.states.values_mut() {
            *value = value.to_host();
        }
    }

    fn to_current_device(&mut self) -> Result<(), DeviceError> {
        for param in self.params.values_mut() {
            param.try_map_tensors(upload_to_current)?;
        }
        for value in self.states.values_mut() {
            *value = upload_to_current(value)?;
        }
        Ok(())
    }

    /// Exchanges this node's own parameter data and states, not its children.
    /// Gradients are never serialized.
    pub(crate) fn serialize(
        &mut self,
        serializer: &mut dyn Serializer<T>,
    ) -> Result<(), SerializeError> {
        {
            let mut params = serializer.scoped(PARAMS_SCOPE);
            for (key, param) in &mut self.params {
                let value = params.exchange(key, param.data())?;
                param.set_data(value);
            }
        }
        let mut states = serializer.scoped(STATES_SCOPE);
        for (key, value) in &mut self.states {
            *value = states.exchange(key, value)?;
        }
        Ok(())
    }
}

/// A node without children.
#[derive(Debug)]
pub struct Leaf<T: TensorHandle = DenseTensor> {
    data: NodeData<T>,
}

impl<T: TensorHandle> Default for Leaf<T> {
    fn default() -> Self {
        Self {
            data: NodeData::default(),
        }
    }
}

impl<T: TensorHandle> Leaf<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, data: T) -> Self {
        self.data.add_param(key, data);
        self
    }

    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: T) -> Self {
        self.data.add_state(key, value);
        self
    }

    #[must_use]
    pub fn data(&self) -> &NodeData<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut NodeData<T> {
        &mut self.data
    }
}

/// An element of a parameter tree.
///
/// A node has at most one parent: containers only accept nodes whose path
/// is empty and assign `parent_path/key` on attachment. Bulk operations
/// visit the node and everything beneath it.
///
/// Copies made with [`CopyMode::Shared`] alias tensor storage across two
/// live trees. That is the one way two trees can share state.
#[derive(Debug)]
pub enum Node<T: TensorHandle = DenseTensor> {
    Leaf(Leaf<T>),
    Dict(DictNode<T>),
    List(ListNode<T>),
}

impl<T: TensorHandle> From<Leaf<T>> for Node<T> {
    fn from(value: Leaf<T>) -> Self {
        Self::Leaf(value)
    }
}

impl<T: TensorHandle> From<DictNode<T>> for Node<T> {
    fn from(value: DictNode<T>) -> Self {
        Self::Dict(value)
    }
}

impl<T: TensorHandle> From<ListNode<T>> for Node<T> {
    fn from(value: ListNode<T>) -> Self {
        Self::List(value)
    }
}

impl<T: TensorHandle> Node<T> {
    #[must_use]
    pub fn leaf() -> Self {
        Self::Leaf(Leaf::new())
    }

    #[must_use]
    pub fn data(&self) -> &NodeData<T> {
        match self {
            Self::Leaf(leaf) => leaf.data(),
            Self::Dict(dict) => dict.data(),
            Self::List(list) => list.data(),
        }
    }

    pub fn data_mut(&mut self) -> &mut NodeData<T> {
        match self {
            Self::Leaf(leaf) => leaf.data_mut(),
            Self::Dict(dict) => dict.data_mut(),
            Self::List(list) => list.data_mut(),
        }
    }

    /// Display name: the node's path, or `/` for an unattached root.
    #[must_use]
    pub fn name(&self) -> &str {
        match self.path() {
            "" => "/",
            path => path,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.data().path()
    }

    /// Whether the node carries a path, i.e. already sits under a parent.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.path().is_empty()
    }

    /// Renames the node and re-paths every descendant. `/` means unattached.
    pub fn set_name(&mut self, name: &str) {
        let name = if name == "/" { "" } else { name };
        match self {
            Self::Leaf(leaf) => leaf.data.set_path(name),
            Self::Dict(dict) => dict.set_name(name),
            Self::List(list) => list.set_name(name),
        }
    }

    pub(crate) fn detach(&mut self) {
        log::debug!("detach {}", self.name());
        self.set_name("");
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&DictNode<T>> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut DictNode<T>> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&ListNode<T>> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ListNode<T>> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    /// Volatility of the first parameter in traversal order, `false` when
    /// the subtree holds no parameters. Mixed flags are not reconciled.
    #[must_use]
    pub fn volatile(&self) -> bool {
        self.visit_params()
            .next()
            .is_some_and(|(_, param)| param.volatile())
    }

    pub fn set_volatile(&mut self, volatile: bool) {
        for (_, param) in self.visit_params_mut() {
            param.set_volatile(volatile);
        }
    }

    /// Structural clone of the subtree. The clone keeps this node's path.
    #[must_use]
    pub fn copy(&self, mode: CopyMode) -> Self {
        match self {
            Self::Leaf(leaf) => Self::Leaf(Leaf {
                data: leaf.data.duplicate(mode),
            }),
            Self::Dict(dict) => Self::Dict(dict.copy(mode)),
            Self::List(list) => Self::List(list.copy(mode)),
        }
    }

    pub fn to_host(&mut self) -> &mut Self {
        self.for_each_data_mut(&mut NodeData::to_host);
        log::debug!("moved subtree {} to host", self.name());
        self
    }

    /// Moves every parameter, gradient and state of the subtree to
    /// accelerator `ordinal`. The accelerator is the current device for the
    /// duration of the call only.
    pub fn to_device(&mut self, ordinal: u32) -> Result<&mut Self, TreeError> {
        let guard = DeviceGuard::enter(Device::Cuda(ordinal))?;
        self.try_for_each_data_mut(&mut NodeData::to_current_device)?;
        log::debug!("moved subtree {} to {}", self.name(), guard.device());
        Ok(self)
    }

    /// Pre-order walk: this node first, then each child's subtree in
    /// container order. Every call starts a fresh traversal.
    #[must_use]
    pub fn visit_nodes(&self) -> Nodes<'_, T> {
        Nodes::new(self)
    }

    /// `(path, parameter)` pairs of the subtree in [`Node::visit_nodes`]
    /// order, where path is `node_path/_params/key`.
    #[must_use]
    pub fn visit_params(&self) -> Params<'_, T> {
        Params::new(self)
    }

    pub fn visit_params_mut(&mut self) -> Vec<(String, &mut Parameter<T>)> {
        let mut out = Vec::new();
        collect_params_mut(self, &mut out);
        out
    }

    /// Total element count over every parameter of the subtree.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.visit_params()
            .map(|(_, param)| param.data().numel())
            .sum()
    }

    /// Overwrites each parameter's data with `other`'s at the same path.
    /// Fails without touching anything when a path is missing from `other`.
    pub fn copy_params_from(&mut self, other: &Self) -> Result<(), TreeError> {
        let sources: HashMap<String, &Parameter<T>> = other.visit_params().collect();
        let targets = self.visit_params_mut();
        ensure_paths_present(&targets, &sources)?;
        for (path, param) in targets {
            param.copy_data_from(sources[&path])?;
        }
        Ok(())
    }

    pub fn zero_grads(&mut self) {
        for (_, param) in self.visit_params_mut() {
            param.zero_grad();
        }
    }

    pub fn clear_grads(&mut self) {
        for (_, param) in self.visit_params_mut() {
            param.clear_grad();
        }
    }

    /// Accumulates `other`'s gradients into this subtree, path by path.
    /// Fails without touching anything when a path is missing from `other`.
    pub fn add_grads_from(&mut self, other: &Self) -> Result<(), TreeError> {
        let sources: HashMap<String, &Parameter<T>> = other.visit_params().collect();
        let targets = self.visit_params_mut();
        ensure_paths_present(&targets, &sources)?;
        for (path, param) in targets {
            param.accumulate_grad(sources[&path])?;
        }
        Ok(())
    }

    /// Runs every parameter's data and every state of the subtree through
    /// `serializer`, replacing each with the value it hands back.
    pub fn serialize(&mut self, serializer: &mut dyn Serializer<T>) -> Result<(), SerializeError> {
        match self {
            Self::Leaf(leaf) => leaf.data.serialize(serializer),
            Self::Dict(dict) => dict.serialize(serializer),
            Self::List(list) => list.serialize(serializer),
        }
    }

    fn split_mut(&mut self) -> (&mut NodeData<T>, Vec<&mut Node<T>>) {
        match self {
            Self::Leaf(leaf) => (&mut leaf.data, Vec::new()),
            Self::Dict(dict) => dict.split_mut(),
            Self::List(list) => list.split_mut(),
        }
    }

    fn for_each_data_mut(&mut self, f: &mut dyn FnMut(&mut NodeData<T>)) {
        let (data, children) = self.split_mut();
        f(data);
        for child in children {
            child.for_each_data_mut(f);
        }
    }

    fn try_for_each_data_mut<E>(
        &mut self,
        f: &mut dyn FnMut(&mut NodeData<T>) -> Result<(), E>,
    ) -> Result<(), E> {
        let (data, children) = self.split_mut();
        f(data)?;
        for child in children {
            child.try_for_each_data_mut(f)?;
        }
        Ok(())
    }
}

fn collect_params_mut<'a, T: TensorHandle>(
    node: &'a mut Node<T>,
    out: &mut Vec<(String, &'a mut Parameter<T>)>,
) {
    let (data, children) = node.split_mut();
    let NodeData { name, params, .. } = data;
    for (key, param) in params.iter_mut() {
        out.push((param_path(name, key), param));
    }
    for child in children {
        collect_params_mut(child, out);
    }
}

fn ensure_paths_present<T: TensorHandle>(
    targets: &[(String, &mut Parameter<T>)],
    sources: &HashMap<String, &Parameter<T>>,
) -> Result<(), TreeError> {
    match targets.iter().find(|(path, _)| !sources.contains_key(path)) {
        Some((path, _)) => Err(TreeError::MissingPath { path: path.clone() }),
        None => Ok(()),
    }
}

/// Path a child gets under a parent for a key or stringified index.
pub(crate) fn child_path(parent: &str, key: &str) -> String {
    join_path(parent, key)
}

pub(crate) fn ensure_detached<T: TensorHandle>(child: &Node<T>) -> Result<(), TreeError> {
    if child.is_attached() {
        return Err(TreeError::AlreadyParented {
            name: child.path().to_string(),
        });
    }
    Ok(())
}
