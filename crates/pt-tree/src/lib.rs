#![forbid(unsafe_code)]

//! Hierarchical, device-aware parameter trees.
//!
//! A tree is built from [`Node`] values: plain [`Leaf`] nodes, keyed
//! [`DictNode`] containers and indexed [`ListNode`] containers. Every node
//! holds named [`Parameter`]s and state tensors, knows its own slash path,
//! and takes part in bulk operations over its subtree: gradient resets and
//! accumulation, parameter copies, host/accelerator moves, and
//! serialization through any [`Serializer`].

mod dict;
mod list;
mod node;
mod parameter;
mod visit;

use std::fmt;

use pt_core::TensorHandle;
use pt_device::DeviceError;
use pt_dispatch::DispatchError;
use pt_serialize::{CheckpointMode, CheckpointReader, CheckpointWriter, DecodeConfig};

pub use dict::DictNode;
pub use list::ListNode;
pub use node::{Leaf, Node, NodeData};
pub use parameter::Parameter;
pub use pt_serialize::{SerializeError, Serializer};
pub use visit::{Nodes, Params};

/// How [`Node::copy`] and [`Parameter::duplicate`] treat tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// The copy aliases the original's tensor storage.
    #[default]
    Shared,
    /// Every tensor is copied into fresh storage.
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    AlreadyParented { name: String },
    MissingPath { path: String },
    KeyNotFound { key: String },
    EmptyKey,
    IndexOutOfRange { index: usize, len: usize },
    EmptySequence,
    Device(DeviceError),
    Dispatch(DispatchError),
    Serialize(SerializeError),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyParented { name } => {
                write!(f, "node '{name}' already has a parent")
            }
            Self::MissingPath { path } => write!(f, "source tree has no parameter at '{path}'"),
            Self::KeyNotFound { key } => write!(f, "no child under key '{key}'"),
            Self::EmptyKey => write!(f, "child keys must be non-empty"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for {len} children")
            }
            Self::EmptySequence => write!(f, "pop from empty list node"),
            Self::Device(error) => write!(f, "{error}"),
            Self::Dispatch(error) => write!(f, "{error}"),
            Self::Serialize(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(error) => Some(error),
            Self::Dispatch(error) => Some(error),
            Self::Serialize(error) => Some(error),
            _ => None,
        }
    }
}

impl From<DeviceError> for TreeError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<DispatchError> for TreeError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<SerializeError> for TreeError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

/// Writes every parameter and state of `node` into a JSON checkpoint.
pub fn save_checkpoint<T: TensorHandle>(
    node: &mut Node<T>,
    mode: CheckpointMode,
) -> Result<String, TreeError> {
    let mut writer = CheckpointWriter::new();
    node.serialize(&mut writer)?;
    log::debug!("saving {} tensors from {}", writer.len(), node.name());
    Ok(writer.finish(mode)?)
}

/// Loads a checkpoint produced by [`save_checkpoint`] into an isomorphic
/// tree. Values are copied into the existing tensors, so each keeps its
/// device. A failure part way through leaves earlier slots loaded.
pub fn load_checkpoint<T: TensorHandle>(
    node: &mut Node<T>,
    payload: &str,
    config: &DecodeConfig,
) -> Result<(), TreeError> {
    let mut reader = CheckpointReader::from_json(payload, config)?;
    log::debug!("loading {} tensors into {}", reader.len(), node.name());
    node.serialize(&mut reader)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pt_core::{DType, DenseTensor, Device, TensorHandle};
    use pt_device::DeviceError;
    use pt_serialize::{CheckpointMode, DecodeConfig, DecodeMode, SerializeError};

    use super::{DictNode, Leaf, Node, TreeError, load_checkpoint, save_checkpoint};

    fn tensor(values: &[f64]) -> DenseTensor {
        DenseTensor::from_values(values.to_vec(), vec![values.len()], DType::F64)
            .expect("tensor should build")
    }

    fn model(w: &[f64], mean: &[f64]) -> Node {
        let encoder: Node = Leaf::new()
            .with_param("w", tensor(w))
            .with_state("mean", tensor(mean))
            .into();
        DictNode::from_children([("encoder", encoder)])
            .expect("model")
            .into()
    }

    #[test]
    fn checkpoint_round_trip_restores_params_and_states() {
        let mut source = model(&[1.0, 2.0], &[0.5]);
        let payload = save_checkpoint(&mut source, CheckpointMode::Strict).expect("save");
        assert!(payload.contains("/encoder/_params/w"));
        assert!(payload.contains("/encoder/_states/mean"));

        let mut target = model(&[0.0, 0.0], &[0.0]);
        load_checkpoint(&mut target, &payload, &DecodeConfig::default()).expect("load");
        let encoder = target
            .as_dict()
            .and_then(|dict| dict.get("encoder"))
            .expect("encoder");
        assert_eq!(
            encoder.data().param("w").expect("w").data().values(),
            vec![1.0, 2.0]
        );
        assert_eq!(encoder.data().state("mean").expect("mean").values(), vec![0.5]);
    }

    #[test]
    fn load_keeps_target_device() {
        let mut source = model(&[3.0], &[4.0]);
        let payload = save_checkpoint(&mut source, CheckpointMode::Hardened).expect("save");

        let mut target = model(&[0.0], &[0.0]);
        target.to_device(1).expect("to device");
        let config = DecodeConfig::with_mode(DecodeMode::Hardened);
        load_checkpoint(&mut target, &payload, &config).expect("load");
        for (_, param) in target.visit_params() {
            assert_eq!(param.data().device(), Device::Cuda(1));
            assert_eq!(param.data().values(), vec![3.0]);
        }
    }

    #[test]
    fn load_into_mismatched_tree_reports_missing_entry() {
        let mut source = model(&[1.0], &[1.0]);
        let payload = save_checkpoint(&mut source, CheckpointMode::Strict).expect("save");

        let mut other: Node = DictNode::from_children([(
            "decoder",
            Node::from(Leaf::new().with_param("w", tensor(&[0.0]))),
        )])
        .expect("other")
        .into();
        let err = load_checkpoint(&mut other, &payload, &DecodeConfig::default())
            .expect_err("paths differ");
        assert_eq!(
            err,
            TreeError::Serialize(SerializeError::MissingEntry {
                path: "/decoder/_params/w".to_string()
            })
        );
    }

    #[test]
    fn tree_error_display_and_source() {
        let err = TreeError::from(DeviceError::NoActiveDevice);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("no device scope"));

        let err = TreeError::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(err.to_string(), "index 4 out of range for 2 children");
        assert!(std::error::Error::source(&err).is_none());
    }
}
