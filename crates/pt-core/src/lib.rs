#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F64,
    F32,
}

/// Where a tensor's storage lives: host memory or one of several accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Cpu)
    }

    #[must_use]
    pub const fn ordinal(self) -> Option<u32> {
        match self {
            Self::Cpu => None,
            Self::Cuda(ordinal) => Some(ordinal),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        Self {
            shape,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DeviceMismatch {
        lhs: Device,
        rhs: Device,
    },
    DTypeMismatch {
        lhs: DType,
        rhs: DType,
    },
    StorageLength {
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs}, rhs={rhs}")
            }
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::StorageLength { expected, actual } => {
                write!(
                    f,
                    "storage length mismatch: shape needs {expected} values, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Checks that two tensors can be combined elementwise in place.
pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    if lhs.shape() != rhs.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: lhs.shape().to_vec(),
            actual: rhs.shape().to_vec(),
        });
    }

    Ok(())
}

/// Host image of a tensor, the unit stored in checkpoints.
///
/// Values are encoded as IEEE-754 bit patterns so NaN payloads and
/// infinities survive a JSON round trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorRecord {
    pub dtype: DType,
    pub shape: Vec<usize>,
    #[serde(with = "value_bits")]
    pub values: Vec<f64>,
}

mod value_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|value| value.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}

impl TensorRecord {
    pub fn validate(&self) -> Result<(), TensorError> {
        let expected = TensorMeta::from_shape(self.shape.clone(), self.dtype, Device::Cpu).numel();
        if self.values.len() != expected {
            return Err(TensorError::StorageLength {
                expected,
                actual: self.values.len(),
            });
        }
        Ok(())
    }
}

/// Capability a tensor backend provides to the parameter tree.
///
/// `Clone` must produce a handle that aliases the same storage; use
/// [`TensorHandle::deep_copy`] for an independent value. Conversions return
/// a handle on the requested device and alias `self` when it already lives
/// there.
pub trait TensorHandle: Clone + fmt::Debug {
    fn meta(&self) -> &TensorMeta;

    fn device(&self) -> Device {
        self.meta().device()
    }

    fn shape(&self) -> &[usize] {
        self.meta().shape()
    }

    fn numel(&self) -> usize {
        self.meta().numel()
    }

    /// Allocates a zero tensor with the same shape, dtype and device.
    #[must_use]
    fn zeros_like(&self) -> Self;

    /// Fills the storage with zeros in place; every alias observes it.
    fn fill_zero(&mut self);

    #[must_use]
    fn deep_copy(&self) -> Self;

    fn shares_storage(&self, other: &Self) -> bool;

    #[must_use]
    fn to_host(&self) -> Self;

    /// Host to accelerator upload.
    #[must_use]
    fn upload(&self, ordinal: u32) -> Self;

    /// Accelerator to accelerator transfer.
    #[must_use]
    fn transfer(&self, ordinal: u32) -> Self;

    /// `self += src`. Both sides must share device, dtype and shape.
    fn add_assign(&mut self, src: &Self) -> Result<(), TensorError>;

    /// Overwrites `self` with the values of `src`. Both sides must share
    /// device, dtype and shape.
    fn copy_from(&mut self, src: &Self) -> Result<(), TensorError>;

    fn to_record(&self) -> TensorRecord;

    /// Builds a host-resident tensor from a record.
    fn from_record(record: &TensorRecord) -> Result<Self, TensorError>;
}

/// Reference backend: dense `f64` storage with a device tag.
///
/// Accelerator residency is modelled by the tag alone; every conversion
/// allocates fresh storage, so identity checks behave like a real device
/// copy.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    storage_id: u64,
    meta: TensorMeta,
    storage: Rc<RefCell<Vec<f64>>>,
}

impl DenseTensor {
    pub fn from_values(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Self, TensorError> {
        Self::from_record(&TensorRecord {
            dtype,
            shape,
            values,
        })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        Self::full(shape, 0.0, dtype, device)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64, dtype: DType, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        let values = vec![value; meta.numel()];
        Self::with_storage(meta, values)
    }

    fn with_storage(meta: TensorMeta, values: Vec<f64>) -> Self {
        Self {
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage: Rc::new(RefCell::new(values)),
        }
    }

    fn placed(&self, device: Device) -> Self {
        let values = self.storage.borrow().clone();
        Self::with_storage(self.meta.clone().with_device(device), values)
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.storage.borrow().clone()
    }
}

impl TensorHandle for DenseTensor {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn zeros_like(&self) -> Self {
        Self::zeros(self.meta.shape().to_vec(), self.meta.dtype(), self.meta.device())
    }

    fn fill_zero(&mut self) {
        self.storage.borrow_mut().fill(0.0);
    }

    fn deep_copy(&self) -> Self {
        self.placed(self.meta.device())
    }

    fn shares_storage(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    fn to_host(&self) -> Self {
        if self.meta.device().is_host() {
            return self.clone();
        }
        self.placed(Device::Cpu)
    }

    fn upload(&self, ordinal: u32) -> Self {
        if self.meta.device() == Device::Cuda(ordinal) {
            return self.clone();
        }
        self.placed(Device::Cuda(ordinal))
    }

    fn transfer(&self, ordinal: u32) -> Self {
        self.upload(ordinal)
    }

    fn add_assign(&mut self, src: &Self) -> Result<(), TensorError> {
        ensure_compatible(&self.meta, &src.meta)?;
        if self.shares_storage(src) {
            for value in self.storage.borrow_mut().iter_mut() {
                *value += *value;
            }
            return Ok(());
        }

        let src_values = src.storage.borrow();
        let mut dst_values = self.storage.borrow_mut();
        for (dst, src) in dst_values.iter_mut().zip(src_values.iter()) {
            *dst += *src;
        }
        Ok(())
    }

    fn copy_from(&mut self, src: &Self) -> Result<(), TensorError> {
        ensure_compatible(&self.meta, &src.meta)?;
        if self.shares_storage(src) {
            return Ok(());
        }
        self.storage
            .borrow_mut()
            .copy_from_slice(src.storage.borrow().as_slice());
        Ok(())
    }

    fn to_record(&self) -> TensorRecord {
        TensorRecord {
            dtype: self.meta.dtype(),
            shape: self.meta.shape().to_vec(),
            values: self.values(),
        }
    }

    fn from_record(record: &TensorRecord) -> Result<Self, TensorError> {
        record.validate()?;
        let meta = TensorMeta::from_shape(record.shape.clone(), record.dtype, Device::Cpu);
        Ok(Self::with_storage(meta, record.values.clone()))
    }
}
