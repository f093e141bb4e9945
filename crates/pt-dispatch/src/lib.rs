#![forbid(unsafe_code)]

use std::fmt;

use pt_core::{Device, TensorError, TensorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOp {
    Copy,
    Add,
}

/// How a source value reaches the destination's device before combining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CombineRoute {
    /// Destination is on the host; the source is brought to the host.
    HostDestination,
    /// Destination is on an accelerator, source on the host; upload it.
    UploadToDestination,
    /// Both on the same accelerator; combine directly.
    SameDevice,
    /// Both on accelerators, different ones; transfer device to device.
    PeerTransfer,
}

impl CombineRoute {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::HostDestination => "host_destination",
            Self::UploadToDestination => "upload_to_destination",
            Self::SameDevice => "same_device",
            Self::PeerTransfer => "peer_transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombineDecision {
    pub op: CombineOp,
    pub route: CombineRoute,
    pub src_device: Device,
    pub dst_device: Device,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Tensor(TensorError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(error) => write!(f, "combine failed: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tensor(error) => Some(error),
        }
    }
}

impl From<TensorError> for DispatchError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

#[must_use]
pub fn select_route(dst: Device, src: Device) -> CombineRoute {
    match (dst, src) {
        (Device::Cpu, _) => CombineRoute::HostDestination,
        (Device::Cuda(_), Device::Cpu) => CombineRoute::UploadToDestination,
        (Device::Cuda(dst), Device::Cuda(src)) if dst == src => CombineRoute::SameDevice,
        (Device::Cuda(_), Device::Cuda(_)) => CombineRoute::PeerTransfer,
    }
}

/// Combines `src` into `dst` in place, moving a copy of `src` to `dst`'s
/// device first when they differ. `src` is never mutated and `dst` keeps its
/// device.
pub fn combine_into<T: TensorHandle>(
    dst: &mut T,
    src: &T,
    op: CombineOp,
) -> Result<CombineDecision, DispatchError> {
    let dst_device = dst.device();
    let src_device = src.device();
    let route = select_route(dst_device, src_device);

    let staged;
    let operand = match (route, dst_device) {
        (CombineRoute::HostDestination, _) => {
            staged = src.to_host();
            &staged
        }
        (CombineRoute::UploadToDestination, Device::Cuda(ordinal)) => {
            staged = src.upload(ordinal);
            &staged
        }
        (CombineRoute::PeerTransfer, Device::Cuda(ordinal)) => {
            staged = src.transfer(ordinal);
            &staged
        }
        _ => src,
    };

    match op {
        CombineOp::Copy => dst.copy_from(operand)?,
        CombineOp::Add => dst.add_assign(operand)?,
    }

    log::trace!(
        "combine op={op:?} route={} src={src_device} dst={dst_device}",
        route.label()
    );
    Ok(CombineDecision {
        op,
        route,
        src_device,
        dst_device,
    })
}
