#![forbid(unsafe_code)]

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use pt_core::{Device, TensorHandle};

thread_local! {
    static CURRENT_DEVICE: Cell<Option<Device>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    NotAnAccelerator { device: Device },
    NoActiveDevice,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnAccelerator { device } => {
                write!(f, "device scope requires an accelerator, got {device}")
            }
            Self::NoActiveDevice => write!(f, "no device scope is active on this thread"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Makes an accelerator the current device for the calling thread until the
/// guard is dropped. Scopes nest; dropping restores the enclosing device.
#[derive(Debug)]
pub struct DeviceGuard {
    device: Device,
    previous: Option<Device>,
    // Bound to the thread whose context it changed.
    _not_send: PhantomData<Rc<()>>,
}

impl DeviceGuard {
    pub fn enter(device: Device) -> Result<Self, DeviceError> {
        if device.is_host() {
            return Err(DeviceError::NotAnAccelerator { device });
        }
        let previous = CURRENT_DEVICE.with(|current| current.replace(Some(device)));
        log::trace!("device scope enter {device} (previous={previous:?})");
        Ok(Self {
            device,
            previous,
            _not_send: PhantomData,
        })
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|current| current.set(self.previous));
        log::trace!("device scope exit {}", self.device);
    }
}

/// The accelerator selected by the innermost live [`DeviceGuard`], if any.
#[must_use]
pub fn current_device() -> Option<Device> {
    CURRENT_DEVICE.with(Cell::get)
}

/// Places `tensor` on the current device: an upload for host tensors, a
/// peer transfer for tensors on another accelerator, an alias otherwise.
pub fn upload_to_current<T: TensorHandle>(tensor: &T) -> Result<T, DeviceError> {
    let Some(ordinal) = current_device().and_then(Device::ordinal) else {
        return Err(DeviceError::NoActiveDevice);
    };
    let placed = match tensor.device() {
        Device::Cpu => tensor.upload(ordinal),
        Device::Cuda(current) if current == ordinal => tensor.clone(),
        Device::Cuda(_) => tensor.transfer(ordinal),
    };
    Ok(placed)
}
