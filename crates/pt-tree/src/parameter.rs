use pt_core::{DenseTensor, TensorError, TensorHandle, ensure_compatible};
use pt_dispatch::{CombineDecision, CombineOp, DispatchError, combine_into};

use crate::CopyMode;

/// A learnable tensor with its gradient and volatility flag.
///
/// The gradient is allocated lazily by [`Parameter::zero_grad`] or
/// [`Parameter::accumulate_grad`] and always matches `data` in shape and
/// device.
#[derive(Debug)]
pub struct Parameter<T: TensorHandle = DenseTensor> {
    data: T,
    grad: Option<T>,
    volatile: bool,
}

impl<T: TensorHandle> Parameter<T> {
    #[must_use]
    pub fn new(data: T) -> Self {
        Self {
            data,
            grad: None,
            volatile: false,
        }
    }

    #[must_use]
    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn set_data(&mut self, data: T) {
        self.data = data;
    }

    #[must_use]
    pub fn grad(&self) -> Option<&T> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut T> {
        self.grad.as_mut()
    }

    pub fn set_grad(&mut self, grad: T) -> Result<(), TensorError> {
        ensure_compatible(self.data.meta(), grad.meta())?;
        self.grad = Some(grad);
        Ok(())
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    #[must_use]
    pub fn volatile(&self) -> bool {
        self.volatile
    }

    pub fn set_volatile(&mut self, volatile: bool) {
        self.volatile = volatile;
    }

    pub fn zero_grad(&mut self) {
        match self.grad.as_mut() {
            Some(grad) => grad.fill_zero(),
            None => self.grad = Some(self.data.zeros_like()),
        }
    }

    /// Adds `other`'s gradient into this one, allocating a zero gradient
    /// first if needed. A source without a gradient contributes nothing.
    pub fn accumulate_grad(
        &mut self,
        other: &Self,
    ) -> Result<Option<CombineDecision>, DispatchError> {
        let Some(src) = other.grad.as_ref() else {
            return Ok(None);
        };
        let dst = self.grad.get_or_insert_with(|| self.data.zeros_like());
        combine_into(dst, src, CombineOp::Add).map(Some)
    }

    pub fn copy_data_from(&mut self, other: &Self) -> Result<CombineDecision, DispatchError> {
        combine_into(&mut self.data, &other.data, CombineOp::Copy)
    }

    #[must_use]
    pub fn duplicate(&self, mode: CopyMode) -> Self {
        let copy = |tensor: &T| match mode {
            CopyMode::Shared => tensor.clone(),
            CopyMode::Deep => tensor.deep_copy(),
        };
        Self {
            data: copy(&self.data),
            grad: self.grad.as_ref().map(copy),
            volatile: self.volatile,
        }
    }

    pub(crate) fn to_host(&mut self) {
        self.data = self.data.to_host();
        self.grad = self.grad.as_ref().map(TensorHandle::to_host);
    }

    pub(crate) fn try_map_tensors<E>(
        &mut self,
        mut f: impl FnMut(&T) -> Result<T, E>,
    ) -> Result<(), E> {
        self.data = f(&self.data)?;
        self.grad = self.grad.as_ref().map(&mut f).transpose()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pt_core::{DType, DenseTensor, Device, TensorError, TensorHandle};
    use pt_dispatch::CombineRoute;

    use super::Parameter;
    use crate::CopyMode;

    fn tensor(values: &[f64]) -> DenseTensor {
        DenseTensor::from_values(values.to_vec(), vec![values.len()], DType::F64)
            .expect("tensor should build")
    }

    #[test]
    fn zero_grad_allocates_then_fills_in_place() {
        let mut param = Parameter::new(tensor(&[1.0, 2.0]).upload(0));
        assert!(param.grad().is_none());

        param.zero_grad();
        let grad = param.grad().expect("grad allocated").clone();
        assert_eq!(grad.values(), vec![0.0, 0.0]);
        assert_eq!(grad.device(), Device::Cuda(0));

        param
            .grad_mut()
            .expect("grad present")
            .add_assign(&tensor(&[1.0, 1.0]).upload(0))
            .expect("add");
        param.zero_grad();
        assert!(param.grad().expect("grad kept").shares_storage(&grad));
        assert_eq!(grad.values(), vec![0.0, 0.0]);
    }

    #[test]
    fn set_grad_enforces_matching_shape_and_device() {
        let mut param = Parameter::new(tensor(&[1.0, 2.0]));
        assert!(matches!(
            param.set_grad(tensor(&[1.0])),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            param.set_grad(tensor(&[1.0, 2.0]).upload(1)),
            Err(TensorError::DeviceMismatch { .. })
        ));
        param.set_grad(tensor(&[3.0, 4.0])).expect("matching grad");
        param.clear_grad();
        assert!(param.grad().is_none());
    }

    #[test]
    fn accumulate_grad_allocates_missing_destination() {
        let mut dst = Parameter::new(tensor(&[0.0, 0.0]));
        let mut src = Parameter::new(tensor(&[0.0, 0.0]).upload(2));
        src.set_grad(tensor(&[1.0, 2.0]).upload(2)).expect("grad");

        let decision = dst
            .accumulate_grad(&src)
            .expect("accumulate")
            .expect("source has grad");
        assert_eq!(decision.route, CombineRoute::HostDestination);
        assert_eq!(dst.grad().expect("grad").values(), vec![1.0, 2.0]);
        assert_eq!(dst.grad().expect("grad").device(), Device::Cpu);
    }

    #[test]
    fn accumulate_grad_without_source_grad_is_noop() {
        let mut dst = Parameter::new(tensor(&[1.0]));
        let src = Parameter::new(tensor(&[1.0]));
        assert_eq!(dst.accumulate_grad(&src), Ok(None));
        assert!(dst.grad().is_none());
    }

    #[test]
    fn duplicate_shares_or_copies_tensors() {
        let mut param = Parameter::new(tensor(&[1.0]));
        param.zero_grad();
        param.set_volatile(true);

        let shared = param.duplicate(CopyMode::Shared);
        assert!(shared.data().shares_storage(param.data()));
        assert!(
            shared
                .grad()
                .expect("grad")
                .shares_storage(param.grad().expect("grad"))
        );
        assert!(shared.volatile());

        let deep = param.duplicate(CopyMode::Deep);
        assert!(!deep.data().shares_storage(param.data()));
        assert_eq!(deep.data().values(), param.data().values());
        assert!(
            !deep
                .grad()
                .expect("grad")
                .shares_storage(param.grad().expect("grad"))
        );
    }

    #[test]
    fn to_host_moves_data_and_grad() {
        let mut param = Parameter::new(tensor(&[5.0]).upload(3));
        param.zero_grad();
        param.to_host();
        assert_eq!(param.data().device(), Device::Cpu);
        assert_eq!(param.grad().expect("grad").device(), Device::Cpu);
        assert_eq!(param.data().values(), vec![5.0]);
    }
}
