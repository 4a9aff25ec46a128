//! Device buffer and geometry manager shared by the iterative solvers.
//!
//! A [`ReconAlgorithm`] owns the problem dimensions, the resolved projection
//! operator for the active geometry, and the four device buffers a solver
//! works on: volume, sinogram and the two optional masks. Buffers are either
//! bound from the caller ([`ReconAlgorithm::set_buffers`]) or allocated here
//! ([`ReconAlgorithm::allocate_buffers`]); only the latter are ever freed by
//! the algorithm.
//!
//! Every rebind or data reload bumps a buffer epoch. Solvers keep derived
//! device state keyed on that epoch and rebuild it when it moves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use tracing::{debug, warn};

use crate::device::{BufferHandle, Device};
use crate::error::{DeviceError, ReconError, Result};
use crate::geometry::{Dimensions, FanProjection, Geometry};
use crate::projector::{projector_for, Projector};

/// Cooperative cancellation flag, polled between iteration steps.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ReconAlgorithm {
    device: Device,
    dims: Option<Dimensions>,
    projector: Option<Box<dyn Projector>>,

    use_volume_mask: bool,
    use_sinogram_mask: bool,
    // Governs all four buffers at once.
    free_gpu_memory: bool,

    volume: Option<BufferHandle>,
    sinogram: Option<BufferHandle>,
    volume_mask: Option<BufferHandle>,
    sinogram_mask: Option<BufferHandle>,

    min_constraint: Option<f32>,
    max_constraint: Option<f32>,

    epoch: u64,
    abort: AbortFlag,
}

impl ReconAlgorithm {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            dims: None,
            projector: None,
            use_volume_mask: false,
            use_sinogram_mask: false,
            free_gpu_memory: false,
            volume: None,
            sinogram: None,
            volume_mask: None,
            sinogram_mask: None,
            min_constraint: None,
            max_constraint: None,
            epoch: 0,
            abort: AbortFlag::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bind the device context. Rebinding over an already active context is
    /// accepted.
    pub fn select_device(&mut self, index: usize) -> Result<()> {
        match self.device.select(index) {
            Ok(()) => Ok(()),
            Err(DeviceError::SetOnActiveProcess { active }) => {
                debug!(requested = index, active, "device context already bound");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_parallel_geometry(&mut self, dims: Dimensions, angles: &[f32]) -> Result<()> {
        self.set_geometry(dims, Geometry::parallel(angles))
    }

    pub fn set_fan_geometry(&mut self, dims: Dimensions, projections: &[FanProjection]) -> Result<()> {
        self.set_geometry(dims, Geometry::fan(projections))
    }

    /// Store `dims` and `geometry`, replacing any previous geometry.
    ///
    /// Buffers that are already bound are not resized, so their extents must
    /// agree with the new dimensions.
    pub fn set_geometry(&mut self, dims: Dimensions, geometry: Geometry) -> Result<()> {
        dims.validate()?;
        geometry.validate(&dims)?;
        self.check_bound_extents(&dims)?;
        debug!(
            parallel = geometry.is_parallel(),
            vol_width = dims.vol_width,
            vol_height = dims.vol_height,
            angles = dims.proj_angles,
            dets = dims.proj_dets,
            "geometry set"
        );
        self.projector = Some(projector_for(dims, geometry));
        self.dims = Some(dims);
        self.epoch += 1;
        Ok(())
    }

    /// Per-angle horizontal detector offsets, in detector elements.
    pub fn set_detector_offsets(&mut self, offsets: &[f32]) -> Result<()> {
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        let angles = match self.geometry() {
            Some(Geometry::Parallel { angles, .. }) => angles,
            Some(Geometry::Fan { .. }) => {
                return Err(ReconError::InvalidGeometry(
                    "detector offsets require a parallel geometry".to_string(),
                ))
            }
            None => return Err(ReconError::NotConfigured),
        };
        let geometry = Geometry::Parallel {
            angles,
            offsets: Some(offsets.to_vec()),
        };
        geometry.validate(&dims)?;
        self.projector = Some(projector_for(dims, geometry));
        self.epoch += 1;
        Ok(())
    }

    pub fn dims(&self) -> Option<&Dimensions> {
        self.dims.as_ref()
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.projector.as_ref().map(|p| p.geometry())
    }

    pub fn enable_volume_mask(&mut self) {
        self.use_volume_mask = true;
    }

    pub fn enable_sinogram_mask(&mut self) {
        self.use_sinogram_mask = true;
    }

    pub fn uses_volume_mask(&self) -> bool {
        self.use_volume_mask
    }

    pub fn uses_sinogram_mask(&self) -> bool {
        self.use_sinogram_mask
    }

    /// Bind a caller-owned volume mask.
    ///
    /// # Panics
    ///
    /// If [`enable_volume_mask`](Self::enable_volume_mask) was not called.
    pub fn set_volume_mask(&mut self, mask: BufferHandle) -> Result<()> {
        assert!(
            self.use_volume_mask,
            "set_volume_mask called without enable_volume_mask"
        );
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        check_handle("volume mask", mask, dims.volume_extent())?;
        self.volume_mask = Some(mask);
        self.epoch += 1;
        Ok(())
    }

    /// Bind a caller-owned sinogram mask.
    ///
    /// # Panics
    ///
    /// If [`enable_sinogram_mask`](Self::enable_sinogram_mask) was not called.
    pub fn set_sinogram_mask(&mut self, mask: BufferHandle) -> Result<()> {
        assert!(
            self.use_sinogram_mask,
            "set_sinogram_mask called without enable_sinogram_mask"
        );
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        check_handle("sinogram mask", mask, dims.sinogram_extent())?;
        self.sinogram_mask = Some(mask);
        self.epoch += 1;
        Ok(())
    }

    /// Bind caller-owned volume and sinogram buffers.
    ///
    /// Buffers previously allocated by [`allocate_buffers`](Self::allocate_buffers)
    /// are released first, masks included.
    pub fn set_buffers(&mut self, volume: BufferHandle, sinogram: BufferHandle) -> Result<()> {
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        check_handle("volume", volume, dims.volume_extent())?;
        check_handle("sinogram", sinogram, dims.sinogram_extent())?;
        self.release_owned_buffers();
        self.volume = Some(volume);
        self.sinogram = Some(sinogram);
        self.free_gpu_memory = false;
        self.epoch += 1;
        Ok(())
    }

    pub fn set_min_constraint(&mut self, value: f32) {
        self.min_constraint = Some(value);
    }

    pub fn set_max_constraint(&mut self, value: f32) {
        self.max_constraint = Some(value);
    }

    pub fn min_constraint(&self) -> Option<f32> {
        self.min_constraint
    }

    pub fn max_constraint(&self) -> Option<f32> {
        self.max_constraint
    }

    pub fn has_constraints(&self) -> bool {
        self.min_constraint.is_some() || self.max_constraint.is_some()
    }

    /// Allocate volume, sinogram and enabled mask buffers on the device.
    ///
    /// Either every buffer is allocated and owned by the algorithm, or none
    /// is and the previous binding is left untouched.
    pub fn allocate_buffers(&mut self) -> Result<()> {
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        let (vw, vh) = dims.volume_extent();
        let (sw, sh) = dims.sinogram_extent();

        let mut requests = vec![(vw, vh), (sw, sh)];
        if self.use_volume_mask {
            requests.push((vw, vh));
        }
        if self.use_sinogram_mask {
            requests.push((sw, sh));
        }

        let mut allocated = Vec::with_capacity(requests.len());
        for (width, height) in requests {
            match self.device.allocate_2d(width, height) {
                Ok(handle) => allocated.push(handle),
                Err(err) => {
                    warn!(error = %err, rolled_back = allocated.len(), "buffer allocation failed");
                    for handle in allocated {
                        if let Err(free_err) = self.device.free(handle) {
                            warn!(error = %free_err, "rollback free failed");
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        self.release_owned_buffers();
        let mut handles = allocated.into_iter();
        self.volume = handles.next();
        self.sinogram = handles.next();
        self.volume_mask = if self.use_volume_mask { handles.next() } else { None };
        self.sinogram_mask = if self.use_sinogram_mask { handles.next() } else { None };
        self.free_gpu_memory = true;
        self.epoch += 1;
        debug!(
            volume_mask = self.use_volume_mask,
            sinogram_mask = self.use_sinogram_mask,
            "device buffers allocated"
        );
        Ok(())
    }

    /// Upload host data into the bound buffers.
    ///
    /// After upload the sinogram is multiplied by `sinogram_scale`. Masks are
    /// uploaded only when enabled, and are then required.
    pub fn copy_input_to_device(
        &mut self,
        sinogram: ArrayView2<'_, f32>,
        sinogram_scale: f32,
        volume: ArrayView2<'_, f32>,
        volume_mask: Option<ArrayView2<'_, f32>>,
        sinogram_mask: Option<ArrayView2<'_, f32>>,
    ) -> Result<()> {
        let dims = self.dims.ok_or(ReconError::NotConfigured)?;
        let (volume_buf, sinogram_buf) = self.bound_buffers()?;
        check_host("sinogram", &sinogram, dims.sinogram_extent())?;
        check_host("volume", &volume, dims.volume_extent())?;

        let volume_mask = if self.use_volume_mask {
            let host = volume_mask.ok_or(ReconError::MissingMask("volume"))?;
            check_host("volume mask", &host, dims.volume_extent())?;
            Some((host, self.volume_mask.ok_or(ReconError::BuffersNotBound)?))
        } else {
            None
        };
        let sinogram_mask = if self.use_sinogram_mask {
            let host = sinogram_mask.ok_or(ReconError::MissingMask("sinogram"))?;
            check_host("sinogram mask", &host, dims.sinogram_extent())?;
            Some((host, self.sinogram_mask.ok_or(ReconError::BuffersNotBound)?))
        } else {
            None
        };

        self.device.copy_host_to_device_2d(sinogram, sinogram_buf)?;
        self.device.scale(sinogram_buf, sinogram_scale)?;
        self.device.copy_host_to_device_2d(volume, volume_buf)?;
        if let Some((host, buf)) = volume_mask {
            self.device.copy_host_to_device_2d(host, buf)?;
        }
        if let Some((host, buf)) = sinogram_mask {
            self.device.copy_host_to_device_2d(host, buf)?;
        }
        self.epoch += 1;
        Ok(())
    }

    /// Copy the device volume into `out`, whose strides give the host layout.
    pub fn read_volume_from_device(&self, out: ArrayViewMut2<'_, f32>) -> Result<()> {
        let volume = self.volume.ok_or(ReconError::BuffersNotBound)?;
        self.device.copy_device_to_host_2d(volume, out)?;
        Ok(())
    }

    pub fn volume_to_host(&self) -> Result<Array2<f32>> {
        let volume = self.volume.ok_or(ReconError::BuffersNotBound)?;
        Ok(self.device.to_host(volume)?)
    }

    /// `sinogram += output_scale * A * volume` for the active geometry.
    ///
    /// # Panics
    ///
    /// If no geometry has been set.
    pub fn forward_project(
        &self,
        volume: BufferHandle,
        sinogram: BufferHandle,
        output_scale: f32,
    ) -> Result<()> {
        let projector = self.projector();
        let dims = projector.dims();
        check_handle("volume", volume, dims.volume_extent())?;
        check_handle("sinogram", sinogram, dims.sinogram_extent())?;
        self.device
            .with_pair(volume, sinogram, |vol, sino| projector.forward(vol, sino, output_scale))?;
        Ok(())
    }

    /// `volume += A' * sinogram` for the active geometry.
    ///
    /// # Panics
    ///
    /// If no geometry has been set.
    pub fn back_project(&self, volume: BufferHandle, sinogram: BufferHandle) -> Result<()> {
        let projector = self.projector();
        let dims = projector.dims();
        check_handle("volume", volume, dims.volume_extent())?;
        check_handle("sinogram", sinogram, dims.sinogram_extent())?;
        self.device
            .with_pair(sinogram, volume, |sino, vol| projector.backward(sino, vol))?;
        Ok(())
    }

    /// Clamp a volume buffer to the registered min/max constraints.
    ///
    /// With a volume mask enabled only masked-in pixels are clamped.
    pub fn apply_constraints(&self, volume: BufferHandle) -> Result<()> {
        let (min, max) = (self.min_constraint, self.max_constraint);
        match self.volume_mask() {
            Some(mask) => self.device.clamp_masked(volume, mask, min, max)?,
            None => self.device.clamp(volume, min, max)?,
        }
        Ok(())
    }

    pub fn volume(&self) -> Option<BufferHandle> {
        self.volume
    }

    pub fn sinogram(&self) -> Option<BufferHandle> {
        self.sinogram
    }

    /// The bound volume mask, if masking is enabled.
    pub fn volume_mask(&self) -> Option<BufferHandle> {
        self.volume_mask.filter(|_| self.use_volume_mask)
    }

    pub fn sinogram_mask(&self) -> Option<BufferHandle> {
        self.sinogram_mask.filter(|_| self.use_sinogram_mask)
    }

    /// Volume and sinogram buffers, once every enabled mask is bound too.
    pub(crate) fn bound_buffers(&self) -> Result<(BufferHandle, BufferHandle)> {
        let (volume, sinogram) = match (self.volume, self.sinogram) {
            (Some(volume), Some(sinogram)) => (volume, sinogram),
            _ => return Err(ReconError::BuffersNotBound),
        };
        if self.use_volume_mask && self.volume_mask.is_none() {
            return Err(ReconError::MaskNotBound("volume"));
        }
        if self.use_sinogram_mask && self.sinogram_mask.is_none() {
            return Err(ReconError::MaskNotBound("sinogram"));
        }
        Ok((volume, sinogram))
    }

    /// Whether the buffers are owned (and eventually freed) by the algorithm.
    pub fn owns_buffers(&self) -> bool {
        self.free_gpu_memory
    }

    /// Counter bumped whenever bound buffers or their contents are replaced.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn should_abort(&self) -> bool {
        self.abort.is_raised()
    }

    /// Free owned buffers and return to the unconfigured state.
    pub fn reset(&mut self) {
        self.release_owned_buffers();
        self.volume = None;
        self.sinogram = None;
        self.volume_mask = None;
        self.sinogram_mask = None;
        self.dims = None;
        self.projector = None;
        self.use_volume_mask = false;
        self.use_sinogram_mask = false;
        self.min_constraint = None;
        self.max_constraint = None;
        self.abort.clear();
        self.epoch += 1;
    }

    fn projector(&self) -> &dyn Projector {
        match self.projector.as_deref() {
            Some(projector) => projector,
            None => panic!("projection requested before a geometry was set"),
        }
    }

    fn release_owned_buffers(&mut self) {
        if !self.free_gpu_memory {
            return;
        }
        let owned = [
            self.volume.take(),
            self.sinogram.take(),
            self.volume_mask.take(),
            self.sinogram_mask.take(),
        ];
        for handle in owned.into_iter().flatten() {
            if let Err(err) = self.device.free(handle) {
                warn!(error = %err, "failed to free owned buffer");
            }
        }
        self.free_gpu_memory = false;
    }

    fn check_bound_extents(&self, dims: &Dimensions) -> Result<()> {
        for (what, handle, extent) in [
            ("volume", self.volume, dims.volume_extent()),
            ("sinogram", self.sinogram, dims.sinogram_extent()),
            ("volume mask", self.volume_mask, dims.volume_extent()),
            ("sinogram mask", self.sinogram_mask, dims.sinogram_extent()),
        ] {
            if let Some(handle) = handle {
                check_handle(what, handle, extent)?;
            }
        }
        Ok(())
    }
}

impl Drop for ReconAlgorithm {
    fn drop(&mut self) {
        self.release_owned_buffers();
    }
}

fn check_handle(what: &'static str, handle: BufferHandle, expected: (usize, usize)) -> Result<()> {
    if handle.extent() != expected {
        return Err(ReconError::ShapeMismatch {
            what,
            expected,
            actual: handle.extent(),
        });
    }
    Ok(())
}

fn check_host(what: &'static str, host: &ArrayView2<'_, f32>, expected: (usize, usize)) -> Result<()> {
    let (rows, cols) = host.dim();
    if (cols, rows) != expected {
        return Err(ReconError::ShapeMismatch {
            what,
            expected,
            actual: (cols, rows),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::f32::consts::PI;

    fn dims() -> Dimensions {
        Dimensions::new(4, 4, 3, 6)
    }

    fn angles() -> Vec<f32> {
        (0..3).map(|i| i as f32 * PI / 3.0).collect()
    }

    #[test]
    fn reset_is_idempotent() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.reset();
        algo.reset();
        assert!(algo.dims().is_none());
        assert!(algo.geometry().is_none());

        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        algo.enable_volume_mask();
        algo.set_min_constraint(0.0);
        algo.allocate_buffers().unwrap();
        assert_eq!(device.live_buffers(), 3);

        algo.reset();
        assert_eq!(device.live_buffers(), 0);
        algo.reset();
        assert!(algo.volume().is_none());
        assert!(!algo.uses_volume_mask());
        assert!(!algo.has_constraints());
        assert!(!algo.owns_buffers());
    }

    #[test]
    fn setting_fan_geometry_replaces_parallel() {
        let mut algo = ReconAlgorithm::new(Device::new());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        algo.set_detector_offsets(&[0.0, 0.5, 1.0]).unwrap();
        let fan = vec![
            FanProjection {
                src_x: 0.0,
                src_y: -20.0,
                det_sx: -3.0,
                det_sy: 10.0,
                det_ux: 1.0,
                det_uy: 0.0,
            };
            3
        ];
        algo.set_fan_geometry(dims(), &fan).unwrap();
        assert!(algo.geometry().unwrap().is_fan());
        assert!(matches!(
            algo.set_detector_offsets(&[0.0; 3]),
            Err(ReconError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn geometry_copies_caller_arrays() {
        let mut algo = ReconAlgorithm::new(Device::new());
        let mut input = angles();
        algo.set_parallel_geometry(dims(), &input).unwrap();
        input[0] = 42.0;
        match algo.geometry() {
            Some(Geometry::Parallel { angles, offsets }) => {
                assert_eq!(angles[0], 0.0);
                assert!(offsets.is_none());
            }
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn failed_allocation_rolls_back() {
        // room for the volume and sinogram, not the mask
        let bytes = 4 * 32 * (4 + 3);
        let device = Device::with_capacity(bytes);
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        algo.enable_volume_mask();
        assert!(matches!(
            algo.allocate_buffers(),
            Err(ReconError::Device(DeviceError::OutOfMemory { .. }))
        ));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.used_bytes(), 0);
        assert!(algo.volume().is_none());
        assert!(!algo.owns_buffers());
    }

    #[test]
    fn external_buffers_survive_the_algorithm() {
        let device = Device::new();
        let volume = device.allocate_2d(4, 4).unwrap();
        let sinogram = device.allocate_2d(6, 3).unwrap();
        {
            let mut algo = ReconAlgorithm::new(device.clone());
            algo.set_parallel_geometry(dims(), &angles()).unwrap();
            algo.allocate_buffers().unwrap();
            assert_eq!(device.live_buffers(), 4);
            // rebinding releases the owned pair
            algo.set_buffers(volume, sinogram).unwrap();
            assert_eq!(device.live_buffers(), 2);
            algo.reset();
        }
        assert!(device.contains(volume));
        assert!(device.contains(sinogram));
    }

    #[test]
    fn owned_buffers_are_freed_on_drop() {
        let device = Device::new();
        {
            let mut algo = ReconAlgorithm::new(device.clone());
            algo.set_parallel_geometry(dims(), &angles()).unwrap();
            algo.enable_sinogram_mask();
            algo.allocate_buffers().unwrap();
            assert_eq!(device.live_buffers(), 3);
        }
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn set_buffers_rejects_wrong_shapes() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        let volume = device.allocate_2d(4, 4).unwrap();
        let sinogram = device.allocate_2d(3, 6).unwrap();
        assert_eq!(algo.set_buffers(volume, sinogram), Err(ReconError::NotConfigured));
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        assert!(matches!(
            algo.set_buffers(volume, sinogram),
            Err(ReconError::ShapeMismatch { what: "sinogram", .. })
        ));
    }

    #[test]
    fn copy_input_scales_sinogram_and_requires_masks() {
        let mut algo = ReconAlgorithm::new(Device::new());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        algo.enable_volume_mask();
        algo.allocate_buffers().unwrap();

        let sino = Array2::from_elem((3, 6), 2.0f32);
        let vol = Array2::from_elem((4, 4), 1.0f32);
        let mask = Array2::from_elem((4, 4), 1.0f32);
        assert_eq!(
            algo.copy_input_to_device(sino.view(), 1.0, vol.view(), None, None),
            Err(ReconError::MissingMask("volume"))
        );

        let before = algo.epoch();
        algo.copy_input_to_device(sino.view(), 0.5, vol.view(), Some(mask.view()), None)
            .unwrap();
        assert!(algo.epoch() > before);
        let sinogram = algo.device().to_host(algo.sinogram().unwrap()).unwrap();
        assert!(sinogram.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn select_device_tolerates_active_context() {
        let device = Device::with_device_count(2);
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.select_device(0).unwrap();
        algo.select_device(1).unwrap();
        assert_eq!(device.active_device(), Some(0));
        assert!(matches!(
            algo.select_device(5),
            Err(ReconError::Device(DeviceError::InvalidDevice { .. }))
        ));
    }

    #[test]
    fn enabled_mask_must_be_bound() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        let volume = device.allocate_2d(4, 4).unwrap();
        let sinogram = device.allocate_2d(6, 3).unwrap();
        algo.enable_sinogram_mask();
        algo.set_buffers(volume, sinogram).unwrap();
        assert_eq!(algo.bound_buffers(), Err(ReconError::MaskNotBound("sinogram")));

        let mask = device.allocate_2d(6, 3).unwrap();
        algo.set_sinogram_mask(mask).unwrap();
        assert_eq!(algo.bound_buffers(), Ok((volume, sinogram)));
    }

    #[test]
    fn operator_changes_bump_the_epoch() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        let mut last = algo.epoch();
        algo.set_detector_offsets(&[0.0, 0.5, 1.0]).unwrap();
        assert!(algo.epoch() > last);
        last = algo.epoch();
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        assert!(algo.epoch() > last);
        last = algo.epoch();
        algo.enable_volume_mask();
        let mask = device.allocate_2d(4, 4).unwrap();
        algo.set_volume_mask(mask).unwrap();
        assert!(algo.epoch() > last);
    }

    #[test]
    fn constraints_respect_the_volume_mask() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        algo.enable_volume_mask();
        algo.set_min_constraint(0.5);
        algo.allocate_buffers().unwrap();
        let mut mask = Array2::<f32>::zeros((4, 4));
        mask[[1, 2]] = 1.0;
        let sino = Array2::<f32>::zeros((3, 6));
        let vol = Array2::<f32>::zeros((4, 4));
        algo.copy_input_to_device(sino.view(), 1.0, vol.view(), Some(mask.view()), None)
            .unwrap();

        let volume = algo.volume().unwrap();
        algo.apply_constraints(volume).unwrap();
        let host = algo.volume_to_host().unwrap();
        let mut expected = Array2::<f32>::zeros((4, 4));
        expected[[1, 2]] = 0.5;
        assert_eq!(host, expected);
    }

    #[test]
    #[should_panic(expected = "enable_volume_mask")]
    fn binding_mask_without_enable_panics() {
        let device = Device::new();
        let mut algo = ReconAlgorithm::new(device.clone());
        algo.set_parallel_geometry(dims(), &angles()).unwrap();
        let mask = device.allocate_2d(4, 4).unwrap();
        let _ = algo.set_volume_mask(mask);
    }

    #[test]
    #[should_panic(expected = "geometry")]
    fn projection_without_geometry_panics() {
        let device = Device::new();
        let algo = ReconAlgorithm::new(device.clone());
        let volume = device.allocate_2d(4, 4).unwrap();
        let sinogram = device.allocate_2d(6, 3).unwrap();
        let _ = algo.forward_project(volume, sinogram, 1.0);
    }
}
