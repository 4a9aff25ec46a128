//! Conjugate gradient least squares.
//!
//! Minimises `|A x - b|^2` by running conjugate gradients on the normal
//! equations `A'A x = A'b`, with `A` the forward projection and `A'` the back
//! projection of the active geometry. Solver state (`x`, `p`, `r`, `gamma`)
//! lives on the device between calls to [`Cgls::iterate`], so batches of
//! iterations compose exactly:
//!
//! ```text
//! warm start:  r = b - A(m.x)      p = m.A'r       gamma = |p|^2
//! each step:   w = A p             alpha = gamma / |w|^2
//!              x += alpha p        r -= alpha w
//!              z = m.A'r           beta = |z|^2 / gamma
//!              p = z + beta p      gamma = |z|^2
//! ```
//!
//! `m` is the volume mask when one is enabled.
//!
//! With min/max constraints set, `x` is clamped (inside the mask) after the
//! update and the solver restarts from the clamped volume, so `r`, `p` and
//! `gamma` always describe the current `x`.

use tracing::{debug, info, warn};

use crate::algorithm::ReconAlgorithm;
use crate::device::{BufferHandle, Device};
use crate::error::{ReconError, Result};
use crate::geometry::Dimensions;

/// Device work buffers of the solver.
#[derive(Debug, Clone, Copy)]
struct WorkBuffers {
    /// Residual, sinogram shaped.
    r: BufferHandle,
    /// Search direction, volume shaped.
    p: BufferHandle,
    /// Back-projected residual, volume shaped.
    z: BufferHandle,
    /// Forward-projected direction, sinogram shaped.
    w: BufferHandle,
}

impl WorkBuffers {
    /// Volume-shaped buffer free for transient use outside a step.
    fn volume_scratch(&self) -> BufferHandle {
        self.z
    }

    /// Sinogram-shaped buffer free for transient use outside a step.
    fn sinogram_scratch(&self) -> BufferHandle {
        self.w
    }

    fn handles(&self) -> [BufferHandle; 4] {
        [self.r, self.p, self.z, self.w]
    }

    fn matches(&self, dims: &Dimensions) -> bool {
        self.r.extent() == dims.sinogram_extent() && self.p.extent() == dims.volume_extent()
    }
}

enum Step {
    Advanced,
    Converged,
}

#[derive(Debug)]
pub struct Cgls {
    algo: ReconAlgorithm,
    work: Option<WorkBuffers>,
    gamma: f32,
    // Buffer epoch the warm start was computed for.
    warm_epoch: Option<u64>,
}

impl Cgls {
    pub fn new(device: Device) -> Self {
        Self {
            algo: ReconAlgorithm::new(device),
            work: None,
            gamma: 0.0,
            warm_epoch: None,
        }
    }

    pub fn algorithm(&self) -> &ReconAlgorithm {
        &self.algo
    }

    /// Configuration access. Rebinding buffers or reloading data through this
    /// handle restarts the solver on the next [`iterate`](Self::iterate).
    pub fn algorithm_mut(&mut self) -> &mut ReconAlgorithm {
        &mut self.algo
    }

    /// Allocate the work buffers for the configured dimensions.
    ///
    /// Called implicitly by [`iterate`](Self::iterate); safe to repeat.
    pub fn init(&mut self) -> Result<()> {
        self.work_buffers().map(|_| ())
    }

    /// Squared norm of the current gradient.
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    /// Whether the next `iterate` continues from existing solver state.
    pub fn is_warm(&self) -> bool {
        self.work.is_some() && self.warm_epoch == Some(self.algo.epoch())
    }

    /// Run up to `iterations` steps and return how many completed.
    ///
    /// The abort flag is polled before each step. A vanishing gradient or a
    /// projected direction with zero norm means the solver has converged; the
    /// batch ends there.
    pub fn iterate(&mut self, iterations: usize) -> Result<usize> {
        let work = self.work_buffers()?;
        if !self.is_warm() {
            self.warm_start(work)?;
        }

        let mut completed = 0;
        for _ in 0..iterations {
            if self.algo.should_abort() {
                info!(completed, requested = iterations, "cgls aborted");
                break;
            }
            match self.step(work)? {
                Step::Advanced => completed += 1,
                Step::Converged => break,
            }
        }
        info!(completed, requested = iterations, gamma = self.gamma, "cgls batch done");
        Ok(completed)
    }

    /// `|b - A(m.x)|` for the current volume.
    ///
    /// Only the scratch buffers are touched; the iteration sequence is not
    /// affected.
    pub fn compute_residual_norm(&mut self) -> Result<f32> {
        let work = self.work_buffers()?;
        let (volume, sinogram) = self.algo.bound_buffers()?;
        let device = self.algo.device();
        let residual = work.sinogram_scratch();

        device.copy_device_to_device_2d(sinogram, residual)?;
        self.project_masked_volume(volume, residual, work.volume_scratch())?;
        if let Some(mask) = self.algo.sinogram_mask() {
            device.multiply(residual, mask)?;
        }
        Ok(device.sum_of_squares(residual)?.sqrt())
    }

    /// Free the work buffers and reset the underlying algorithm.
    pub fn reset(&mut self) {
        self.release_work();
        self.algo.reset();
    }

    fn work_buffers(&mut self) -> Result<WorkBuffers> {
        let dims = *self.algo.dims().ok_or(ReconError::NotConfigured)?;
        if let Some(work) = self.work {
            if work.matches(&dims) {
                return Ok(work);
            }
            self.release_work();
        }

        let device = self.algo.device().clone();
        let (vw, vh) = dims.volume_extent();
        let (sw, sh) = dims.sinogram_extent();
        let mut allocated = Vec::with_capacity(4);
        for (width, height) in [(sw, sh), (vw, vh), (vw, vh), (sw, sh)] {
            match device.allocate_2d(width, height) {
                Ok(handle) => allocated.push(handle),
                Err(err) => {
                    warn!(error = %err, "cgls work buffer allocation failed");
                    for handle in allocated {
                        if let Err(free_err) = device.free(handle) {
                            warn!(error = %free_err, "rollback free failed");
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        let work = WorkBuffers {
            r: allocated[0],
            p: allocated[1],
            z: allocated[2],
            w: allocated[3],
        };
        debug!("cgls work buffers allocated");
        self.work = Some(work);
        self.warm_epoch = None;
        Ok(work)
    }

    fn warm_start(&mut self, work: WorkBuffers) -> Result<()> {
        let (volume, sinogram) = self.algo.bound_buffers()?;
        let device = self.algo.device();

        // r = b - A(m.x)
        device.copy_device_to_device_2d(sinogram, work.r)?;
        self.project_masked_volume(volume, work.r, work.z)?;
        if let Some(mask) = self.algo.sinogram_mask() {
            device.multiply(work.r, mask)?;
        }

        // p = m.A'r
        device.zero_2d(work.p)?;
        self.algo.back_project(work.p, work.r)?;
        if let Some(mask) = self.algo.volume_mask() {
            device.multiply(work.p, mask)?;
        }

        self.gamma = device.sum_of_squares(work.p)?;
        self.warm_epoch = Some(self.algo.epoch());
        debug!(gamma = self.gamma, "cgls warm start");
        Ok(())
    }

    fn step(&mut self, work: WorkBuffers) -> Result<Step> {
        let (volume, _) = self.algo.bound_buffers()?;
        let device = self.algo.device();
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            debug!(gamma = self.gamma, "gradient vanished");
            return Ok(Step::Converged);
        }

        // w = A p
        device.zero_2d(work.w)?;
        self.algo.forward_project(work.p, work.w, 1.0)?;
        if let Some(mask) = self.algo.sinogram_mask() {
            device.multiply(work.w, mask)?;
        }

        let ww = device.sum_of_squares(work.w)?;
        if !(ww.is_finite() && ww > 0.0) {
            warn!(ww, gamma = self.gamma, "degenerate cgls step, treating as converged");
            return Ok(Step::Converged);
        }
        let alpha = self.gamma / ww;

        device.add_scaled(volume, work.p, alpha)?;
        if self.algo.has_constraints() {
            self.algo.apply_constraints(volume)?;
            self.warm_start(work)?;
            return Ok(Step::Advanced);
        }
        device.add_scaled(work.r, work.w, -alpha)?;

        // z = m.A'r
        device.zero_2d(work.z)?;
        self.algo.back_project(work.z, work.r)?;
        if let Some(mask) = self.algo.volume_mask() {
            device.multiply(work.z, mask)?;
        }

        let gamma = device.sum_of_squares(work.z)?;
        let beta = gamma / self.gamma;
        device.scale_and_add(work.p, work.z, beta)?;
        self.gamma = gamma;
        Ok(Step::Advanced)
    }

    /// `out -= A(m.x)`, using `scratch` for the masked copy of `x`.
    fn project_masked_volume(
        &self,
        volume: BufferHandle,
        out: BufferHandle,
        scratch: BufferHandle,
    ) -> Result<()> {
        match self.algo.volume_mask() {
            Some(mask) => {
                let device = self.algo.device();
                device.copy_device_to_device_2d(volume, scratch)?;
                device.multiply(scratch, mask)?;
                self.algo.forward_project(scratch, out, -1.0)
            }
            None => self.algo.forward_project(volume, out, -1.0),
        }
    }

    fn release_work(&mut self) {
        if let Some(work) = self.work.take() {
            for handle in work.handles() {
                if let Err(err) = self.algo.device().free(handle) {
                    warn!(error = %err, "failed to free cgls work buffer");
                }
            }
        }
        self.gamma = 0.0;
        self.warm_epoch = None;
    }
}

impl Drop for Cgls {
    fn drop(&mut self) {
        self.release_work();
    }
}
