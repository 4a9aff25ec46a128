//! In-process accelerator device.
//!
//! Buffers live in device memory owned by a [`Device`] and are addressed by
//! copyable [`BufferHandle`]s. Every buffer is pitched: rows are padded to a
//! multiple of [`PITCH_ALIGNMENT`] elements, and all primitives operate on the
//! logical `width` columns only. Operations execute in issue order on a single
//! implicit stream, so a read always observes the most recent write.
//!
//! ```text
//! host ArrayView2 ──copy_host_to_device_2d──▶ BufferHandle (pitched)
//! host ArrayViewMut2 ◀─copy_device_to_host_2d── BufferHandle
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, ShapeBuilder, Zip};
use tracing::{debug, trace};

use crate::error::DeviceError;

/// Row alignment of device allocations, in elements.
pub const PITCH_ALIGNMENT: usize = 32;

type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Handle to a pitched 2D `f32` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u64,
    width: usize,
    height: usize,
    pitch: usize,
}

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical row length in elements.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row stride in elements (`pitch >= width`).
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// `(width, height)` of the logical region.
    pub fn extent(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn bytes(&self) -> usize {
        self.pitch * self.height * std::mem::size_of::<f32>()
    }
}

struct DeviceState {
    device_count: usize,
    active: Option<usize>,
    capacity: Option<usize>,
    used: usize,
    next_id: u64,
    buffers: HashMap<u64, Array2<f32>>,
}

impl DeviceState {
    fn buffer(&self, handle: BufferHandle) -> DeviceResult<&Array2<f32>> {
        match self.buffers.get(&handle.id) {
            Some(buf) if buf.dim() == (handle.height, handle.pitch) => Ok(buf),
            _ => Err(DeviceError::InvalidHandle(handle.id)),
        }
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> DeviceResult<&mut Array2<f32>> {
        match self.buffers.get_mut(&handle.id) {
            Some(buf) if buf.dim() == (handle.height, handle.pitch) => Ok(buf),
            _ => Err(DeviceError::InvalidHandle(handle.id)),
        }
    }
}

/// Shared handle to one accelerator and its memory.
///
/// Cloning is cheap and every clone addresses the same device. The device is
/// driven from a single host thread and is deliberately not `Send`.
#[derive(Clone)]
pub struct Device {
    state: Rc<RefCell<DeviceState>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Device")
            .field("device_count", &state.device_count)
            .field("active", &state.active)
            .field("live_buffers", &state.buffers.len())
            .field("used_bytes", &state.used)
            .finish()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// A single device with unbounded memory.
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    pub fn with_device_count(device_count: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                device_count,
                active: None,
                capacity: None,
                used: 0,
                next_id: 1,
                buffers: HashMap::new(),
            })),
        }
    }

    /// A single device whose memory is limited to `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        let device = Self::new();
        device.state.borrow_mut().capacity = Some(bytes);
        device
    }

    pub fn device_count(&self) -> usize {
        self.state.borrow().device_count
    }

    /// Index of the device the context is bound to, if any.
    pub fn active_device(&self) -> Option<usize> {
        self.state.borrow().active
    }

    /// Bind the context to device `index`.
    ///
    /// Selecting the already active device is a no-op. Once a context exists
    /// it cannot move to another device.
    pub fn select(&self, index: usize) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        if index >= state.device_count {
            return Err(DeviceError::InvalidDevice {
                index,
                count: state.device_count,
            });
        }
        match state.active {
            Some(active) if active == index => Ok(()),
            Some(active) => Err(DeviceError::SetOnActiveProcess { active }),
            None => {
                debug!(index, "device context bound");
                state.active = Some(index);
                Ok(())
            }
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn used_bytes(&self) -> usize {
        self.state.borrow().used
    }

    /// Whether `handle` still refers to a live allocation.
    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.state.borrow().buffer(handle).is_ok()
    }

    /// Allocate a zeroed, pitched `width` x `height` buffer.
    ///
    /// The first allocation implicitly binds device 0 if no device was
    /// selected.
    pub fn allocate_2d(&self, width: usize, height: usize) -> DeviceResult<BufferHandle> {
        let mut state = self.state.borrow_mut();
        let pitch = width.max(1).div_ceil(PITCH_ALIGNMENT) * PITCH_ALIGNMENT;
        let handle = BufferHandle {
            id: state.next_id,
            width,
            height,
            pitch,
        };
        let requested = handle.bytes();
        if let Some(capacity) = state.capacity {
            let available = capacity.saturating_sub(state.used);
            if requested > available {
                return Err(DeviceError::OutOfMemory {
                    requested,
                    available,
                });
            }
        }
        if state.active.is_none() {
            state.active = Some(0);
        }
        state.next_id += 1;
        state.used += requested;
        state
            .buffers
            .insert(handle.id, Array2::zeros((height, pitch)));
        trace!(id = handle.id, width, height, pitch, "allocated device buffer");
        Ok(handle)
    }

    pub fn free(&self, handle: BufferHandle) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        state.buffer(handle)?;
        state.buffers.remove(&handle.id);
        state.used -= handle.bytes();
        trace!(id = handle.id, "freed device buffer");
        Ok(())
    }

    pub fn zero_2d(&self, handle: BufferHandle) -> DeviceResult<()> {
        self.with_view_mut(handle, |mut view| view.fill(0.0))
    }

    /// Copy a host array into the logical region of `dst`.
    ///
    /// The host stride is whatever `src` carries; see [`host_view`].
    pub fn copy_host_to_device_2d(
        &self,
        src: ArrayView2<'_, f32>,
        dst: BufferHandle,
    ) -> DeviceResult<()> {
        check_extent(dst, src.dim())?;
        self.with_view_mut(dst, |mut view| view.assign(&src))
    }

    pub fn copy_device_to_host_2d(
        &self,
        src: BufferHandle,
        mut dst: ArrayViewMut2<'_, f32>,
    ) -> DeviceResult<()> {
        check_extent(src, dst.dim())?;
        self.with_view(src, |view| dst.assign(&view))
    }

    /// Read a buffer into a freshly allocated, unpadded host array.
    pub fn to_host(&self, src: BufferHandle) -> DeviceResult<Array2<f32>> {
        self.with_view(src, |view| view.to_owned())
    }

    pub fn copy_device_to_device_2d(&self, src: BufferHandle, dst: BufferHandle) -> DeviceResult<()> {
        check_extent(dst, (src.height, src.width))?;
        self.with_pair(src, dst, |s, mut d| d.assign(&s))
    }

    /// `buf *= a`
    pub fn scale(&self, handle: BufferHandle, a: f32) -> DeviceResult<()> {
        self.with_view_mut(handle, |mut view| view.mapv_inplace(|v| v * a))
    }

    /// `dst += a * src`
    pub fn add_scaled(&self, dst: BufferHandle, src: BufferHandle, a: f32) -> DeviceResult<()> {
        check_extent(dst, (src.height, src.width))?;
        self.with_pair(src, dst, |s, d| {
            Zip::from(d).and(&s).for_each(|d, &s| *d += a * s)
        })
    }

    /// `dst = a * dst + src`
    pub fn scale_and_add(&self, dst: BufferHandle, src: BufferHandle, a: f32) -> DeviceResult<()> {
        check_extent(dst, (src.height, src.width))?;
        self.with_pair(src, dst, |s, d| {
            Zip::from(d).and(&s).for_each(|d, &s| *d = a * *d + s)
        })
    }

    /// `dst *= src`, elementwise.
    pub fn multiply(&self, dst: BufferHandle, src: BufferHandle) -> DeviceResult<()> {
        check_extent(dst, (src.height, src.width))?;
        self.with_pair(src, dst, |s, d| Zip::from(d).and(&s).for_each(|d, &s| *d *= s))
    }

    /// Clamp every element to the given optional bounds.
    pub fn clamp(&self, handle: BufferHandle, min: Option<f32>, max: Option<f32>) -> DeviceResult<()> {
        if min.is_none() && max.is_none() {
            return Ok(());
        }
        self.with_view_mut(handle, |mut view| {
            view.mapv_inplace(|mut v| {
                if let Some(lo) = min {
                    v = v.max(lo);
                }
                if let Some(hi) = max {
                    v = v.min(hi);
                }
                v
            })
        })
    }

    /// Clamp only the elements where `mask` is non-zero.
    pub fn clamp_masked(
        &self,
        handle: BufferHandle,
        mask: BufferHandle,
        min: Option<f32>,
        max: Option<f32>,
    ) -> DeviceResult<()> {
        check_extent(handle, (mask.height, mask.width))?;
        if min.is_none() && max.is_none() {
            return Ok(());
        }
        self.with_pair(mask, handle, |keep, d| {
            Zip::from(d).and(&keep).for_each(|v, &m| {
                if m == 0.0 {
                    return;
                }
                if let Some(lo) = min {
                    *v = v.max(lo);
                }
                if let Some(hi) = max {
                    *v = v.min(hi);
                }
            })
        })
    }

    /// Sum of squares over the logical region. Padding columns are excluded.
    pub fn sum_of_squares(&self, handle: BufferHandle) -> DeviceResult<f32> {
        self.with_view(handle, |view| {
            view.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() as f32
        })
    }

    /// Run `f` on the logical region of a buffer.
    pub fn with_view<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(ArrayView2<'_, f32>) -> R,
    ) -> DeviceResult<R> {
        let state = self.state.borrow();
        let buf = state.buffer(handle)?;
        Ok(f(buf.slice(s![.., ..handle.width])))
    }

    pub fn with_view_mut<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(ArrayViewMut2<'_, f32>) -> R,
    ) -> DeviceResult<R> {
        let mut state = self.state.borrow_mut();
        let buf = state.buffer_mut(handle)?;
        Ok(f(buf.slice_mut(s![.., ..handle.width])))
    }

    /// Run `f` with `src` readable and `dst` writable.
    ///
    /// When both handles name the same buffer, `src` is a snapshot taken
    /// before `f` runs.
    pub fn with_pair<R>(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        f: impl FnOnce(ArrayView2<'_, f32>, ArrayViewMut2<'_, f32>) -> R,
    ) -> DeviceResult<R> {
        let mut state = self.state.borrow_mut();
        if src.id == dst.id {
            let buf = state.buffer_mut(dst)?;
            let snapshot = buf.slice(s![.., ..src.width]).to_owned();
            return Ok(f(snapshot.view(), buf.slice_mut(s![.., ..dst.width])));
        }
        state.buffer(dst)?;
        let mut target = match state.buffers.remove(&dst.id) {
            Some(target) => target,
            None => return Err(DeviceError::InvalidHandle(dst.id)),
        };
        let result = state
            .buffer(src)
            .map(|source| f(source.slice(s![.., ..src.width]), target.slice_mut(s![.., ..dst.width])));
        state.buffers.insert(dst.id, target);
        result
    }
}

fn check_extent(handle: BufferHandle, (rows, cols): (usize, usize)) -> DeviceResult<()> {
    if (handle.width, handle.height) != (cols, rows) {
        return Err(DeviceError::ExtentMismatch {
            expected: (handle.width, handle.height),
            actual: (cols, rows),
        });
    }
    Ok(())
}

fn check_host_layout(len: usize, width: usize, height: usize, stride: usize) -> DeviceResult<()> {
    if stride < width {
        return Err(DeviceError::HostLayout(format!(
            "stride {stride} is smaller than width {width}"
        )));
    }
    let required = if height == 0 { 0 } else { (height - 1) * stride + width };
    if len < required {
        return Err(DeviceError::HostLayout(format!(
            "{len} elements cannot hold {height} rows of stride {stride}"
        )));
    }
    Ok(())
}

/// View a row-major host slice with row stride `stride` as `height` x `width`.
pub fn host_view(
    data: &[f32],
    width: usize,
    height: usize,
    stride: usize,
) -> DeviceResult<ArrayView2<'_, f32>> {
    check_host_layout(data.len(), width, height, stride)?;
    ArrayView2::from_shape((height, width).strides((stride, 1)), data)
        .map_err(|e| DeviceError::HostLayout(e.to_string()))
}

pub fn host_view_mut(
    data: &mut [f32],
    width: usize,
    height: usize,
    stride: usize,
) -> DeviceResult<ArrayViewMut2<'_, f32>> {
    check_host_layout(data.len(), width, height, stride)?;
    ArrayViewMut2::from_shape((height, width).strides((stride, 1)), data)
        .map_err(|e| DeviceError::HostLayout(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pitch_is_aligned_and_padding_is_ignored() {
        let device = Device::new();
        let buf = device.allocate_2d(5, 3).unwrap();
        assert_eq!(buf.pitch(), PITCH_ALIGNMENT);
        device.with_view_mut(buf, |mut v| v.fill(2.0)).unwrap();
        // 15 logical elements of 4.0 each; padding stays out of the sum
        assert_eq!(device.sum_of_squares(buf).unwrap(), 60.0);
    }

    #[test]
    fn select_rebind_reports_active_process() {
        let device = Device::with_device_count(2);
        device.select(1).unwrap();
        device.select(1).unwrap();
        assert_eq!(
            device.select(0),
            Err(DeviceError::SetOnActiveProcess { active: 1 })
        );
        assert!(matches!(
            device.select(7),
            Err(DeviceError::InvalidDevice { index: 7, count: 2 })
        ));
    }

    #[test]
    fn capacity_limits_allocation() {
        let one_row = PITCH_ALIGNMENT * 4;
        let device = Device::with_capacity(one_row * 2);
        let a = device.allocate_2d(8, 1).unwrap();
        let _b = device.allocate_2d(8, 1).unwrap();
        assert!(matches!(
            device.allocate_2d(8, 1),
            Err(DeviceError::OutOfMemory { .. })
        ));
        device.free(a).unwrap();
        assert!(device.allocate_2d(8, 1).is_ok());
    }

    #[test]
    fn double_free_is_rejected() {
        let device = Device::new();
        let buf = device.allocate_2d(4, 4).unwrap();
        device.free(buf).unwrap();
        assert_eq!(device.free(buf), Err(DeviceError::InvalidHandle(buf.id())));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.used_bytes(), 0);
    }

    #[test]
    fn strided_host_copies() {
        let device = Device::new();
        let buf = device.allocate_2d(2, 2).unwrap();
        let host = [1.0, 2.0, -1.0, 3.0, 4.0, -1.0];
        device
            .copy_host_to_device_2d(host_view(&host, 2, 2, 3).unwrap(), buf)
            .unwrap();
        let mut out = [0.0f32; 8];
        device
            .copy_device_to_host_2d(buf, host_view_mut(&mut out, 2, 2, 4).unwrap())
            .unwrap();
        assert_eq!(out, [1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0]);
        assert!(host_view(&host, 4, 2, 3).is_err());
    }

    #[test]
    fn masked_clamp_leaves_unmasked_elements() {
        let device = Device::new();
        let buf = device.allocate_2d(2, 2).unwrap();
        let mask = device.allocate_2d(2, 2).unwrap();
        device
            .copy_host_to_device_2d(array![[-1.0, 5.0], [-1.0, 5.0]].view(), buf)
            .unwrap();
        device
            .copy_host_to_device_2d(array![[1.0, 1.0], [0.0, 0.0]].view(), mask)
            .unwrap();
        device.clamp_masked(buf, mask, Some(0.0), Some(2.0)).unwrap();
        assert_eq!(device.to_host(buf).unwrap(), array![[0.0, 2.0], [-1.0, 5.0]]);
    }

    #[test]
    fn elementwise_primitives() {
        let device = Device::new();
        let a = device.allocate_2d(2, 2).unwrap();
        let b = device.allocate_2d(2, 2).unwrap();
        device
            .copy_host_to_device_2d(array![[1.0, 2.0], [3.0, 4.0]].view(), a)
            .unwrap();
        device
            .copy_host_to_device_2d(array![[1.0, 1.0], [0.0, 2.0]].view(), b)
            .unwrap();

        device.add_scaled(a, b, 2.0).unwrap();
        assert_eq!(device.to_host(a).unwrap(), array![[3.0, 4.0], [3.0, 8.0]]);

        device.scale_and_add(a, b, 0.5).unwrap();
        assert_eq!(device.to_host(a).unwrap(), array![[2.5, 3.0], [1.5, 6.0]]);

        device.multiply(a, b).unwrap();
        assert_eq!(device.to_host(a).unwrap(), array![[2.5, 3.0], [0.0, 12.0]]);

        device.multiply(b, b).unwrap();
        assert_eq!(device.to_host(b).unwrap(), array![[1.0, 1.0], [0.0, 4.0]]);

        device.clamp(a, Some(1.0), Some(10.0)).unwrap();
        assert_eq!(device.to_host(a).unwrap(), array![[2.5, 3.0], [1.0, 10.0]]);

        let c = device.allocate_2d(3, 2).unwrap();
        assert!(matches!(
            device.copy_device_to_device_2d(a, c),
            Err(DeviceError::ExtentMismatch { .. })
        ));
    }
}
