//! Iterative tomographic reconstruction on an accelerator device.
//!
//! - [`device`]: pitched device buffers and the elementwise/reduction
//!   primitives the solvers are built from.
//! - [`geometry`]: problem dimensions and the parallel / fan-beam geometries.
//! - [`projector`]: forward and back projection operators per geometry.
//! - [`algorithm`]: buffer ownership, masks, constraints and operator dispatch.
//! - [`cgls`]: the resumable conjugate gradient least squares solver.
//!
//! ```no_run
//! use ndarray::Array2;
//! use recon_algo::{Cgls, Device, Dimensions};
//!
//! # fn main() -> recon_algo::Result<()> {
//! let dims = Dimensions::new(64, 64, 90, 96);
//! let angles: Vec<f32> = (0..90).map(|i| i as f32 * std::f32::consts::PI / 90.0).collect();
//! let sinogram = Array2::<f32>::zeros((90, 96));
//!
//! let mut cgls = Cgls::new(Device::new());
//! let algo = cgls.algorithm_mut();
//! algo.set_parallel_geometry(dims, &angles)?;
//! algo.allocate_buffers()?;
//! algo.copy_input_to_device(sinogram.view(), 1.0, Array2::zeros((64, 64)).view(), None, None)?;
//! cgls.iterate(20)?;
//! let volume = cgls.algorithm().volume_to_host()?;
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod cgls;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod phantom;
pub mod projector;

pub use algorithm::{AbortFlag, ReconAlgorithm};
pub use cgls::Cgls;
pub use config::ReconConfig;
pub use device::{host_view, host_view_mut, BufferHandle, Device};
pub use error::{DeviceError, ReconError, Result};
pub use geometry::{Dimensions, FanFlatGeometry, FanProjection, Geometry};
pub use projector::{FanProjector, ParallelProjector, Projector};
