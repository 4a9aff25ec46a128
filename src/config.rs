//! JSON run configuration.
//!
//! ```json
//! {
//!   "volume": { "width": 64, "height": 64 },
//!   "projection": {
//!     "type": "fanflat",
//!     "detector_count": 96,
//!     "detector_width": 1.0,
//!     "angles": [0.0, 0.1],
//!     "origin_source": 300.0,
//!     "origin_detector": 100.0
//!   },
//!   "iterations": 50
//! }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::geometry::{Dimensions, FanFlatGeometry, FanProjection, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub width: usize,
    pub height: usize,
}

/// Projection geometry as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectionConfig {
    Parallel {
        detector_count: usize,
        #[serde(default = "unit")]
        detector_width: f32,
        angles: Vec<f32>,
        #[serde(default)]
        detector_offsets: Option<Vec<f32>>,
    },
    #[serde(rename = "fanflat")]
    FanFlat(FanFlatGeometry),
    #[serde(rename = "fanflat_vec")]
    FanFlatVec {
        detector_count: usize,
        vectors: Vec<FanProjection>,
    },
}

fn unit() -> f32 {
    1.0
}

fn default_iterations() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconConfig {
    pub volume: VolumeConfig,
    pub projection: ProjectionConfig,
    #[serde(default = "default_rays")]
    pub rays_per_detector: usize,
    #[serde(default)]
    pub min_constraint: Option<f32>,
    #[serde(default)]
    pub max_constraint: Option<f32>,
    #[serde(default = "unit")]
    pub sinogram_scale: f32,
    #[serde(default)]
    pub gpu_index: Option<usize>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Iterations per `iterate` call; `None` runs everything in one batch.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_rays() -> usize {
    1
}

impl ReconConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ReconError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ReconError::Config(format!("cannot open {}: {e}", path.display())))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ReconError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let ProjectionConfig::FanFlat(fan) = &self.projection {
            fan.validate()?;
        }
        if let (Some(lo), Some(hi)) = (self.min_constraint, self.max_constraint) {
            if lo > hi {
                return Err(ReconError::Config(format!(
                    "min constraint {lo} exceeds max constraint {hi}"
                )));
            }
        }
        if self.batch_size == Some(0) {
            return Err(ReconError::Config("batch size must be positive".to_string()));
        }
        let (dims, geometry) = self.setup();
        dims.validate()?;
        geometry.validate(&dims)
    }

    /// Dimensions and geometry to hand to the algorithm.
    pub fn setup(&self) -> (Dimensions, Geometry) {
        let (width, height) = (self.volume.width, self.volume.height);
        let (dims, geometry) = match &self.projection {
            ProjectionConfig::Parallel {
                detector_count,
                detector_width,
                angles,
                detector_offsets,
            } => (
                Dimensions::new(width, height, angles.len(), *detector_count)
                    .with_det_scale(*detector_width),
                Geometry::Parallel {
                    angles: angles.clone(),
                    offsets: detector_offsets.clone(),
                },
            ),
            ProjectionConfig::FanFlat(fan) => (
                Dimensions::new(width, height, fan.angles.len(), fan.detector_count),
                Geometry::Fan {
                    projections: fan.to_vectors(),
                },
            ),
            ProjectionConfig::FanFlatVec {
                detector_count,
                vectors,
            } => (
                Dimensions::new(width, height, vectors.len(), *detector_count),
                Geometry::Fan {
                    projections: vectors.clone(),
                },
            ),
        };
        (dims.with_rays_per_det(self.rays_per_detector), geometry)
    }
}
