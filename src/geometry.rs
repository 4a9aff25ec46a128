//! Reconstruction dimensions and projection geometries.

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

/// Problem size shared by every buffer of a run.
///
/// Volumes are `vol_width` x `vol_height`; sinograms have one row per angle
/// and one column per detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub vol_width: usize,
    pub vol_height: usize,
    pub proj_angles: usize,
    pub proj_dets: usize,
    /// Detector element width in volume pixels.
    #[serde(default = "default_det_scale")]
    pub det_scale: f32,
    /// Sub-rays traced per detector element.
    #[serde(default = "default_rays_per_det")]
    pub rays_per_det: usize,
}

fn default_det_scale() -> f32 {
    1.0
}

fn default_rays_per_det() -> usize {
    1
}

impl Dimensions {
    pub fn new(vol_width: usize, vol_height: usize, proj_angles: usize, proj_dets: usize) -> Self {
        Self {
            vol_width,
            vol_height,
            proj_angles,
            proj_dets,
            det_scale: default_det_scale(),
            rays_per_det: default_rays_per_det(),
        }
    }

    pub fn with_det_scale(mut self, det_scale: f32) -> Self {
        self.det_scale = det_scale;
        self
    }

    pub fn with_rays_per_det(mut self, rays_per_det: usize) -> Self {
        self.rays_per_det = rays_per_det;
        self
    }

    /// `(width, height)` of a volume buffer.
    pub fn volume_extent(&self) -> (usize, usize) {
        (self.vol_width, self.vol_height)
    }

    /// `(width, height)` of a sinogram buffer.
    pub fn sinogram_extent(&self) -> (usize, usize) {
        (self.proj_dets, self.proj_angles)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vol_width == 0 || self.vol_height == 0 {
            return Err(ReconError::InvalidDimensions(format!(
                "empty volume {}x{}",
                self.vol_width, self.vol_height
            )));
        }
        if self.proj_angles == 0 || self.proj_dets == 0 {
            return Err(ReconError::InvalidDimensions(format!(
                "empty sinogram {} angles x {} detectors",
                self.proj_angles, self.proj_dets
            )));
        }
        if !(self.det_scale.is_finite() && self.det_scale > 0.0) {
            return Err(ReconError::InvalidDimensions(format!(
                "detector scale must be positive, got {}",
                self.det_scale
            )));
        }
        if self.rays_per_det == 0 {
            return Err(ReconError::InvalidDimensions(
                "rays per detector must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-angle fan-beam source and detector placement.
///
/// Detector element `i` spans `det_s + i * det_u` to `det_s + (i + 1) * det_u`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanProjection {
    pub src_x: f32,
    pub src_y: f32,
    pub det_sx: f32,
    pub det_sy: f32,
    pub det_ux: f32,
    pub det_uy: f32,
}

/// The active acquisition geometry. Exactly one variant is live at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Parallel beam: projection angles in radians and optional
    /// per-angle detector offsets (in detector elements).
    Parallel {
        angles: Vec<f32>,
        offsets: Option<Vec<f32>>,
    },
    Fan { projections: Vec<FanProjection> },
}

impl Geometry {
    pub fn parallel(angles: &[f32]) -> Self {
        Geometry::Parallel {
            angles: angles.to_vec(),
            offsets: None,
        }
    }

    pub fn fan(projections: &[FanProjection]) -> Self {
        Geometry::Fan {
            projections: projections.to_vec(),
        }
    }

    pub fn angle_count(&self) -> usize {
        match self {
            Geometry::Parallel { angles, .. } => angles.len(),
            Geometry::Fan { projections } => projections.len(),
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Geometry::Parallel { .. })
    }

    pub fn is_fan(&self) -> bool {
        matches!(self, Geometry::Fan { .. })
    }

    /// Check array lengths against `dims`.
    pub fn validate(&self, dims: &Dimensions) -> Result<()> {
        if self.angle_count() != dims.proj_angles {
            return Err(ReconError::InvalidGeometry(format!(
                "{} angles given for {} projections",
                self.angle_count(),
                dims.proj_angles
            )));
        }
        if let Geometry::Parallel {
            offsets: Some(offsets),
            ..
        } = self
        {
            if offsets.len() != dims.proj_angles {
                return Err(ReconError::InvalidGeometry(format!(
                    "{} detector offsets given for {} projections",
                    offsets.len(),
                    dims.proj_angles
                )));
            }
        }
        Ok(())
    }
}

/// Circular fan-beam acquisition with a flat detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanFlatGeometry {
    pub detector_count: usize,
    pub detector_width: f32,
    pub angles: Vec<f32>,
    /// Distance from the rotation centre to the source.
    pub origin_source: f32,
    /// Distance from the rotation centre to the detector.
    pub origin_detector: f32,
}

impl FanFlatGeometry {
    /// Expand into explicit per-angle source/detector vectors.
    pub fn to_vectors(&self) -> Vec<FanProjection> {
        let half = 0.5 * self.detector_count as f32;
        self.angles
            .iter()
            .map(|&theta| {
                let (sin, cos) = theta.sin_cos();
                let det_ux = cos * self.detector_width;
                let det_uy = sin * self.detector_width;
                FanProjection {
                    src_x: sin * self.origin_source,
                    src_y: -cos * self.origin_source,
                    det_sx: -sin * self.origin_detector - half * det_ux,
                    det_sy: cos * self.origin_detector - half * det_uy,
                    det_ux,
                    det_uy,
                }
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector_count == 0 || self.angles.is_empty() {
            return Err(ReconError::InvalidGeometry(
                "fan-flat geometry needs detectors and angles".to_string(),
            ));
        }
        if !(self.detector_width > 0.0) {
            return Err(ReconError::InvalidGeometry(format!(
                "detector width must be positive, got {}",
                self.detector_width
            )));
        }
        if !(self.origin_source > 0.0) || self.origin_detector < 0.0 {
            return Err(ReconError::InvalidGeometry(format!(
                "invalid distances: source {}, detector {}",
                self.origin_source, self.origin_detector
            )));
        }
        Ok(())
    }
}
