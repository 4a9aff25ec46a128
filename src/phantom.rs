//! Synthetic volumes for simulation and testing.

use ndarray::Array2;
use ndarray_rand::rand_distr::{Normal, NormalError, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// `height` x `width` image with a bright disk and an off-centre inclusion.
pub fn disk_phantom(width: usize, height: usize) -> Array2<f32> {
    let cx = 0.5 * width as f32;
    let cy = 0.5 * height as f32;
    let radius = 0.4 * width.min(height) as f32;
    Array2::from_shape_fn((height, width), |(row, col)| {
        let x = col as f32 + 0.5 - cx;
        let y = row as f32 + 0.5 - cy;
        let mut value = 0.0;
        if x * x + y * y <= radius * radius {
            value += 1.0;
        }
        let (ix, iy) = (x - 0.3 * radius, y + 0.2 * radius);
        if ix * ix + iy * iy <= 0.09 * radius * radius {
            value += 0.5;
        }
        value
    })
}

/// Uniform random values in `[0, 1)`, reproducible from `seed`.
pub fn random_volume(width: usize, height: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::random_using((height, width), Uniform::new(0.0f32, 1.0), &mut rng)
}

/// Add zero-mean Gaussian noise with standard deviation `std_dev`.
///
/// Fails on a negative or NaN `std_dev`; zero leaves `data` untouched.
pub fn add_gaussian_noise(data: &mut Array2<f32>, std_dev: f32, seed: u64) -> Result<(), NormalError> {
    let normal = Normal::new(0.0f32, std_dev)?;
    if std_dev == 0.0 {
        return Ok(());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Array2::random_using(data.raw_dim(), normal, &mut rng);
    *data += &noise;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_volume_is_seeded() {
        let a = random_volume(5, 4, 3);
        assert_eq!(a.dim(), (4, 5));
        assert_eq!(a, random_volume(5, 4, 3));
        assert_ne!(a, random_volume(5, 4, 4));
    }

    #[test]
    fn disk_phantom_is_nonnegative_and_centered() {
        let p = disk_phantom(16, 16);
        assert!(p.iter().all(|&v| v >= 0.0));
        assert!(p[[8, 8]] >= 1.0);
        assert_eq!(p[[0, 0]], 0.0);
    }

    #[test]
    fn zero_noise_is_identity() {
        let mut p = disk_phantom(8, 8);
        let before = p.clone();
        add_gaussian_noise(&mut p, 0.0, 1).unwrap();
        assert_eq!(p, before);
        add_gaussian_noise(&mut p, 0.1, 1).unwrap();
        assert_ne!(p, before);
    }

    #[test]
    fn invalid_noise_level_is_rejected() {
        let mut p = disk_phantom(8, 8);
        let before = p.clone();
        assert!(add_gaussian_noise(&mut p, f32::NAN, 1).is_err());
        assert!(add_gaussian_noise(&mut p, -0.5, 1).is_err());
        assert_eq!(p, before);
    }
}
