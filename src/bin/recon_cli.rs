use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use ndarray_npy::{write_npy, NpzReader, NpzWriter};
use tracing::info;

use recon_algo::logging::{init_tracing, LogConfig, LogFormat};
use recon_algo::phantom::{add_gaussian_noise, disk_phantom};
use recon_algo::{Cgls, Device, ReconAlgorithm, ReconConfig};

/// CGLS reconstruction for parallel and fan-beam sinograms.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Tracing filter directives (defaults to RUST_LOG, then "info")
    #[arg(long, global = true)]
    log: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogOutput::Text, global = true)]
    log_format: LogOutput,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogOutput {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconstruct a volume from an NPZ sinogram.
    ///
    /// Expected NPZ keys:
    ///   - "sinogram": (angles, detectors) f32, required
    ///   - "initial_volume": (height, width) f32, optional (zeros)
    ///   - "volume_mask", "sinogram_mask": optional f32 masks
    Reconstruct {
        /// NPZ file with the sinogram and optional masks
        #[arg(long)]
        data: PathBuf,

        /// Geometry / run configuration JSON
        #[arg(long)]
        geometry: PathBuf,

        /// Total iterations (overrides the configuration)
        #[arg(long)]
        iterations: Option<usize>,

        /// Iterations per batch; the residual is reported after each batch
        #[arg(long)]
        batch: Option<usize>,

        /// Output path for the reconstructed volume (.npy)
        #[arg(long)]
        output: PathBuf,
    },

    /// Forward-project a disk phantom into an NPZ sinogram.
    Simulate {
        /// Geometry / run configuration JSON
        #[arg(long)]
        geometry: PathBuf,

        /// Standard deviation of additive Gaussian noise
        #[arg(long, default_value_t = 0.0)]
        noise_std: f32,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Output NPZ with "sinogram" and "phantom"
        #[arg(long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&LogConfig {
        directives: args.log.clone(),
        format: match args.log_format {
            LogOutput::Text => LogFormat::Text,
            LogOutput::Json => LogFormat::Json,
        },
        ..LogConfig::default()
    })?;

    match args.command {
        Command::Reconstruct {
            data,
            geometry,
            iterations,
            batch,
            output,
        } => reconstruct(&data, &geometry, iterations, batch, &output),
        Command::Simulate {
            geometry,
            noise_std,
            seed,
            output,
        } => simulate(&geometry, noise_std, seed, &output),
    }
}

fn load_config(path: &Path) -> Result<ReconConfig> {
    ReconConfig::from_json_file(path)
        .with_context(|| format!("Failed to load geometry JSON {:?}", path))
}

fn optional_array(npz: &mut NpzReader<File>, name: &str) -> Result<Option<Array2<f32>>> {
    let present = npz
        .names()
        .context("Failed to list NPZ entries")?
        .iter()
        .any(|n| n == name || n.strip_suffix(".npy") == Some(name));
    if !present {
        return Ok(None);
    }
    let array = npz
        .by_name(name)
        .with_context(|| format!("Invalid '{name}' array in NPZ"))?;
    Ok(Some(array))
}

fn reconstruct(
    data: &Path,
    geometry: &Path,
    iterations: Option<usize>,
    batch: Option<usize>,
    output: &Path,
) -> Result<()> {
    let config = load_config(geometry)?;
    let (dims, geom) = config.setup();

    // --- Load sinogram + optional arrays from NPZ ---
    let file = File::open(data).with_context(|| format!("Failed to open NPZ {:?}", data))?;
    let mut npz = NpzReader::new(file).with_context(|| format!("Failed to read NPZ {:?}", data))?;
    let sinogram: Array2<f32> = npz
        .by_name("sinogram")
        .context("Missing or invalid 'sinogram' array in NPZ")?;
    let initial = optional_array(&mut npz, "initial_volume")?
        .unwrap_or_else(|| Array2::zeros((dims.vol_height, dims.vol_width)));
    let volume_mask = optional_array(&mut npz, "volume_mask")?;
    let sinogram_mask = optional_array(&mut npz, "sinogram_mask")?;

    // --- Configure the solver ---
    let mut cgls = Cgls::new(Device::new());
    let algo = cgls.algorithm_mut();
    if let Some(index) = config.gpu_index {
        algo.select_device(index)?;
    }
    algo.set_geometry(dims, geom)?;
    if volume_mask.is_some() {
        algo.enable_volume_mask();
    }
    if sinogram_mask.is_some() {
        algo.enable_sinogram_mask();
    }
    if let Some(min) = config.min_constraint {
        algo.set_min_constraint(min);
    }
    if let Some(max) = config.max_constraint {
        algo.set_max_constraint(max);
    }
    algo.allocate_buffers()?;
    algo.copy_input_to_device(
        sinogram.view(),
        config.sinogram_scale,
        initial.view(),
        volume_mask.as_ref().map(|m| m.view()),
        sinogram_mask.as_ref().map(|m| m.view()),
    )?;

    let total = iterations.unwrap_or(config.iterations);
    let batch = batch.or(config.batch_size).unwrap_or(total).max(1);
    info!(
        vol_width = dims.vol_width,
        vol_height = dims.vol_height,
        angles = dims.proj_angles,
        dets = dims.proj_dets,
        iterations = total,
        batch,
        "running CGLS"
    );

    // --- Run in batches, reporting progress ---
    let mut done = 0;
    while done < total {
        let requested = batch.min(total - done);
        let completed = cgls.iterate(requested)?;
        done += completed;
        let residual = cgls.compute_residual_norm()?;
        info!(iterations = done, residual, "batch finished");
        if completed < requested {
            info!("solver converged early");
            break;
        }
    }

    let volume = read_volume(cgls.algorithm())?;
    write_npy(output, &volume).with_context(|| format!("Failed to write output NPY {:?}", output))?;
    info!(path = ?output, "reconstruction written");
    Ok(())
}

fn read_volume(algo: &ReconAlgorithm) -> Result<Array2<f32>> {
    let Some(dims) = algo.dims() else {
        bail!("solver lost its geometry");
    };
    let mut volume = Array2::<f32>::zeros((dims.vol_height, dims.vol_width));
    algo.read_volume_from_device(volume.view_mut())?;
    Ok(volume)
}

fn simulate(geometry: &Path, noise_std: f32, seed: u64, output: &Path) -> Result<()> {
    let config = load_config(geometry)?;
    let (dims, geom) = config.setup();
    let phantom = disk_phantom(dims.vol_width, dims.vol_height);

    let device = Device::new();
    let mut algo = ReconAlgorithm::new(device.clone());
    algo.set_geometry(dims, geom)?;
    algo.allocate_buffers()?;
    let (volume, sinogram_buf) = match (algo.volume(), algo.sinogram()) {
        (Some(v), Some(s)) => (v, s),
        _ => bail!("buffers missing after allocation"),
    };
    device.copy_host_to_device_2d(phantom.view(), volume)?;
    algo.forward_project(volume, sinogram_buf, 1.0)?;
    let mut sinogram = device.to_host(sinogram_buf)?;
    add_gaussian_noise(&mut sinogram, noise_std, seed)
        .map_err(|err| anyhow!("invalid --noise-std {noise_std}: {err}"))?;

    let file = File::create(output).with_context(|| format!("Failed to create NPZ {:?}", output))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("sinogram", &sinogram)
        .context("Failed to write 'sinogram'")?;
    npz.add_array("phantom", &phantom)
        .context("Failed to write 'phantom'")?;
    npz.finish().context("Failed to finish NPZ")?;

    info!(path = ?output, angles = dims.proj_angles, dets = dims.proj_dets, noise_std, "sinogram simulated");
    Ok(())
}
