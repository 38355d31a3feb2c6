//! Per-run output directory and generated-sample image grids.
use crate::error::{NetError, Result};
use crate::layers::Matrix;
use chrono::Local;
use image::{GrayImage, Luma};
use std::path::{Path, PathBuf};

/// Tiles per grid side; a grid shows `GRID_SIDE * GRID_SIDE` samples.
pub const GRID_SIDE: usize = 4;
/// Blank pixels between tiles.
const GAP: u32 = 1;

/// `<base>/<name>/Run-<Mon-DD-YYYY-HH-MM-SS>`, created on construction.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn create<P: AsRef<Path>>(base: P, name: &str) -> Result<Self> {
        let stamp = Local::now().format("%b-%d-%Y-%H-%M-%S");
        let path = base.as_ref().join(name).join(format!("Run-{stamp}"));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }
}

/// Tile dimensions for a flattened sample: square when possible
/// (784 -> 28x28), otherwise one row of pixels.
pub fn tile_shape(width: usize) -> (u32, u32) {
    let side = (width as f64).sqrt().round() as usize;
    if side * side == width {
        (side as u32, side as u32)
    } else {
        (width as u32, 1)
    }
}

/// Render up to 16 samples with values in [0, 1] as a 4x4 grayscale grid.
pub fn render_grid(samples: &Matrix) -> Result<GrayImage> {
    let width = samples.first().map_or(0, Vec::len);
    if width == 0 {
        return Err(NetError::EmptyDataset("no samples to render".to_string()));
    }
    let (tw, th) = tile_shape(width);
    let side = GRID_SIDE as u32;
    let mut img = GrayImage::from_pixel(side * (tw + GAP) - GAP, side * (th + GAP) - GAP, Luma([255]));
    for (i, sample) in samples.iter().take(GRID_SIDE * GRID_SIDE).enumerate() {
        if sample.len() != width {
            return Err(NetError::shape("sample width", width, sample.len()));
        }
        let ox = (i % GRID_SIDE) as u32 * (tw + GAP);
        let oy = (i / GRID_SIDE) as u32 * (th + GAP);
        for (p, &v) in sample.iter().enumerate() {
            let x = ox + p as u32 % tw;
            let y = oy + p as u32 / tw;
            let level = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            img.put_pixel(x, y, Luma([level]));
        }
    }
    Ok(img)
}

pub fn save_sample_grid<P: AsRef<Path>>(path: P, samples: &Matrix) -> Result<()> {
    render_grid(samples)?.save(path)?;
    Ok(())
}
