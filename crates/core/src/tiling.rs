//! Tiled inference: grid geometry, per-tile model calls and compositing.
//!
//! Large pages are split into square tiles that overlap their neighbours by
//! `overlap` pixels on each interior edge. Each tile goes through the model's
//! whole-image pass and is drawn into the destination at `origin × scale`.
//! Tiles are drawn in row-major order without blending, so in overlap regions
//! the tile drawn last wins.

use image::{imageops, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{UpscaleError, UpscaleResult};
use crate::model::InferenceModel;

pub const DEFAULT_TILE_SIZE: u32 = 240;

/// Tile overlap in pixels per side; hides edge artifacts between tiles.
pub const DEFAULT_TILE_OVERLAP: u32 = 16;

/// Images with at least this many pixels (1024×1024) go through the tiled path.
pub const DEFAULT_PIXEL_THRESHOLD: u64 = 1_048_576;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TileConfig {
    pub tile_size: u32,
    pub overlap: u32,
    pub pixel_threshold: u64,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_TILE_OVERLAP,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
        }
    }
}

impl TileConfig {
    pub fn validate(&self) -> UpscaleResult<()> {
        if self.tile_size <= self.overlap * 2 {
            return Err(UpscaleError::InvalidTileConfig(format!(
                "tile_size ({}) is too small for overlap ({})",
                self.tile_size, self.overlap
            )));
        }
        Ok(())
    }

    /// Distance between the origins of neighbouring tiles.
    pub fn step(&self) -> u32 {
        self.tile_size - self.overlap * 2
    }
}

/// Source rectangle of one tile, in input pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub row: u32,
    pub col: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub tile_size: u32,
    pub overlap: u32,
    pub rows: u32,
    pub cols: u32,
}

impl TileGrid {
    pub fn for_dimensions(width: u32, height: u32, config: &TileConfig) -> UpscaleResult<Self> {
        config.validate()?;
        Ok(Self {
            tile_size: config.tile_size,
            overlap: config.overlap,
            rows: tiles_along(height, config),
            cols: tiles_along(width, config),
        })
    }

    pub fn step(&self) -> u32 {
        self.tile_size - self.overlap * 2
    }

    pub fn len(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tile rectangles in row-major order, clipped to the image.
    pub fn tiles(&self, width: u32, height: u32) -> impl Iterator<Item = TileRect> + '_ {
        let step = self.step();
        (0..self.rows).flat_map(move |row| {
            (0..self.cols).filter_map(move |col| {
                let x = col * step;
                let y = row * step;
                let tile_w = self.tile_size.min(width.saturating_sub(x));
                let tile_h = self.tile_size.min(height.saturating_sub(y));
                if tile_w == 0 || tile_h == 0 {
                    return None;
                }
                Some(TileRect {
                    row,
                    col,
                    x,
                    y,
                    width: tile_w,
                    height: tile_h,
                })
            })
        })
    }
}

/// `ceil((dim - 2·overlap) / step)`, at least one tile.
fn tiles_along(dim: u32, config: &TileConfig) -> u32 {
    dim.saturating_sub(config.overlap * 2)
        .div_ceil(config.step())
        .max(1)
}

/// Chooses between one whole-image pass and tiled inference.
#[derive(Debug, Clone)]
pub struct TilingEngine {
    config: TileConfig,
}

impl TilingEngine {
    pub fn new(config: TileConfig) -> UpscaleResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn needs_tiling(&self, width: u32, height: u32) -> bool {
        u64::from(width) * u64::from(height) >= self.config.pixel_threshold
    }

    pub fn upscale(&self, model: &dyn InferenceModel, image: &RgbaImage) -> UpscaleResult<RgbaImage> {
        let (width, height) = image.dimensions();
        if self.needs_tiling(width, height) {
            self.upscale_tiled(model, image)
        } else {
            infer_whole(model, image)
        }
    }

    pub fn upscale_tiled(&self, model: &dyn InferenceModel, image: &RgbaImage) -> UpscaleResult<RgbaImage> {
        let (width, height) = image.dimensions();
        let scale = model.scale();
        let grid = TileGrid::for_dimensions(width, height, &self.config)?;

        let out_w = width.checked_mul(scale);
        let out_h = height.checked_mul(scale);
        let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
            return Err(UpscaleError::Allocation {
                width: width.saturating_mul(scale),
                height: height.saturating_mul(scale),
            });
        };
        let mut output = allocate_canvas(out_w, out_h)?;

        debug!(
            width,
            height,
            scale,
            rows = grid.rows,
            cols = grid.cols,
            tile_size = grid.tile_size,
            overlap = grid.overlap,
            "Starting tiled inference"
        );

        for tile in grid.tiles(width, height) {
            let input = imageops::crop_imm(image, tile.x, tile.y, tile.width, tile.height).to_image();
            let upscaled = infer_whole(model, &input).map_err(|err| match err {
                UpscaleError::Inference(msg) => UpscaleError::Inference(format!(
                    "tile r{}c{} at ({}, {}): {msg}",
                    tile.row, tile.col, tile.x, tile.y
                )),
                other => other,
            })?;

            imageops::replace(
                &mut output,
                &upscaled,
                i64::from(tile.x * scale),
                i64::from(tile.y * scale),
            );

            debug!(row = tile.row, col = tile.col, x = tile.x, y = tile.y, "Tile composited");
        }

        Ok(output)
    }
}

/// Runs the model once and checks the output is exactly `input × scale`.
fn infer_whole(model: &dyn InferenceModel, image: &RgbaImage) -> UpscaleResult<RgbaImage> {
    let (width, height) = image.dimensions();
    let scale = model.scale();
    let output = model.infer(image)?;

    let expected = (width * scale, height * scale);
    if output.dimensions() != expected {
        return Err(UpscaleError::Inference(format!(
            "model returned {}x{} for {width}x{height} input at {scale}x (expected {}x{})",
            output.width(),
            output.height(),
            expected.0,
            expected.1
        )));
    }
    Ok(output)
}

/// Zeroed (fully transparent) RGBA buffer, reporting allocation failure instead of aborting.
pub(crate) fn allocate_canvas(width: u32, height: u32) -> UpscaleResult<RgbaImage> {
    let alloc_err = || UpscaleError::Allocation { width, height };
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(4))
        .ok_or_else(alloc_err)?;

    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| alloc_err())?;
    buf.resize(len, 0);
    RgbaImage::from_raw(width, height, buf).ok_or_else(alloc_err)
}
