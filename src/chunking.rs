//! Padded tiling for neighborhood operations.
//!
//! A tile reads `padding` extra cells on each side (clamped at the raster
//! edge) so that focal windows near tile borders see the same neighbours
//! they would see on the full raster.

use crate::error::{PipelineError, Result};
use log::debug;

/// Default tile edge in cells when `tile_scale` is 1
pub const BASE_TILE_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct TileWindow {
    // Cells written to the output
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
    // Cells read from the input, including the halo
    pub read_row_start: usize,
    pub read_row_end: usize,
    pub read_col_start: usize,
    pub read_col_end: usize,
}

impl TileWindow {
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn cols(&self) -> usize {
        self.col_end - self.col_start
    }
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
    tile_size: usize,
    padding: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileGrid {
    pub fn new(rows: usize, cols: usize, tile_size: usize, padding: usize) -> Result<Self> {
        if tile_size == 0 {
            return Err(PipelineError::InvalidChunkSize(tile_size));
        }
        let tiles_x = cols.div_ceil(tile_size);
        let tiles_y = rows.div_ceil(tile_size);

        debug!(
            "TileGrid: {}x{} cells, tile_size={}, padding={} -> {}x{} tiles",
            cols, rows, tile_size, padding, tiles_x, tiles_y
        );

        Ok(Self {
            rows,
            cols,
            tile_size,
            padding,
            tiles_x,
            tiles_y,
        })
    }

    pub fn len(&self) -> usize {
        self.tiles_x * self.tiles_y
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window(&self, index: usize) -> TileWindow {
        let tile_row = index / self.tiles_x;
        let tile_col = index % self.tiles_x;

        let row_start = tile_row * self.tile_size;
        let col_start = tile_col * self.tile_size;
        let row_end = (row_start + self.tile_size).min(self.rows);
        let col_end = (col_start + self.tile_size).min(self.cols);

        TileWindow {
            row_start,
            row_end,
            col_start,
            col_end,
            read_row_start: row_start.saturating_sub(self.padding),
            read_row_end: (row_end + self.padding).min(self.rows),
            read_col_start: col_start.saturating_sub(self.padding),
            read_col_end: (col_end + self.padding).min(self.cols),
        }
    }

    pub fn windows(&self) -> Vec<TileWindow> {
        (0..self.len()).map(|i| self.window(i)).collect()
    }
}

/// Smaller tiles for larger `tile_scale`, mirroring how a higher scale trades
/// per-tile memory for more parallel work units
pub fn tile_size_for(tile_scale: u32) -> usize {
    let scale = tile_scale.max(1) as usize;
    (BASE_TILE_SIZE / scale).max(16)
}
