//! Spatial grid over keypoints for windowed candidate lookup.

use serde::{Deserialize, Serialize};

use super::KeyPoint;

/// Valid image region of undistorted keypoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl ImageBounds {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            min_x: 0.0,
            max_x: width,
            min_y: 0.0,
            max_y: height,
        }
    }

    /// Whether a pixel lies inside the region (upper edges exclusive).
    #[inline]
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= self.min_x && u < self.max_x && v >= self.min_y && v < self.max_y
    }
}

/// Spatial grid for fast feature lookup.
///
/// The image is divided into GRID_COLS × GRID_ROWS cells, each storing the
/// indices of the keypoints falling inside it. Keypoints outside the image
/// bounds are not indexed and can never be returned by an area query.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
    bounds: ImageBounds,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    /// Index `keypoints` by their (undistorted) image position.
    pub fn new(keypoints: &[KeyPoint], bounds: ImageBounds) -> Self {
        let width = (bounds.max_x - bounds.min_x).max(f64::EPSILON);
        let height = (bounds.max_y - bounds.min_y).max(f64::EPSILON);

        let mut grid = Self {
            cells: vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS],
            grid_element_width_inv: Self::GRID_COLS as f64 / width,
            grid_element_height_inv: Self::GRID_ROWS as f64 / height,
            bounds,
        };

        for (idx, kp) in keypoints.iter().enumerate() {
            if let Some((cx, cy)) = grid.cell_of(kp.x as f64, kp.y as f64) {
                grid.cells[cy * Self::GRID_COLS + cx].push(idx);
            }
        }

        grid
    }

    pub fn bounds(&self) -> &ImageBounds {
        &self.bounds
    }

    fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let cx = ((x - self.bounds.min_x) * self.grid_element_width_inv).floor();
        let cy = ((y - self.bounds.min_y) * self.grid_element_height_inv).floor();
        if cx < 0.0 || cy < 0.0 || cx >= Self::GRID_COLS as f64 || cy >= Self::GRID_ROWS as f64 {
            return None;
        }
        Some((cx as usize, cy as usize))
    }

    /// Indices of keypoints within the square window `|dx| < r`, `|dy| < r`
    /// around `(x, y)`, optionally restricted to octaves `[min_level, max_level]`.
    ///
    /// # Arguments
    /// * `keypoints` - The keypoints this grid was built from
    /// * `min_level` - Lowest accepted octave, `None` for unbounded
    /// * `max_level` - Highest accepted octave, `None` for unbounded
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let mut indices = Vec::new();

        let cols = Self::GRID_COLS as i64;
        let rows = Self::GRID_ROWS as i64;

        let min_cell_x = ((x - self.bounds.min_x - r) * self.grid_element_width_inv).floor() as i64;
        let max_cell_x = ((x - self.bounds.min_x + r) * self.grid_element_width_inv).ceil() as i64;
        let min_cell_y = ((y - self.bounds.min_y - r) * self.grid_element_height_inv).floor() as i64;
        let max_cell_y = ((y - self.bounds.min_y + r) * self.grid_element_height_inv).ceil() as i64;

        if min_cell_x >= cols || max_cell_x < 0 || min_cell_y >= rows || max_cell_y < 0 {
            return indices;
        }

        let min_cell_x = min_cell_x.max(0) as usize;
        let max_cell_x = max_cell_x.min(cols - 1) as usize;
        let min_cell_y = min_cell_y.max(0) as usize;
        let max_cell_y = max_cell_y.min(rows - 1) as usize;

        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &idx in &self.cells[cell_y * Self::GRID_COLS + cell_x] {
                    let kp = &keypoints[idx];
                    if min_level.is_some_and(|min| kp.octave < min)
                        || max_level.is_some_and(|max| kp.octave > max)
                    {
                        continue;
                    }

                    let dx = kp.x as f64 - x;
                    let dy = kp.y as f64 - y;
                    if dx.abs() < r && dy.abs() < r {
                        indices.push(idx);
                    }
                }
            }
        }

        indices
    }
}
