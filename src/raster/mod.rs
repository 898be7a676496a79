//! In-memory raster grids and resampling for the carbon pipeline.

mod geotiff;
mod grid;
mod resample;

pub use geotiff::{read_geotiff, write_geotiff};
pub use grid::{GeoTransform, Raster};
pub use resample::{downsample_area, downsample_nearest, gaussian_blur, upsample_bicubic};
