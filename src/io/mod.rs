//! Input and output: boundaries, rasters, catalogs, remote tiles, results

pub mod boundary;
pub mod catalog;
pub mod raster;
pub mod remote;
pub mod results;

pub use boundary::{Boundary, BoundaryResolver, BoundarySource, LocalVectorSource, RemoteVectorSource};
pub use catalog::{ImageCatalog, LocalCatalog, Scene};
pub use raster::{read_geotiff, write_geotiff, GeoTiffOptions};
pub use remote::HttpTileSource;
pub use results::{ResultWriter, SummaryMetrics};
