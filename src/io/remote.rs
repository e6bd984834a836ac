use crate::core::tiling::{TileRequest, TileSource};
use crate::io::raster::read_geotiff;
use crate::types::{BiomassError, BiomassResult};
use ndarray::Array2;
use std::io::{Read, Write};
use std::time::Duration;

/// Tile source backed by a remote raster export service.
///
/// Each request is a GET with `image`, `band`, `bbox`, `scale` and
/// `format=GEO_TIFF` query parameters. The service answers with a GeoTIFF,
/// possibly gzip-compressed or wrapped in a zip archive.
#[derive(Debug, Clone)]
pub struct HttpTileSource {
    client: reqwest::blocking::Client,
    pub endpoint: String,
    pub image: String,
    pub band: String,
}

impl HttpTileSource {
    pub fn new(
        endpoint: impl Into<String>,
        image: impl Into<String>,
        band: impl Into<String>,
        timeout: Duration,
    ) -> BiomassResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("biomap/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            image: image.into(),
            band: band.into(),
        })
    }

    /// Query parameters for one tile
    pub fn query(&self, request: &TileRequest) -> Vec<(&'static str, String)> {
        let r = &request.region;
        vec![
            ("image", self.image.clone()),
            ("band", self.band.clone()),
            ("bbox", format!("{},{},{},{}", r.min_lon, r.min_lat, r.max_lon, r.max_lat)),
            ("scale", format!("{}", request.scale_m)),
            ("format", "GEO_TIFF".to_string()),
        ]
    }

    fn download(&self, request: &TileRequest) -> BiomassResult<Vec<u8>> {
        let response = self.client.get(&self.endpoint).query(&self.query(request)).send()?;

        if !response.status().is_success() {
            return Err(BiomassError::Processing(format!(
                "HTTP {} {} for tile ({}, {})",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                request.row,
                request.col
            )));
        }

        let content = response.bytes()?;
        if content.is_empty() {
            return Err(BiomassError::InvalidFormat("empty tile response".to_string()));
        }
        log::debug!("Tile ({}, {}): downloaded {} bytes", request.row, request.col, content.len());
        Ok(content.to_vec())
    }
}

impl TileSource for HttpTileSource {
    fn fetch(&self, request: &TileRequest) -> BiomassResult<Array2<f32>> {
        let content = self.download(request)?;
        decode_tile(&content)
    }
}

/// Decode a raw, gzip or zip wrapped GeoTIFF into its first band
pub fn decode_tile(content: &[u8]) -> BiomassResult<Array2<f32>> {
    let tiff = if is_gzip_content(content) {
        gunzip(content)?
    } else if is_zip_content(content) {
        extract_tiff_from_zip(content)?
    } else {
        content.to_vec()
    };

    let mut file = tempfile::Builder::new().prefix("tile").suffix(".tif").tempfile()?;
    file.write_all(&tiff)?;
    file.flush()?;

    Ok(read_geotiff(file.path(), 1)?.data)
}

/// Check if content is gzip format by examining magic bytes
pub(crate) fn is_gzip_content(content: &[u8]) -> bool {
    content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B
}

/// Check if content is ZIP format by examining magic bytes
pub(crate) fn is_zip_content(content: &[u8]) -> bool {
    content.len() >= 4 && content[0..4] == [0x50, 0x4B, 0x03, 0x04]
}

fn gunzip(data: &[u8]) -> BiomassResult<Vec<u8>> {
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    if decompressed.is_empty() {
        return Err(BiomassError::InvalidFormat("decompressed tile is empty".to_string()));
    }
    log::debug!("Decompressed {} bytes", decompressed.len());
    Ok(decompressed)
}

fn extract_tiff_from_zip(zip_data: &[u8]) -> BiomassResult<Vec<u8>> {
    use std::io::Cursor;
    use zip::ZipArchive;

    let mut archive = ZipArchive::new(Cursor::new(zip_data))
        .map_err(|e| BiomassError::InvalidFormat(format!("Failed to open ZIP archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| BiomassError::InvalidFormat(format!("Failed to read ZIP entry {}: {}", i, e)))?;

        let name = file.name().to_ascii_lowercase();
        if name.ends_with(".tif") || name.ends_with(".tiff") {
            log::debug!("Extracting {} from tile archive", file.name());
            let mut buffer = Vec::new();
            std::io::copy(&mut file, &mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(BiomassError::InvalidFormat("No GeoTIFF found in ZIP archive".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::write_geotiff;
    use crate::types::{BoundingBox, GeoRaster, GeoTransform, EPSG_WGS84};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use ndarray::array;

    fn sample_tiff() -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.tif");
        let transform = GeoTransform::north_up(&BoundingBox::new(107.0, 107.2, 13.8, 14.0), 0.1);
        let raster = GeoRaster::new(array![[1.0f32, 2.0], [3.0, 4.0]], transform, EPSG_WGS84);
        write_geotiff(&raster, &path, None).unwrap();
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn test_magic_bytes() {
        assert!(is_gzip_content(&[0x1F, 0x8B, 0x08]));
        assert!(is_zip_content(b"PK\x03\x04rest"));
        assert!(!is_zip_content(b"II*\x00"));
    }

    #[test]
    fn test_decode_raw_and_gzip_tiles() {
        let tiff = sample_tiff();
        assert_eq!(decode_tile(&tiff).unwrap(), array![[1.0f32, 2.0], [3.0, 4.0]]);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tiff).unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decode_tile(&gz).unwrap()[[1, 1]], 4.0);
    }

    #[test]
    fn test_decode_zipped_tile() {
        let tiff = sample_tiff();
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buffer);
            zip.start_file("export/B8.tif", zip::write::FileOptions::default()).unwrap();
            zip.write_all(&tiff).unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(decode_tile(buffer.get_ref()).unwrap()[[0, 1]], 2.0);
    }

    #[test]
    fn test_query_parameters() {
        let source =
            HttpTileSource::new("https://tiles.example.org/export", "s2_median", "B8", Duration::from_secs(5)).unwrap();
        let request = TileRequest {
            row: 0,
            col: 1,
            region: BoundingBox::new(107.5, 108.0, 13.5, 14.0),
            scale_m: 90.0,
        };

        let query = source.query(&request);
        assert_eq!(query[2], ("bbox", "107.5,13.5,108,14".to_string()));
        assert_eq!(query[3], ("scale", "90".to_string()));
        assert_eq!(query[4], ("format", "GEO_TIFF".to_string()));
    }
}
