use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::DynamicImage;

use super::error::MaterializeError;

/// Decode fetched bytes in whatever raster format the host served.
pub fn decode(location: &str, bytes: &[u8]) -> Result<DynamicImage, MaterializeError> {
    image::load_from_memory(bytes).map_err(|source| MaterializeError::Decode {
        location: location.to_string(),
        source,
    })
}

/// Write `image` to `path` as a PNG with the strongest compression.
///
/// Creates the file; the caller owns removing it if this fails part way.
pub fn save_optimized_png(image: &DynamicImage, path: &Path) -> Result<(), MaterializeError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let encoder =
        PngEncoder::new_with_quality(&mut writer, CompressionType::Best, FilterType::Adaptive);
    image
        .write_with_encoder(encoder)
        .map_err(|source| MaterializeError::Save {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush()?;
    Ok(())
}

/// A tiny valid PNG for tests.
#[cfg(test)]
pub(crate) fn test_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 3, image::Rgb([200, 40, 90]));
    let mut buf = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}
