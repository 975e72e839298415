//! Image brightness checks for representative-frame selection.

use std::path::Path;

/// Mean luma (0-255) below which a frame counts as near-black.
pub const NEAR_BLACK_LUMINANCE: f64 = 10.0;

/// Error type for frame inspection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("image {0} has no pixels")]
    Empty(String),
}

/// Mean luminance of the image at `path` on the 0-255 scale.
pub fn mean_luminance(path: &Path) -> Result<f64, FrameError> {
    let img = image::open(path).map_err(|source| FrameError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    let luma = img.to_luma8();
    let count = u64::from(luma.width()) * u64::from(luma.height());
    if count == 0 {
        return Err(FrameError::Empty(path.display().to_string()));
    }
    let total: u64 = luma.pixels().map(|p| u64::from(p.0[0])).sum();
    Ok(total as f64 / count as f64)
}

pub fn is_near_black(luminance: f64) -> bool {
    luminance < NEAR_BLACK_LUMINANCE
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    #[test]
    fn black_frame_is_near_black() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.png");
        GrayImage::from_pixel(8, 8, Luma([3])).save(&path).unwrap();

        let lum = mean_luminance(&path).unwrap();
        assert!((lum - 3.0).abs() < 0.01);
        assert!(is_near_black(lum));
    }

    #[test]
    fn bright_frame_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])).save(&path).unwrap();

        let lum = mean_luminance(&path).unwrap();
        assert!(lum > 250.0);
        assert!(!is_near_black(lum));
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(mean_luminance(&path), Err(FrameError::Decode { .. })));
    }
}
