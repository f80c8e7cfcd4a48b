// ============================================================
// Layer 4 — Image Loading
// ============================================================
// Decodes an image file into the planar float layout the
// backbones expect: [3, crop, crop], RGB, ImageNet-normalised.
//
//   pixel' = (pixel / 255 - mean[c]) / std[c]
//
// Images are resized straight to crop x crop; no augmentation.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::path::Path;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy)]
pub struct ImageLoader {
    pub crop_size: usize,
}

impl ImageLoader {
    pub fn new(crop_size: usize) -> Self {
        Self { crop_size }
    }

    /// Planar CHW values for one image.
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path)
            .with_context(|| format!("Cannot decode image '{}'", path.display()))?;
        let size = self.crop_size as u32;
        let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        Ok(self.normalise(&rgb))
    }

    fn normalise(&self, rgb: &image::RgbImage) -> Vec<f32> {
        let plane = self.crop_size * self.crop_size;
        let mut out = vec![0.0f32; 3 * plane];
        for (i, px) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let v = px.0[c] as f32 / 255.0;
                out[c * plane + i] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        out
    }

    /// Values of an all-black image; stands in for unreadable files.
    pub fn blank(&self) -> Vec<f32> {
        let plane = self.crop_size * self.crop_size;
        (0..3)
            .flat_map(|c| std::iter::repeat(-IMAGENET_MEAN[c] / IMAGENET_STD[c]).take(plane))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_resizes_and_normalises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        image::RgbImage::from_pixel(10, 6, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let loader = ImageLoader::new(4);
        let v = loader.load(&path).unwrap();
        assert_eq!(v.len(), 3 * 16);
        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((v[0] - expected_r).abs() < 1e-5);
        let expected_b = (1.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((v[2 * 16 + 5] - expected_b).abs() < 1e-5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let loader = ImageLoader::new(4);
        assert!(loader.load(Path::new("/definitely/not/here.jpg")).is_err());
        assert_eq!(loader.blank().len(), 48);
    }
}
