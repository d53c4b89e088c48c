//! Spot label masks.

use std::collections::BTreeMap;
use std::path::Path;

use image::{ImageBuffer, Luma};

use crate::base::SpotId;

/// Per-pixel label image: 0 is background, any other value a spot ID.
pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

#[derive(Debug)]
pub enum MaskError {
    /// A label does not fit into the 16-bit on-disk format.
    LabelOverflow(u32),
    Image(image::ImageError),
}

impl std::fmt::Display for MaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LabelOverflow(label) => {
                write!(f, "label {} does not fit into a 16-bit mask file", label)
            }
            Self::Image(e) => write!(f, "mask image error: {}", e),
        }
    }
}

impl std::error::Error for MaskError {}

impl From<image::ImageError> for MaskError {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

/// Spot label mask with a cached pixel index per spot.
#[derive(Debug, Clone)]
pub struct LabelMask {
    labels: LabelImage,
    /// Linear pixel indices (`y * width + x`) of every labelled spot.
    pixels: BTreeMap<SpotId, Vec<usize>>,
}

impl LabelMask {
    pub fn new(labels: LabelImage) -> Self {
        let width = labels.width() as usize;
        let mut pixels: BTreeMap<SpotId, Vec<usize>> = BTreeMap::new();
        for (x, y, p) in labels.enumerate_pixels() {
            if p.0[0] != 0 {
                pixels
                    .entry(SpotId(p.0[0]))
                    .or_default()
                    .push(y as usize * width + x as usize);
            }
        }
        Self { labels, pixels }
    }

    pub fn labels(&self) -> &LabelImage {
        &self.labels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.labels.dimensions()
    }

    /// Spots with at least one pixel, in ascending ID order.
    pub fn spot_ids(&self) -> impl Iterator<Item = SpotId> + '_ {
        self.pixels.keys().copied()
    }

    pub fn n_spots(&self) -> usize {
        self.pixels.len()
    }

    /// Linear pixel indices of a spot; `None` when the spot has no pixels.
    pub fn pixels(&self, spot: SpotId) -> Option<&[usize]> {
        self.pixels.get(&spot).map(Vec::as_slice)
    }

    pub fn pixel_count(&self, spot: SpotId) -> usize {
        self.pixels.get(&spot).map_or(0, Vec::len)
    }

    /// Largest spot ID present in the mask.
    pub fn max_label(&self) -> u32 {
        self.pixels.keys().next_back().map_or(0, |s| s.0)
    }

    /// Pixel centroid `[x, y]` of a spot.
    pub fn centroid(&self, spot: SpotId) -> Option<[f64; 2]> {
        let px = self.pixels.get(&spot)?;
        let width = self.labels.width() as usize;
        let (mut sx, mut sy) = (0.0f64, 0.0f64);
        for &i in px {
            sx += (i % width) as f64;
            sy += (i / width) as f64;
        }
        let n = px.len() as f64;
        Some([sx / n, sy / n])
    }

    /// True when `(x, y)` is labelled and touches a pixel with another label.
    pub fn is_boundary(&self, x: u32, y: u32) -> bool {
        let (w, h) = self.labels.dimensions();
        let label = self.labels.get_pixel(x, y).0[0];
        if label == 0 {
            return false;
        }
        let neighbors = [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)];
        neighbors.iter().any(|&(dx, dy)| {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                return true;
            }
            self.labels.get_pixel(nx as u32, ny as u32).0[0] != label
        })
    }

    /// Save as a 16-bit grayscale PNG.
    pub fn save_png(&self, path: &Path) -> Result<(), MaskError> {
        let (w, h) = self.labels.dimensions();
        let mut out = ImageBuffer::<Luma<u16>, Vec<u16>>::new(w, h);
        for (x, y, p) in self.labels.enumerate_pixels() {
            let v = u16::try_from(p.0[0]).map_err(|_| MaskError::LabelOverflow(p.0[0]))?;
            out.put_pixel(x, y, Luma([v]));
        }
        out.save(path)?;
        Ok(())
    }

    /// Load a mask previously written by [`LabelMask::save_png`].
    pub fn load_png(path: &Path) -> Result<Self, MaskError> {
        let img = image::open(path)?.to_luma16();
        let (w, h) = img.dimensions();
        let labels = LabelImage::from_fn(w, h, |x, y| Luma([img.get_pixel(x, y).0[0] as u32]));
        Ok(Self::new(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_mask() -> LabelMask {
        // 4x3 image, spot 1 at left column, spot 3 at (2..4, 1)
        let mut labels = LabelImage::new(4, 3);
        labels.put_pixel(0, 0, Luma([1]));
        labels.put_pixel(0, 1, Luma([1]));
        labels.put_pixel(2, 1, Luma([3]));
        labels.put_pixel(3, 1, Luma([3]));
        LabelMask::new(labels)
    }

    #[test]
    fn indexes_spots_and_skips_missing_labels() {
        let mask = small_mask();
        assert_eq!(mask.spot_ids().collect::<Vec<_>>(), vec![SpotId(1), SpotId(3)]);
        assert_eq!(mask.pixel_count(SpotId(1)), 2);
        assert_eq!(mask.pixel_count(SpotId(2)), 0);
        assert!(mask.pixels(SpotId(2)).is_none());
        assert_eq!(mask.pixels(SpotId(3)).unwrap(), &[6, 7]);
        assert_eq!(mask.max_label(), 3);
    }

    #[test]
    fn centroid_and_boundary() {
        let mask = small_mask();
        assert_eq!(mask.centroid(SpotId(3)), Some([2.5, 1.0]));
        assert!(mask.is_boundary(2, 1));
        assert!(!mask.is_boundary(1, 1));
    }
}
