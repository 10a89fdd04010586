use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Digest of a screenshot's decoded pixels. Falls back to hashing the raw bytes
/// when the frame cannot be decoded.
///
/// Every pixel is hashed: a change as small as a caret or a checkbox tick must
/// produce a different digest.
pub fn frame_digest(frame: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    match image::load_from_memory(frame) {
        Ok(img) => {
            let rgb = img.to_rgb8();
            rgb.dimensions().hash(&mut hasher);
            rgb.as_raw().hash(&mut hasher);
        }
        Err(e) => {
            tracing::debug!(error = %e, "digest falling back to raw bytes");
            frame.hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(img: image::RgbImage, format: image::ImageFormat) -> Vec<u8> {
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), format)
            .expect("encode");
        out
    }

    #[test]
    fn same_pixels_different_containers_match() {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30]));
        let png = encode(img.clone(), image::ImageFormat::Png);
        let bmp = encode(img, image::ImageFormat::Bmp);
        assert_ne!(png, bmp);
        assert_eq!(frame_digest(&png), frame_digest(&bmp));
    }

    #[test]
    fn single_pixel_change_is_detected() {
        let img = image::RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]));
        let mut changed = img.clone();
        changed.put_pixel(63, 63, image::Rgb([254, 255, 255]));
        assert_ne!(
            frame_digest(&encode(img, image::ImageFormat::Png)),
            frame_digest(&encode(changed, image::ImageFormat::Png))
        );
    }
}
