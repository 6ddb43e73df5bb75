//! Classification of cartoon-like images: icons, logos, illustrations.
//!
//! The classifier decides between lossy and lossless conversion for PNG
//! sources when converting to a next-generation format. It returns false
//! for banners, product images, and photos.
//!
//! The initial idea is from
//! <https://legacy.imagemagick.org/Usage/compare/#type_reallife>: an
//! illustration has few non-background colors covering most of the image,
//! a photograph has many.

use std::collections::HashMap;

use image::{DynamicImage, GenericImageView};

// Everything smaller is assumed to be a logo, everything bigger a photo,
// without reading a single pixel.
const MAX_LOGO_SIZE: usize = 20 * 1024;
const MIN_PHOTO_SIZE: usize = 1024 * 1024;

const MAX_COLORS: usize = 30_000;

/// Returns true if the encoded image is cartoon-like.
///
/// Images under 20 KiB classify as illustrations and images over 1 MiB as
/// photos on byte size alone; only the band in between pays for a decode
/// and a histogram scan. Undecodable images classify as photos.
pub fn is_illustration(data: &[u8]) -> bool {
    if data.len() < MAX_LOGO_SIZE {
        return true;
    }

    if data.len() > MIN_PHOTO_SIZE {
        return false;
    }

    match image::load_from_memory(data) {
        Ok(decoded) => classify(&decoded),
        Err(err) => {
            tracing::warn!(err = %err, "could not decode image for the illustration scan");
            false
        }
    }
}

fn classify(decoded: &DynamicImage) -> bool {
    let (width, height) = decoded.dimensions();

    // Scale large images down to 500 pixels wide for speed.
    let scaled;
    let decoded = if u64::from(width) * u64::from(height) > 500 * 500 {
        let aspect_ratio = width as f32 / height as f32;
        scaled = decoded.thumbnail_exact(500, ((500.0 / aspect_ratio) as u32).max(1));
        &scaled
    } else {
        decoded
    };

    let pixels = decoded.to_rgba8();

    let mut histogram: HashMap<[u8; 4], u32> = HashMap::new();
    for pixel in pixels.pixels() {
        *histogram.entry(pixel.0).or_insert(0) += 1;
    }

    let distinct_colors = histogram.len();
    if distinct_colors > MAX_COLORS {
        return false;
    }

    let mut colors: Vec<([u8; 4], u32)> = histogram.into_iter().collect();
    colors.sort_unstable_by(|a, b| b.1.cmp(&a.1));

    let total_pixels = (pixels.width() * pixels.height()) as f32;
    let ten_percent = (total_pixels * 0.1) as u32;
    let mut fifty_percent = (total_pixels * 0.5) as u32;

    let mut pixel_count = 0u32;
    let mut color_idx = 0usize;
    let mut is_background = false;
    let mut last_background_color = [0u8; 4];
    let mut colors_in_background = 0u32;
    let mut pixels_in_background = 0u32;

    for (idx, (color, count)) in colors.iter().enumerate() {
        color_idx = idx;
        if pixel_count > fifty_percent {
            break;
        }

        if idx == 0 {
            is_background = true;
            last_background_color = *color;
            pixels_in_background += count;
            colors_in_background += 1;
        } else if is_background {
            // Comparing colors to find out if it's still background or not.
            // This logic addresses backgrounds with more than one similar
            // color.
            if distance(*color, last_background_color) < 0.1 {
                last_background_color = *color;
                pixels_in_background += count;
                colors_in_background += 1;
            } else {
                is_background = false;
                if pixels_in_background < ten_percent {
                    // Too small to be a background; restart the walk
                    // counting those pixels as regular colors.
                    pixel_count = pixels_in_background;
                    colors_in_background = 0;
                    pixels_in_background = 0;
                } else {
                    pixel_count += count;
                    fifty_percent = ((total_pixels - pixels_in_background as f32) * 0.5) as u32;
                }
            }
        } else {
            pixel_count += count;
        }
    }

    // A fully-background image (one flat color) consumes no foreground
    // colors at all.
    let colors_in_fifty_pct = (color_idx as u32).saturating_sub(colors_in_background);

    colors_in_fifty_pct < 10
        || colors_in_fifty_pct as f32 / distinct_colors as f32 <= 0.02
}

// Sum of per-channel squared differences, each channel compared against both
// itself and the difference net of alpha, to tolerate alpha premultiplication.
fn distance(a: [u8; 4], b: [u8; 4]) -> f32 {
    let channel = |v: u8| f32::from(v) / 255.0;

    let alpha_diff = channel(a[3]) - channel(b[3]);
    let red_diff = channel(a[0]) - channel(b[0]);
    let green_diff = channel(a[1]) - channel(b[1]);
    let blue_diff = channel(a[2]) - channel(b[2]);

    f32::max(red_diff.powi(2), (red_diff - alpha_diff).powi(2))
        + f32::max(green_diff.powi(2), (green_diff - alpha_diff).powi(2))
        + f32::max(blue_diff.powi(2), (blue_diff - alpha_diff).powi(2))
}
