//! Codec and quality selection.
//!
//! Pure decision layer mapping source metadata and client signals to an
//! output container and ImageMagick quality arguments. Nothing in here has
//! side effects, which keeps the whole policy testable without a subprocess.

use mediatype::{names, MediaType, MediaTypeBuf};

use crate::{
    error::Error,
    img::{ImageInfo, Quality, TransformationConfig},
};

/// MIME type of the WebP output.
pub const WEBP_MIME: &str = "image/webp";
/// MIME type of the AVIF output.
pub const AVIF_MIME: &str = "image/avif";
/// MIME type of the JPEG XL output.
pub const JXL_MIME: &str = "image/jxl";

const IMAGE_WEBP: MediaType = MediaType::new(names::IMAGE, names::WEBP);
const IMAGE_AVIF: MediaType = MediaType::new(names::IMAGE, names::AVIF);

/// The WebP codec cannot encode either axis at 16383 pixels or above.
const MAX_WEBP_WIDTH: u32 = 16383;
const MAX_WEBP_HEIGHT: u32 = 16383;

/// Maximum size in pixels of a result image that will be converted to AVIF.
/// Encoding to AVIF consumes a lot of memory and CPU time.
const MAX_AVIF_TARGET_SIZE: u64 = 2000 * 2000;

const MAX_JXL_LOSSY_TARGET_SIZE: u64 = 1000 * 1000;

/// Estimated dimensions of the transformation result, used to budget codec
/// eligibility. Both zero when the source has not been probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetSize {
    /// Estimated output width in pixels.
    pub width: u32,
    /// Estimated output height in pixels.
    pub height: u32,
}

/// Parses a resize size string: `WIDTHxHEIGHT` with either dimension
/// optional, e.g. `300`, `x200`, `300x200`. Both dimensions empty is
/// rejected.
pub fn parse_resize_size(size: &str) -> Result<(Option<u32>, Option<u32>), Error> {
    let (w, h) = match size.split_once('x') {
        Some(parts) => parts,
        None => (size, ""),
    };

    if h.contains('x')
        || !w.bytes().all(|b| b.is_ascii_digit())
        || !h.bytes().all(|b| b.is_ascii_digit())
        || (w.is_empty() && h.is_empty())
    {
        return Err(bad_size(size));
    }

    let width = if w.is_empty() {
        None
    } else {
        Some(w.parse().map_err(|_| bad_size(size))?)
    };
    let height = if h.is_empty() {
        None
    } else {
        Some(h.parse().map_err(|_| bad_size(size))?)
    };

    Ok((width, height))
}

/// Parses a fit size string: `WIDTHxHEIGHT` with both dimensions required.
pub fn parse_fit_size(size: &str) -> Result<(u32, u32), Error> {
    let (w, h) = size.split_once('x').ok_or_else(|| bad_size(size))?;

    if w.is_empty()
        || h.is_empty()
        || h.contains('x')
        || !w.bytes().all(|b| b.is_ascii_digit())
        || !h.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(bad_size(size));
    }

    let width = w.parse().map_err(|_| bad_size(size))?;
    let height = h.parse().map_err(|_| bad_size(size))?;
    Ok((width, height))
}

fn bad_size(size: &str) -> Error {
    Error::BadRequest(format!(
        "size param should be in format WxH, but got [{size}]"
    ))
}

/// Estimates the result size of a resize from the source dimensions and the
/// size string.
///
/// When only one dimension is given the other follows the aspect ratio.
/// When both are given the width drives the estimate; the actual convert run
/// fits within the box either way. Returns zeros when the source has not
/// been probed.
pub fn resize_target(source: &ImageInfo, size: &str) -> Result<TargetSize, Error> {
    let (width, height) = parse_resize_size(size)?;

    if source.width == 0 || source.height == 0 {
        return Ok(TargetSize::default());
    }

    let mut w = width.unwrap_or(0);
    let mut h = if w == 0 { height.unwrap_or(0) } else { 0 };

    let aspect_ratio = source.width as f32 / source.height as f32;
    if w > 0 {
        h = (w as f32 / aspect_ratio) as u32;
    } else if h > 0 {
        w = (h as f32 * aspect_ratio) as u32;
    }

    Ok(TargetSize {
        width: w,
        height: h,
    })
}

/// The result size of a fit is the size string itself.
pub fn fit_target(size: &str) -> Result<TargetSize, Error> {
    let (width, height) = parse_fit_size(size)?;
    Ok(TargetSize { width, height })
}

/// Picks the output container for a transformation.
///
/// Returns the convert output argument (e.g. `webp:-`) and the response MIME
/// type. An empty MIME means the engine keeps the source container and the
/// caller leaves Content-Type to downstream sniffing.
///
/// The priorities encode two facts about the codecs: JPEG XL is superior for
/// illustrations at any size, AVIF is superior for mid-size photographs but
/// expensive to encode, and WebP is the universal fallback within its
/// per-axis pixel limit.
pub fn output_format(
    source: &ImageInfo,
    target: &TargetSize,
    supported_formats: &[MediaTypeBuf],
) -> (&'static str, &'static str) {
    let mut webp = false;
    let mut avif = false;
    let mut jxl = false;

    let target_size = target.width as u64 * target.height as u64;

    for format in supported_formats {
        if is_mime(format, &IMAGE_WEBP)
            && source.width < MAX_WEBP_WIDTH
            && source.height < MAX_WEBP_HEIGHT
        {
            webp = true;
        }

        if is_mime(format, &IMAGE_AVIF)
            && source.format != "GIF"
            && target_size < MAX_AVIF_TARGET_SIZE
            && target_size != 0
        {
            avif = true;
        }

        if is_jxl(format)
            && source.format != "GIF"
            && (source.illustration || target_size < MAX_JXL_LOSSY_TARGET_SIZE)
        {
            jxl = true;
        }
    }

    if (source.illustration && jxl) || (jxl && !avif) {
        ("jxl:-", JXL_MIME)
    } else if avif && !source.illustration {
        ("avif:-", AVIF_MIME)
    } else if webp {
        ("webp:-", WEBP_MIME)
    } else {
        ("-", "")
    }
}

// Parameters on the Accept entry (e.g. a q-value) do not disqualify it.
fn is_mime(format: &MediaTypeBuf, mime: &MediaType<'_>) -> bool {
    format.ty() == mime.ty && format.subty() == mime.subty
}

// image/jxl has no entry in the IANA-generated name table, so the check is
// spelled out.
fn is_jxl(format: &MediaTypeBuf) -> bool {
    format.ty() == names::IMAGE && format.subty().as_str().eq_ignore_ascii_case("jxl")
}

/// Computes the `-quality` arguments for a transformation.
///
/// Illustrations take the lossless path and get no quality flag. AVIF and
/// JPEG XL outputs bucket the source quality; unmarked sources fall back to
/// the house default of 82. The request-level quality then shaves 10 or 20
/// off the lossy value.
pub fn quality_args(
    source: &ImageInfo,
    config: &TransformationConfig,
    output_mime: &str,
) -> Vec<String> {
    tracing::debug!(
        id = %config.src.id,
        source_quality = source.quality,
        quality = ?config.quality,
        output_mime,
        "selecting quality for the image"
    );

    if source.illustration {
        return Vec::new();
    }

    let mut quality: i32 = if output_mime == AVIF_MIME {
        match source.quality {
            q if q > 85 => 70,
            q if q > 75 => 60,
            _ => 50,
        }
    } else if output_mime == JXL_MIME {
        match source.quality {
            q if q > 85 => 82,
            q if q > 75 => 72,
            _ => 62,
        }
    } else if source.quality == 100 {
        // Treat unmarked sources as pristine and apply the house default.
        82
    } else if config.quality != Quality::Default {
        i32::from(source.quality)
    } else {
        0
    };

    if quality == 0 {
        return Vec::new();
    }

    if quality != 100 {
        match config.quality {
            Quality::Low => quality -= 10,
            Quality::Lower => quality -= 20,
            Quality::Default => {}
        }
    }

    let quality = quality.max(1);

    vec!["-quality".to_string(), quality.to_string()]
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::img::{Image, Transformation};

    fn info(format: &str, quality: u8, width: u32, height: u32) -> ImageInfo {
        ImageInfo {
            format: format.to_string(),
            quality,
            opaque: true,
            width,
            height,
            size: 50 * 1024,
            illustration: false,
        }
    }

    fn formats(mimes: &[&str]) -> Vec<MediaTypeBuf> {
        mimes.iter().map(|m| m.parse().unwrap()).collect()
    }

    fn config(quality: Quality) -> TransformationConfig {
        TransformationConfig {
            src: Image {
                id: "test".to_string(),
                data: Bytes::new(),
                mime_type: String::new(),
                content_encoding: String::new(),
            },
            supported_formats: Vec::new(),
            quality,
            trim_border: false,
            transformation: Transformation::Optimise,
        }
    }

    #[test]
    fn resize_size_grammar() {
        assert_eq!(parse_resize_size("300").unwrap(), (Some(300), None));
        assert_eq!(parse_resize_size("x200").unwrap(), (None, Some(200)));
        assert_eq!(parse_resize_size("300x200").unwrap(), (Some(300), Some(200)));
        assert_eq!(parse_resize_size("300x").unwrap(), (Some(300), None));

        assert!(parse_resize_size("").is_err());
        assert!(parse_resize_size("x").is_err());
        assert!(parse_resize_size("300xx").is_err());
        assert!(parse_resize_size("300x200x100").is_err());
        assert!(parse_resize_size("a00").is_err());
        assert!(parse_resize_size("-300").is_err());
    }

    #[test]
    fn fit_size_grammar() {
        assert_eq!(parse_fit_size("300x200").unwrap(), (300, 200));

        assert!(parse_fit_size("300").is_err());
        assert!(parse_fit_size("300x").is_err());
        assert!(parse_fit_size("x200").is_err());
        assert!(parse_fit_size("300x200x100").is_err());
    }

    #[test]
    fn resize_target_follows_aspect_ratio() {
        let source = info("JPEG", 85, 800, 600);

        // Width given: height follows the aspect ratio.
        let target = resize_target(&source, "300").unwrap();
        assert_eq!(target, TargetSize { width: 300, height: 225 });

        // Height given: width follows the aspect ratio.
        let target = resize_target(&source, "x300").unwrap();
        assert_eq!(target, TargetSize { width: 400, height: 300 });

        // Both given: the width drives the estimate.
        let target = resize_target(&source, "300x200").unwrap();
        assert_eq!(target, TargetSize { width: 300, height: 225 });
    }

    #[test]
    fn resize_target_unprobed_source() {
        let target = resize_target(&info("JPEG", 85, 0, 0), "300").unwrap();
        assert_eq!(target, TargetSize::default());
    }

    #[test]
    fn fit_target_is_the_size_string() {
        assert_eq!(
            fit_target("300x200").unwrap(),
            TargetSize { width: 300, height: 200 }
        );
    }

    #[test]
    fn webp_when_only_webp_accepted() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(&source, &target, &formats(&["image/webp"]));
        assert_eq!(out, ("webp:-", "image/webp"));
    }

    #[test]
    fn webp_disabled_at_the_axis_limit() {
        let target = TargetSize { width: 300, height: 225 };
        let accept = formats(&["image/webp"]);

        let wide = info("JPEG", 85, 16383, 600);
        assert_eq!(output_format(&wide, &target, &accept), ("-", ""));

        let tall = info("JPEG", 85, 800, 16383);
        assert_eq!(output_format(&tall, &target, &accept), ("-", ""));

        let just_under = info("JPEG", 85, 16382, 16382);
        assert_eq!(
            output_format(&just_under, &target, &accept),
            ("webp:-", "image/webp")
        );
    }

    #[test]
    fn avif_beats_webp_for_photographs() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(&source, &target, &formats(&["image/webp", "image/avif"]));
        assert_eq!(out, ("avif:-", "image/avif"));
    }

    #[test]
    fn avif_disabled_outside_the_target_budget() {
        let source = info("JPEG", 85, 4000, 4000);
        let accept = formats(&["image/webp", "image/avif"]);

        // At the pixel budget.
        let at_limit = TargetSize { width: 2000, height: 2000 };
        assert_eq!(
            output_format(&source, &at_limit, &accept),
            ("webp:-", "image/webp")
        );

        // Unknown target.
        let unknown = TargetSize::default();
        assert_eq!(
            output_format(&source, &unknown, &accept),
            ("webp:-", "image/webp")
        );

        let within = TargetSize { width: 1999, height: 2000 };
        assert_eq!(
            output_format(&source, &within, &accept),
            ("avif:-", "image/avif")
        );
    }

    #[test]
    fn gif_never_converts_to_avif_or_jxl() {
        let source = info("GIF", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(
            &source,
            &target,
            &formats(&["image/webp", "image/avif", "image/jxl"]),
        );
        assert_eq!(out, ("webp:-", "image/webp"));
    }

    #[test]
    fn jxl_wins_for_illustrations() {
        let mut source = info("PNG", 100, 800, 600);
        source.illustration = true;
        let target = TargetSize { width: 800, height: 600 };

        let out = output_format(
            &source,
            &target,
            &formats(&["image/webp", "image/avif", "image/jxl"]),
        );
        assert_eq!(out, ("jxl:-", "image/jxl"));
    }

    #[test]
    fn avif_beats_jxl_for_small_photographs() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(&source, &target, &formats(&["image/avif", "image/jxl"]));
        assert_eq!(out, ("avif:-", "image/avif"));
    }

    #[test]
    fn jxl_when_avif_ineligible() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(&source, &target, &formats(&["image/webp", "image/jxl"]));
        assert_eq!(out, ("jxl:-", "image/jxl"));
    }

    #[test]
    fn passthrough_when_nothing_accepted() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        assert_eq!(output_format(&source, &target, &[]), ("-", ""));
    }

    #[test]
    fn avif_quality_buckets() {
        let cfg = config(Quality::Default);
        for (source_quality, expected) in [(90, "70"), (80, "60"), (70, "50")] {
            let source = info("JPEG", source_quality, 800, 600);
            assert_eq!(
                quality_args(&source, &cfg, AVIF_MIME),
                vec!["-quality", expected]
            );
        }
    }

    #[test]
    fn jxl_quality_buckets() {
        let cfg = config(Quality::Default);
        for (source_quality, expected) in [(90, "82"), (80, "72"), (70, "62")] {
            let source = info("JPEG", source_quality, 800, 600);
            assert_eq!(
                quality_args(&source, &cfg, JXL_MIME),
                vec!["-quality", expected]
            );
        }
    }

    #[test]
    fn unmarked_source_gets_the_house_default() {
        let source = info("JPEG", 100, 800, 600);
        assert_eq!(
            quality_args(&source, &config(Quality::Default), WEBP_MIME),
            vec!["-quality", "82"]
        );
    }

    #[test]
    fn marked_source_keeps_quality_only_under_reduction() {
        let source = info("JPEG", 80, 800, 600);

        // DEFAULT carries no flag at all for marked sources.
        assert!(quality_args(&source, &config(Quality::Default), WEBP_MIME).is_empty());

        assert_eq!(
            quality_args(&source, &config(Quality::Low), WEBP_MIME),
            vec!["-quality", "70"]
        );
        assert_eq!(
            quality_args(&source, &config(Quality::Lower), WEBP_MIME),
            vec!["-quality", "60"]
        );
    }

    #[test]
    fn reduction_never_goes_below_one() {
        let source = info("JPEG", 15, 800, 600);
        assert_eq!(
            quality_args(&source, &config(Quality::Lower), WEBP_MIME),
            vec!["-quality", "1"]
        );
    }

    #[test]
    fn illustrations_get_no_quality_flag() {
        let mut source = info("PNG", 100, 800, 600);
        source.illustration = true;
        assert!(quality_args(&source, &config(Quality::Lower), JXL_MIME).is_empty());
    }

    #[test]
    fn accept_entries_with_parameters_still_match() {
        let source = info("JPEG", 85, 800, 600);
        let target = TargetSize { width: 300, height: 225 };

        let out = output_format(&source, &target, &formats(&["image/webp; q=0.8"]));
        assert_eq!(out, ("webp:-", "image/webp"));
    }
}
