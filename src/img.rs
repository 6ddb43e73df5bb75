//! Shared types passed between the loader, the policy layer, the engine, and
//! the worker pool.

use bytes::Bytes;
use http::HeaderMap;
use mediatype::MediaTypeBuf;

/// A self-describing image blob.
///
/// Constructed by the loader (source bytes) or by the engine (transformed
/// bytes). Jobs move ownership through the worker pool, so images are never
/// shared across requests.
#[derive(Debug, Clone)]
pub struct Image {
    /// Opaque identifier, typically the source URL. Used for logging only.
    pub id: String,

    /// The encoded image bytes.
    pub data: Bytes,

    /// MIME type of `data`. May be empty, in which case the response omits
    /// `Content-Type` and downstream consumers sniff the body.
    pub mime_type: String,

    /// Content encoding the origin served the bytes with. May be empty.
    pub content_encoding: String,
}

/// Structural metadata probed from an [`Image`] by the engine's identify step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    /// Container format as reported by the engine, e.g. "JPEG", "PNG", "GIF".
    pub format: String,

    /// Quality 1..=100. 100 means the source carries no quality signal.
    pub quality: u8,

    /// True when the image has no transparency.
    pub opaque: bool,

    /// Width in pixels. 0 when the image has not been probed.
    pub width: u32,

    /// Height in pixels. 0 when the image has not been probed.
    pub height: u32,

    /// Source length in bytes.
    pub size: usize,

    /// True when the image is a cartoon-like illustration, logo, or icon.
    /// Only computed for PNG sources.
    pub illustration: bool,
}

/// Request-level quality, derived from client hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    /// No reduction.
    #[default]
    Default,

    /// Save-Data requested: shave 10 off the computed quality.
    Low,

    /// High-density screen: shave 20 off the computed quality.
    Lower,
}

/// Target size for the resize and fit transformations.
///
/// Format is `WIDTHxHEIGHT`. For resize either dimension may be dropped,
/// e.g. `300`, `x200`, `300x200`; fit requires both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeConfig {
    /// The raw size string, validated against the per-operation grammar.
    pub size: String,
}

/// The transformation to apply, tagging the per-operation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    /// Re-encode without changing dimensions, possibly to a better codec.
    Optimise,

    /// Resize preserving aspect ratio.
    Resize(ResizeConfig),

    /// Resize to the exact size, cropping around the center.
    Fit(ResizeConfig),
}

/// Everything the engine needs to transform one source image.
#[derive(Debug, Clone)]
pub struct TransformationConfig {
    /// The source image.
    pub src: Image,

    /// Output MIME types the client accepts, parsed from the Accept header.
    pub supported_formats: Vec<MediaTypeBuf>,

    /// Request-level quality.
    pub quality: Quality,

    /// Trim a solid border off the image before transforming.
    pub trim_border: bool,

    /// Which transformation to run.
    pub transformation: Transformation,
}

/// Extra headers for the origin fetch.
///
/// An embedding application may insert this as a request extension; the
/// gateway forwards the headers to the loader on top of its global header
/// bag.
#[derive(Debug, Clone, Default)]
pub struct SourceHeaders(pub HeaderMap);
