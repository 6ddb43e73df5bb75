//! # Overview
//!
//! This crate provides an HTTP image-transformation gateway as a `tower`
//! service.
//!
//! A request names a source image URL in the path; the gateway fetches the
//! original, drives the external ImageMagick `convert`/`identify` binaries
//! through a bounded worker pool, picks an output codec from the client's
//! Accept header and the image's properties, and streams the result back
//! with caching and variant-negotiation headers.
//!
//! # URL surface
//!
//! | Path | Purpose |
//! |---|---|
//! | `GET /img/{sourceUrl}/optimise` | Re-encode, possibly to a better codec |
//! | `GET /img/{sourceUrl}/resize?size=WxH` | Resize preserving aspect ratio |
//! | `GET /img/{sourceUrl}/fit?size=WxH` | Resize with center crop |
//! | `GET /img/{sourceUrl}/asis` | Pass through |
//! | `GET /health` | Liveness probe |
//!
//! # Usage with an `axum` application
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//!
//! use axum::Router;
//! use image_xform_gateway::{HttpLoader, ImageGatewayBuilder, ImageMagick};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let processor = ImageMagick::new("convert", "identify")?;
//!     let gateway = ImageGatewayBuilder::new(HttpLoader::new(), processor)
//!         .cache_ttl(86_400)
//!         .build()?;
//!
//!     let app = Router::new().fallback_service(gateway);
//!
//!     let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
//!     let listener = tokio::net::TcpListener::bind(&addr).await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```
#![warn(
    clippy::all,
    nonstandard_style,
    future_incompatible,
    missing_docs,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

mod engine;
mod error;
pub mod illustration;
mod img;
mod loader;
pub mod policy;
mod pool;
mod service;

pub use engine::{ImageMagick, Processor};
pub use error::Error;
pub use img::{
    Image, ImageInfo, Quality, ResizeConfig, SourceHeaders, Transformation, TransformationConfig,
};
pub use loader::{HttpLoader, Loader};
pub use pool::{Payload, WorkerPool};
pub use service::{ImageGateway, ImageGatewayBuilder};
