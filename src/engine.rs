//! The ImageMagick-backed image engine.
//!
//! Every transformation spawns a fresh `convert` process with the source
//! bytes on stdin and the result captured from stdout; probing spawns
//! `identify` the same way. Processes are not reused.

use std::{env, future::Future, path::PathBuf, process::Stdio};

use bytes::Bytes;
use tokio::{io::AsyncWriteExt, process::Command, task};

use crate::{
    error::Error,
    illustration,
    img::{Image, ImageInfo, ResizeConfig, Transformation, TransformationConfig},
    policy,
};

/// Applies transformations to images.
///
/// The trait is the seam between the worker pool and the engine; tests swap
/// in mock processors, deployments may wrap the engine with their own.
pub trait Processor: Send + Sync {
    /// Applies the configured transformation and returns the result.
    fn apply(
        &self,
        config: TransformationConfig,
    ) -> impl Future<Output = Result<Image, Error>> + Send;
}

// Changing orientation before resize, so result width and height is correct.
const BEFORE_RESIZE_OPTS: &[&str] = &["-auto-orient"];

// Static arguments applied to every convert run, in this order.
const CONVERT_OPTS: &[&str] = &[
    "-dither",
    "None",
    "-define",
    "jpeg:fancy-upsampling=off",
    "-define",
    "png:compression-filter=5",
    "-define",
    "png:compression-level=9",
    "-define",
    "png:compression-strategy=0",
    "-define",
    "png:exclude-chunk=bKGD,cHRM,EXIF,gAMA,iCCP,iTXt,sRGB,tEXt,zCCP,zTXt,date",
    "-define",
    "heic:speed=6",
    "-interlace",
    "None",
    "-colorspace",
    "sRGB",
    "-sampling-factor",
    "4:2:0",
    "+profile",
    "!icc,*",
];

const CUT_TO_FIT_OPTS: &[&str] = &["-gravity", "center"];

/// Image engine driving the external ImageMagick `convert` and `identify`
/// binaries.
#[derive(Debug, Clone)]
pub struct ImageMagick {
    convert_cmd: PathBuf,
    identify_cmd: PathBuf,
    additional_args: Vec<String>,
}

impl ImageMagick {
    /// Creates a new engine from the paths to the `convert` and `identify`
    /// binaries. Both must resolve to an existing file, either directly or
    /// through `PATH`.
    pub fn new(convert: impl Into<PathBuf>, identify: impl Into<PathBuf>) -> Result<Self, Error> {
        let convert_cmd = look_path(convert.into(), "convert")?;
        let identify_cmd = look_path(identify.into(), "identify")?;

        Ok(Self {
            convert_cmd,
            identify_cmd,
            additional_args: Vec::new(),
        })
    }

    /// Static arguments passed to every `convert` run, between the quality
    /// options and the built-in globals. Argument name and value go in
    /// separate elements.
    pub fn with_additional_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.additional_args = args.into_iter().collect();
        self
    }

    /// Probes an image: format, quality, opacity, dimensions. PNG sources
    /// additionally run the illustration scan, and their reported quality is
    /// forced to 100 because identify answers a meaningless 92 for them.
    pub async fn identify(&self, src: &Image) -> Result<ImageInfo, Error> {
        let args = ["-format", "%m %Q %[opaque] %w %h", "-"];
        tracing::debug!(id = %src.id, ?args, "running identify command");

        let output = run_process(&self.identify_cmd, &args, src.data.clone())
            .await
            .map_err(|err| Error::ProbeFailed {
                stderr: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(id = %src.id, %stderr, "identify command failed");
            return Err(Error::ProbeFailed { stderr });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = parse_identify(&stdout).ok_or_else(|| Error::ProbeFailed {
            stderr: format!("unexpected identify output [{}]", stdout.trim()),
        })?;
        info.size = src.data.len();

        if info.format == "PNG" {
            // identify reports quality 92 when the source carries no signal.
            info.quality = 100;

            let data = src.data.clone();
            info.illustration = task::spawn_blocking(move || illustration::is_illustration(&data))
                .await
                .map_err(|err| Error::ProbeFailed {
                    stderr: err.to_string(),
                })?;
        }

        Ok(info)
    }

    async fn resize(
        &self,
        config: &TransformationConfig,
        resize: &ResizeConfig,
    ) -> Result<Image, Error> {
        let source = self.identify(&config.src).await?;
        let target = policy::resize_target(&source, &resize.size)?;
        let (output_arg, mime_type) =
            policy::output_format(&source, &target, &config.supported_formats);

        let args = resize_args(config, &source, &resize.size, output_arg, mime_type, &self.additional_args);
        let data = self.exec_convert(config.src.data.clone(), &args, &config.src.id).await?;

        Ok(Image {
            id: config.src.id.clone(),
            data: data.into(),
            mime_type: mime_type.to_string(),
            content_encoding: String::new(),
        })
    }

    async fn fit(
        &self,
        config: &TransformationConfig,
        resize: &ResizeConfig,
    ) -> Result<Image, Error> {
        let source = self.identify(&config.src).await?;
        let target = policy::fit_target(&resize.size)?;
        let (output_arg, mime_type) =
            policy::output_format(&source, &target, &config.supported_formats);

        let args = fit_args(config, &source, &resize.size, output_arg, mime_type, &self.additional_args);
        let data = self.exec_convert(config.src.data.clone(), &args, &config.src.id).await?;

        Ok(Image {
            id: config.src.id.clone(),
            data: data.into(),
            mime_type: mime_type.to_string(),
            content_encoding: String::new(),
        })
    }

    async fn optimise(&self, config: &TransformationConfig) -> Result<Image, Error> {
        let source = self.identify(&config.src).await?;
        let target = policy::TargetSize {
            width: source.width,
            height: source.height,
        };
        let (output_arg, mime_type) =
            policy::output_format(&source, &target, &config.supported_formats);

        let args = optimise_args(config, &source, output_arg, mime_type, &self.additional_args);
        let result = self.exec_convert(config.src.data.clone(), &args, &config.src.id).await?;

        // The optimised variant must never be bigger than the source.
        if result.len() > config.src.data.len() {
            tracing::warn!(
                id = %config.src.id,
                optimised = result.len(),
                original = config.src.data.len(),
                "optimised size is more than the original, falling back to the original"
            );
            return Ok(Image {
                id: config.src.id.clone(),
                data: config.src.data.clone(),
                mime_type: String::new(),
                content_encoding: String::new(),
            });
        }

        Ok(Image {
            id: config.src.id.clone(),
            data: result.into(),
            mime_type: mime_type.to_string(),
            content_encoding: String::new(),
        })
    }

    async fn exec_convert(
        &self,
        data: Bytes,
        args: &[String],
        img_id: &str,
    ) -> Result<Vec<u8>, Error> {
        tracing::debug!(id = %img_id, ?args, "running convert command");

        let output = run_process(&self.convert_cmd, args, data)
            .await
            .map_err(|err| Error::EngineFailed {
                stderr: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(id = %img_id, %stderr, "convert command failed");
            return Err(Error::EngineFailed { stderr });
        }

        Ok(output.stdout)
    }
}

impl Processor for ImageMagick {
    async fn apply(&self, config: TransformationConfig) -> Result<Image, Error> {
        match config.transformation.clone() {
            Transformation::Optimise => self.optimise(&config).await,
            Transformation::Resize(resize) => self.resize(&config, &resize).await,
            Transformation::Fit(resize) => self.fit(&config, &resize).await,
        }
    }
}

async fn run_process(
    cmd: &std::path::Path,
    args: &[impl AsRef<std::ffi::OsStr>],
    data: Bytes,
) -> std::io::Result<std::process::Output> {
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // The child may exit without draining stdin; write failures surface
        // through the exit status.
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
            let _ = stdin.shutdown().await;
        });
    }

    child.wait_with_output().await
}

// Resolves a binary the way exec.LookPath does: paths with a separator are
// checked directly, bare names are searched on PATH.
fn look_path(bin: PathBuf, role: &str) -> Result<PathBuf, Error> {
    if bin.as_os_str().is_empty() {
        return Err(Error::EngineInit(format!(
            "path to the ImageMagick {role} binary must be provided"
        )));
    }

    if bin.components().count() > 1 {
        if bin.is_file() {
            return Ok(bin);
        }
    } else if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(&bin);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(Error::EngineInit(format!(
        "could not find the {role} binary at [{}]",
        bin.display()
    )))
}

fn parse_identify(stdout: &str) -> Option<ImageInfo> {
    let mut fields = stdout.split_whitespace();

    let format = fields.next()?.to_string();
    let quality: u8 = fields.next()?.parse().ok()?;
    let opaque = parse_im_bool(fields.next()?)?;
    let width: u32 = fields.next()?.parse().ok()?;

    // Animated sources emit one record per frame with no separator between
    // them; keep the leading digits of the height field.
    let height_field = fields.next()?;
    let digits: String = height_field
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let height: u32 = digits.parse().ok()?;

    Some(ImageInfo {
        format,
        quality: quality.clamp(1, 100),
        opaque,
        width,
        height,
        size: 0,
        illustration: false,
    })
}

fn parse_im_bool(field: &str) -> Option<bool> {
    if field.eq_ignore_ascii_case("true") {
        Some(true)
    } else if field.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn resize_args(
    config: &TransformationConfig,
    source: &ImageInfo,
    size: &str,
    output_arg: &str,
    output_mime: &str,
    additional_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    args.push("-".to_string()); // Input
    args.extend(before_transform_opts(config, source, output_mime));
    args.extend(BEFORE_RESIZE_OPTS.iter().map(|s| s.to_string()));
    args.push("-resize".to_string());
    args.push(size.to_string());
    args.extend(policy::quality_args(source, config, output_mime));
    args.extend(additional_args.iter().cloned());
    args.extend(CONVERT_OPTS.iter().map(|s| s.to_string()));
    args.extend(format_opts(source));
    args.push(output_arg.to_string()); // Output
    args
}

fn fit_args(
    config: &TransformationConfig,
    source: &ImageInfo,
    size: &str,
    output_arg: &str,
    output_mime: &str,
    additional_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    args.push("-".to_string()); // Input
    args.extend(before_transform_opts(config, source, output_mime));
    args.extend(BEFORE_RESIZE_OPTS.iter().map(|s| s.to_string()));
    args.push("-resize".to_string());
    args.push(format!("{size}^"));
    args.extend(policy::quality_args(source, config, output_mime));
    args.extend(additional_args.iter().cloned());
    args.extend(CONVERT_OPTS.iter().map(|s| s.to_string()));
    args.extend(CUT_TO_FIT_OPTS.iter().map(|s| s.to_string()));
    args.push("-extent".to_string());
    args.push(size.to_string());
    args.extend(format_opts(source));
    args.push(output_arg.to_string()); // Output
    args
}

fn optimise_args(
    config: &TransformationConfig,
    source: &ImageInfo,
    output_arg: &str,
    output_mime: &str,
    additional_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    args.push("-".to_string()); // Input
    args.extend(before_transform_opts(config, source, output_mime));
    args.extend(BEFORE_RESIZE_OPTS.iter().map(|s| s.to_string()));
    args.extend(policy::quality_args(source, config, output_mime));
    args.extend(additional_args.iter().cloned());
    args.extend(CONVERT_OPTS.iter().map(|s| s.to_string()));
    args.extend(format_opts(source));
    args.push(output_arg.to_string()); // Output
    args
}

fn before_transform_opts(
    config: &TransformationConfig,
    source: &ImageInfo,
    output_mime: &str,
) -> Vec<String> {
    let mut opts = Vec::new();

    // Animated GIFs need their frames coalesced before going to WebP.
    if output_mime == policy::WEBP_MIME && source.format == "GIF" {
        opts.push("-coalesce".to_string());
    }
    if config.trim_border {
        opts.push("-trim".to_string());
    }

    opts
}

fn format_opts(source: &ImageInfo) -> Vec<String> {
    let mut opts: Vec<String> = Vec::new();

    if source.illustration {
        opts.extend(
            ["-define", "webp:lossless=true", "-quality", "100", "-define", "jxl:effort=9"]
                .iter()
                .map(|s| s.to_string()),
        );
    } else {
        opts.extend(["-define", "jxl:effort=7"].iter().map(|s| s.to_string()));
    }

    if source.format != "GIF" {
        opts.extend(["-define", "webp:method=6"].iter().map(|s| s.to_string()));
    }

    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::Quality;

    fn config(transformation: Transformation) -> TransformationConfig {
        TransformationConfig {
            src: Image {
                id: "http://site.com/img.jpg".to_string(),
                data: Bytes::from_static(b"123"),
                mime_type: String::new(),
                content_encoding: String::new(),
            },
            supported_formats: Vec::new(),
            quality: Quality::Default,
            trim_border: false,
            transformation,
        }
    }

    fn photo_source() -> ImageInfo {
        ImageInfo {
            format: "JPEG".to_string(),
            quality: 85,
            opaque: true,
            width: 800,
            height: 600,
            size: 3,
            illustration: false,
        }
    }

    #[test]
    fn parses_identify_output() {
        let info = parse_identify("JPEG 85 True 800 600\n").unwrap();
        assert_eq!(info.format, "JPEG");
        assert_eq!(info.quality, 85);
        assert!(info.opaque);
        assert_eq!(info.width, 800);
        assert_eq!(info.height, 600);
    }

    #[test]
    fn parses_identify_output_of_animated_sources() {
        // One record per frame, no separator.
        let info = parse_identify("GIF 92 False 480 270GIF 92 False 480 270GIF 92 False 480 270")
            .unwrap();
        assert_eq!(info.format, "GIF");
        assert!(!info.opaque);
        assert_eq!(info.width, 480);
        assert_eq!(info.height, 270);
    }

    #[test]
    fn rejects_malformed_identify_output() {
        assert!(parse_identify("").is_none());
        assert!(parse_identify("JPEG").is_none());
        assert!(parse_identify("JPEG 85 maybe 800 600").is_none());
    }

    #[test]
    fn resize_argv_order() {
        let cfg = config(Transformation::Resize(ResizeConfig {
            size: "300x200".to_string(),
        }));
        let source = photo_source();

        let args = resize_args(&cfg, &source, "300x200", "webp:-", "image/webp", &[]);

        let mut expected = vec!["-", "-auto-orient", "-resize", "300x200"];
        expected.extend(CONVERT_OPTS.iter().copied());
        expected.extend(["-define", "jxl:effort=7", "-define", "webp:method=6"]);
        expected.push("webp:-");

        assert_eq!(args, expected);
    }

    #[test]
    fn fit_argv_includes_extent_and_gravity() {
        let cfg = config(Transformation::Fit(ResizeConfig {
            size: "300x200".to_string(),
        }));
        let source = photo_source();

        let args = fit_args(&cfg, &source, "300x200", "-", "", &[]);

        let mut expected = vec!["-", "-auto-orient", "-resize", "300x200^"];
        expected.extend(CONVERT_OPTS.iter().copied());
        expected.extend(["-gravity", "center", "-extent", "300x200"]);
        expected.extend(["-define", "jxl:effort=7", "-define", "webp:method=6"]);
        expected.push("-");

        assert_eq!(args, expected);
    }

    #[test]
    fn optimise_argv_has_no_resize() {
        let cfg = config(Transformation::Optimise);
        let mut source = photo_source();
        source.quality = 100;

        let args = optimise_args(&cfg, &source, "-", "", &[]);

        let mut expected = vec!["-", "-auto-orient", "-quality", "82"];
        expected.extend(CONVERT_OPTS.iter().copied());
        expected.extend(["-define", "jxl:effort=7", "-define", "webp:method=6"]);
        expected.push("-");

        assert_eq!(args, expected);
    }

    #[test]
    fn animated_gif_to_webp_coalesces_frames() {
        let mut cfg = config(Transformation::Optimise);
        cfg.trim_border = true;
        let mut source = photo_source();
        source.format = "GIF".to_string();
        source.quality = 85;

        let args = optimise_args(&cfg, &source, "webp:-", "image/webp", &[]);

        assert_eq!(&args[..3], &["-", "-coalesce", "-trim"]);
        // GIF sources do not get the webp encoding effort define.
        assert!(!args.contains(&"webp:method=6".to_string()));
    }

    #[test]
    fn illustrations_take_the_lossless_path() {
        let cfg = config(Transformation::Optimise);
        let mut source = photo_source();
        source.format = "PNG".to_string();
        source.quality = 100;
        source.illustration = true;

        let args = optimise_args(&cfg, &source, "jxl:-", "image/jxl", &[]);

        assert!(args.contains(&"webp:lossless=true".to_string()));
        assert!(args.contains(&"jxl:effort=9".to_string()));
        // Lossless: no bucketed -quality, only the lossless 100.
        let quality_positions: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-quality")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(quality_positions.len(), 1);
        assert_eq!(args[quality_positions[0] + 1], "100");
    }

    #[test]
    fn additional_args_sit_between_quality_and_globals() {
        let cfg = config(Transformation::Optimise);
        let source = photo_source();

        let additional = vec!["-limit".to_string(), "memory".to_string(), "64MiB".to_string()];
        let args = optimise_args(&cfg, &source, "-", "", &additional);

        assert_eq!(&args[..5], &["-", "-auto-orient", "-limit", "memory", "64MiB"]);
        assert_eq!(args[5], "-dither");
    }
}
