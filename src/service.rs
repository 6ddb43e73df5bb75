use std::{
    convert::Infallible,
    marker::PhantomData,
    num::NonZeroUsize,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Future;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::Full;
use mediatype::MediaTypeBuf;
use percent_encoding::percent_decode_str;
use tower_service::Service;

use crate::{
    engine::Processor,
    error::Error,
    img::{Image, Quality, ResizeConfig, SourceHeaders, Transformation, TransformationConfig},
    loader::Loader,
    pool::{Payload, WorkerPool},
    policy,
};

// 1x1 transparent GIF answered for Save-Data hide requests.
static TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x21, 0xF9,
    0x04, 0x01, 0x0A, 0x00, 0x01, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
    0x00, 0x02, 0x02, 0x4C, 0x01, 0x00, 0x3B,
];

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const SAVE_DATA: &str = "save-data";

/// Process-wide knobs, set once at startup.
#[derive(Debug, Clone)]
struct GatewayConfig {
    cache_ttl: u32,
    save_data: bool,
}

impl GatewayConfig {
    fn vary(&self) -> &'static str {
        if self.save_data {
            "Accept, Save-Data"
        } else {
            "Accept"
        }
    }
}

struct Shared<L> {
    loader: L,
    pool: WorkerPool,
    config: GatewayConfig,
}

/// The image-transformation gateway service.
///
/// Serves `GET /img/{sourceUrl}/{optimise|resize|fit|asis}` and
/// `GET /health`. The source URL is taken from the path verbatim, repeated
/// slashes included, so percent-encoding it is optional as long as the last
/// path segment stays the operation name.
pub struct ImageGateway<L, ResBody = Full<Bytes>> {
    shared: Arc<Shared<L>>,

    // Covariant over ResBody; no dropping of ResBody.
    _marker: PhantomData<fn() -> ResBody>,
}

impl<L, ResBody> Clone for ImageGateway<L, ResBody> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<L, ResBody> std::fmt::Debug for ImageGateway<L, ResBody> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGateway")
            .field("pool", &self.shared.pool)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Builder for [`ImageGateway`].
#[derive(Debug)]
pub struct ImageGatewayBuilder<L, P> {
    loader: L,
    processor: Arc<P>,
    workers: usize,
    cache_ttl: u32,
    save_data: bool,
}

impl<L, P> ImageGatewayBuilder<L, P>
where
    L: Loader,
    P: Processor + 'static,
{
    /// Creates a new [`ImageGatewayBuilder`] from a loader and a processor.
    ///
    /// Defaults: one worker per logical CPU, 30 days of `Cache-Control`
    /// max-age, Save-Data handling enabled.
    pub fn new(loader: L, processor: P) -> Self {
        Self {
            loader,
            processor: Arc::new(processor),
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            cache_ttl: 2_592_000,
            save_data: true,
        }
    }

    /// Configure the number of worker slots.
    pub fn workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    /// Configure the `Cache-Control` max-age in seconds. Zero disables the
    /// header.
    pub fn cache_ttl(self, cache_ttl: u32) -> Self {
        Self { cache_ttl, ..self }
    }

    /// Disable Save-Data handling; `Vary` reduces to `Accept`.
    pub fn disable_save_data(self, disable: bool) -> Self {
        Self {
            save_data: !disable,
            ..self
        }
    }

    /// Build the [`ImageGateway`], spawning its worker pool.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`Error::PoolMisconfigured`] when the worker count is zero.
    pub fn build(self) -> Result<ImageGateway<L>, Error> {
        let pool = WorkerPool::new(self.processor, self.workers)?;

        Ok(ImageGateway {
            shared: Arc::new(Shared {
                loader: self.loader,
                pool,
                config: GatewayConfig {
                    cache_ttl: self.cache_ttl,
                    save_data: self.save_data,
                },
            }),
            _marker: PhantomData,
        })
    }
}

impl<ReqBody, ResBody, L> Service<Request<ReqBody>> for ImageGateway<L, ResBody>
where
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes>,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    L: Loader + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let (parts, _body) = req.into_parts();

        Box::pin(async move { Ok(handle(shared, parts).await) })
    }
}

async fn handle<L: Loader>(
    shared: Arc<Shared<L>>,
    parts: http::request::Parts,
) -> Response<Full<Bytes>> {
    let path = parts.uri.path();

    if path == "/health" {
        return plain(StatusCode::OK, "OK");
    }

    // Expected format:
    //
    //   /img/{sourceUrl}/{operation}
    //
    // The source URL may contain bare slashes (including a leading `//` for
    // scheme-relative URLs), so the operation is whatever follows the last
    // slash.
    let Some(rest) = path.strip_prefix("/img/") else {
        return response_with_status(StatusCode::NOT_FOUND);
    };
    let Some((raw_source, operation)) = rest.rsplit_once('/') else {
        return response_with_status(StatusCode::NOT_FOUND);
    };

    let source_url = match source_url(raw_source, &parts.headers) {
        Ok(source_url) => source_url,
        Err(response) => return *response,
    };

    let extra_headers = parts
        .extensions
        .get::<SourceHeaders>()
        .map(|headers| headers.0.clone());

    if operation == "asis" {
        return serve_as_is(&shared, &source_url, extra_headers).await;
    }

    let query = query_pairs(&parts);

    let transformation = match operation {
        "optimise" => Transformation::Optimise,
        "resize" | "fit" => {
            let Some(size) = query_param(&query, "size") else {
                return plain(StatusCode::BAD_REQUEST, "size param is required");
            };

            let parsed = if operation == "resize" {
                policy::parse_resize_size(size).map(|_| ())
            } else {
                policy::parse_fit_size(size).map(|_| ())
            };
            if let Err(err) = parsed {
                return plain(StatusCode::BAD_REQUEST, err.to_string());
            }

            let resize = ResizeConfig {
                size: size.to_string(),
            };
            if operation == "resize" {
                Transformation::Resize(resize)
            } else {
                Transformation::Fit(resize)
            }
        }
        _ => return response_with_status(StatusCode::NOT_FOUND),
    };

    let dppx: f32 = match query_param(&query, "dppx") {
        None => 1.0,
        Some(raw) => match raw.parse() {
            Ok(dppx) => dppx,
            Err(_) => return plain(StatusCode::BAD_REQUEST, "dppx param should be a number"),
        },
    };

    let save_data_param = match query_param(&query, SAVE_DATA) {
        None => None,
        Some("off") => Some(SaveDataParam::Off),
        Some("hide") => Some(SaveDataParam::Hide),
        Some(_) => {
            return plain(
                StatusCode::BAD_REQUEST,
                "save-data param should be one of [off, hide]",
            )
        }
    };

    let trim_border = match query_param(&query, "trim-border") {
        None => false,
        Some(raw) => match parse_bool_param(raw) {
            Some(trim_border) => trim_border,
            None => {
                return plain(
                    StatusCode::BAD_REQUEST,
                    "trim-border param should be a boolean",
                )
            }
        },
    };

    let save_data_hint = shared.config.save_data && save_data_header_on(&parts.headers);

    let quality = if dppx >= 2.0 {
        Quality::Lower
    } else if save_data_hint && save_data_param != Some(SaveDataParam::Off) {
        Quality::Low
    } else {
        Quality::Default
    };

    if save_data_hint && save_data_param == Some(SaveDataParam::Hide) {
        return transparent_gif(&shared.config);
    }

    tracing::info!(url = %source_url, operation, "transforming image");

    let src = match shared.loader.load(&source_url, extra_headers).await {
        Ok(src) => src,
        Err(err) => return load_error(&err),
    };

    let config = TransformationConfig {
        src,
        supported_formats: supported_formats(&parts.headers),
        quality,
        trim_border,
        transformation,
    };

    let result = shared.pool.submit(Payload::Transform(config)).await;
    write_result(result, &shared.config, Some(shared.config.vary()))
}

async fn serve_as_is<L: Loader>(
    shared: &Shared<L>,
    source_url: &str,
    extra_headers: Option<HeaderMap>,
) -> Response<Full<Bytes>> {
    tracing::info!(url = %source_url, "requested image as is");

    let image = match shared.loader.load(source_url, extra_headers).await {
        Ok(image) => image,
        Err(err) => return load_error(&err),
    };

    // The result is preset; the pool ride is for admission control only.
    let result = shared.pool.submit(Payload::Ready(image)).await;
    write_result(result, &shared.config, None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveDataParam {
    Off,
    Hide,
}

fn source_url(raw: &str, headers: &HeaderMap) -> Result<String, Box<Response<Full<Bytes>>>> {
    let Ok(decoded) = percent_decode_str(raw).decode_utf8() else {
        return Err(Box::new(plain(
            StatusCode::BAD_REQUEST,
            "url param is not valid",
        )));
    };

    let mut url = decoded.into_owned();
    if url.is_empty() {
        return Err(Box::new(plain(
            StatusCode::BAD_REQUEST,
            "url param is required",
        )));
    }

    // Scheme-relative source URLs take their scheme from the proxy.
    if url.starts_with("//") {
        let mut protos = headers.get_all(X_FORWARDED_PROTO).iter();
        if let (Some(proto), None) = (protos.next(), protos.next()) {
            if let Ok(proto) = proto.to_str() {
                url = format!("{proto}:{url}");
            }
        }
    }

    Ok(url)
}

fn query_pairs(parts: &http::request::Parts) -> Vec<(String, String)> {
    url::form_urlencoded::parse(parts.uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

// A parameter given more than once is treated as absent.
fn query_param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    let mut values = query
        .iter()
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.as_str());

    match (values.next(), values.next()) {
        (Some(value), None) => Some(value),
        _ => None,
    }
}

// The token set of Go's strconv.ParseBool, which the original accepted.
// An empty value means true: `?trim-border` alone turns the flag on.
fn parse_bool_param(raw: &str) -> Option<bool> {
    match raw {
        "" | "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn save_data_header_on(headers: &HeaderMap) -> bool {
    headers
        .get(SAVE_DATA)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("on"))
}

fn supported_formats(headers: &HeaderMap) -> Vec<MediaTypeBuf> {
    let Some(accept) = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
    else {
        return Vec::new();
    };

    accept
        .split(',')
        .filter_map(|entry| entry.trim().parse::<MediaTypeBuf>().ok())
        .collect()
}

fn transparent_gif(config: &GatewayConfig) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(Bytes::from_static(TRANSPARENT_GIF)));
    let headers = response.headers_mut();

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    headers.insert(header::CONTENT_LENGTH, TRANSPARENT_GIF.len().into());
    headers.insert(header::VARY, HeaderValue::from_static(config.vary()));
    if let Some(cache_control) = cache_control(config) {
        headers.insert(header::CACHE_CONTROL, cache_control);
    }

    response
}

fn write_result(
    result: Result<Image, Error>,
    config: &GatewayConfig,
    vary: Option<&'static str>,
) -> Response<Full<Bytes>> {
    let mut response = match result {
        Err(err) => {
            tracing::error!(err = %err, "transformation failed");
            error_response(&err, "transforming")
        }
        Ok(image) => {
            let mut response = Response::new(Full::from(image.data.clone()));
            let headers = response.headers_mut();

            // Content-Type stays absent when the engine kept the source
            // container, letting downstream consumers sniff the body.
            if !image.mime_type.is_empty() {
                if let Ok(mime_type) = HeaderValue::from_str(&image.mime_type) {
                    headers.insert(header::CONTENT_TYPE, mime_type);
                }
            }
            if !image.content_encoding.is_empty() {
                if let Ok(encoding) = HeaderValue::from_str(&image.content_encoding) {
                    headers.insert(header::CONTENT_ENCODING, encoding);
                }
            }
            headers.insert(header::CONTENT_LENGTH, image.data.len().into());
            if let Some(cache_control) = cache_control(config) {
                headers.insert(header::CACHE_CONTROL, cache_control);
            }

            response
        }
    };

    if let Some(vary) = vary {
        response
            .headers_mut()
            .insert(header::VARY, HeaderValue::from_static(vary));
    }

    response
}

fn load_error(err: &Error) -> Response<Full<Bytes>> {
    tracing::error!(err = %err, "failed to read the source image");

    error_response(err, "reading")
}

// Loader-supplied statuses and grammar violations keep their message
// verbatim; everything else is a 500 with the cause for diagnostics.
fn error_response(err: &Error, stage: &str) -> Response<Full<Bytes>> {
    let body = match err {
        Error::Http { message, .. } => message.clone(),
        Error::BadRequest(message) => message.clone(),
        _ => format!("Error {stage} image: '{err}'"),
    };

    plain(err.status_code(), body)
}

fn cache_control(config: &GatewayConfig) -> Option<HeaderValue> {
    if config.cache_ttl == 0 {
        return None;
    }

    format!("public, max-age={}", config.cache_ttl).parse().ok()
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn response_with_status<B>(status_code: StatusCode) -> Response<B>
where
    B: Default,
{
    let mut res = Response::default();
    *res.status_mut() = status_code;
    res
}
