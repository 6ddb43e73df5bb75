use std::{num::NonZeroUsize, process::ExitCode};

use axum::Router;
use clap::Parser;
use image_xform_gateway::{HttpLoader, ImageGatewayBuilder, ImageMagick};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP image-transformation gateway backed by ImageMagick.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the ImageMagick convert binary.
    #[arg(long = "imConvert")]
    im_convert: String,

    /// Path to the ImageMagick identify binary.
    #[arg(long = "imIdentify")]
    im_identify: String,

    /// Number of seconds to put into the Cache-Control max-age header.
    /// 0 disables the header.
    #[arg(long, default_value_t = 2_592_000)]
    cache: u32,

    /// Number of worker slots.
    #[arg(long, default_value_t = default_workers())]
    proc: usize,

    /// Disable Save-Data handling; Vary reduces to Accept.
    #[arg(long = "disableSaveData")]
    disable_save_data: bool,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_xform_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let processor = match ImageMagick::new(args.im_convert, args.im_identify) {
        Ok(processor) => processor,
        Err(err) => {
            tracing::error!(err = %err, "could not initialise the image engine");
            return ExitCode::from(1);
        }
    };

    let gateway = match ImageGatewayBuilder::new(HttpLoader::new(), processor)
        .workers(args.proc)
        .cache_ttl(args.cache)
        .disable_save_data(args.disable_save_data)
        .build()
    {
        Ok(gateway) => gateway,
        Err(err) => {
            tracing::error!(err = %err, "could not construct the worker pool");
            return ExitCode::from(2);
        }
    };

    let app = Router::new().fallback_service(gateway);

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(err = %err, addr = %args.listen, "could not bind the listen address");
            return ExitCode::from(3);
        }
    };

    tracing::info!(addr = %args.listen, "listening");

    match axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(err = %err, "server error");
            ExitCode::from(3)
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
