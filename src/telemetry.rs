use std::time::Duration;

use opentelemetry::global;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "imgq";

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `default_level`. With a `jaeger_endpoint`, spans are
/// also batched to that collector; proxies are bypassed for it.
pub fn init(
    default_level: LevelFilter,
    jaeger_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let jaeger_layer = match jaeger_endpoint {
        Some(endpoint) => {
            for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
                std::env::remove_var(var);
            }
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name(SERVICE_NAME)
                .with_isahc()
                .with_timeout(Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = EnvFilter::builder()
        .with_default_directive(format!("{SERVICE_NAME}={default_level}").parse()?)
        .from_env()?;

    tracing_subscriber::registry()
        .with(jaeger_layer)
        .with(filter_layer)
        .with(fmt::Layer::default().with_target(false))
        .try_init()?;

    Ok(())
}

/// Flushes any spans still waiting for the Jaeger exporter.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
