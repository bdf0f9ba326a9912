use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tproxy_config::Config;
use tproxy_core::run_proxy;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("tproxy=debug".parse()?),
        )
        .with_target(false)
        .init();

    // A missing config file is not fatal: the defaults describe a working
    // loopback proxy. A file that exists but does not parse is.
    let config = if config_path.exists() {
        Config::from_file(config_path)?
    } else {
        eprintln!(
            "Config file {} not found, using defaults",
            config_path.display()
        );
        Config::default()
    };

    // Shutdown channel so the metrics server stops with the proxy
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let (registry, metrics_handle) = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);

        let registry_clone = registry.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Metrics server shutting down");
                        break;
                    }
                    result = metrics_listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let registry = registry_clone.clone();
                            let io = TokioIo::new(stream);

                            tokio::spawn(async move {
                                let service = hyper::service::service_fn(
                                    move |req: Request<hyper::body::Incoming>| {
                                        let registry = registry.clone();
                                        async move { serve_endpoint(&registry, req.uri().path()) }
                                    },
                                );

                                if let Err(err) =
                                    http1::Builder::new().serve_connection(io, service).await
                                {
                                    warn!("Metrics server connection error: {}", err);
                                }
                            });
                        }
                    }
                }
            }
        });

        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    let proxy_result = run_proxy(config, registry).await;

    // Stop the metrics server and wait for it
    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    proxy_result
}

fn serve_endpoint(
    registry: &Registry,
    path: &str,
) -> Result<Response<Full<bytes::Bytes>>, String> {
    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = vec![];
            encoder
                .encode(&metric_families, &mut buffer)
                .map_err(|e| format!("Metrics encoding error: {}", e))?;
            Ok(Response::new(Full::new(bytes::Bytes::from(buffer))))
        }
        "/health" => {
            let health_response = r#"{"status":"healthy","service":"tproxy"}"#;
            Ok(Response::new(Full::new(bytes::Bytes::from(
                health_response,
            ))))
        }
        "/" => {
            let index_response = r#"{"endpoints":["/health","/metrics"]}"#;
            Ok(Response::new(Full::new(bytes::Bytes::from(index_response))))
        }
        _ => {
            let not_found = r#"{"error":"not_found"}"#;
            Ok(Response::new(Full::new(bytes::Bytes::from(not_found))))
        }
    }
}
