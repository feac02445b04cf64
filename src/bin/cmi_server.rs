use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use cmi::{
    api_router, init_logging, log_app_bind, log_app_start, log_source_selected,
    logging_config_from_env, pipeline_config_from_env, PipelineContext, SourceKind,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("cmi_server", &logging_cfg);

    let config = pipeline_config_from_env();
    let addr: SocketAddr = config.server_addr.parse()?;
    match config.source {
        SourceKind::Csv => log_source_selected("cmi_server", "csv", None),
        SourceKind::Binance => log_source_selected("cmi_server", "binance", Some("CMI_DATA_SOURCE")),
    }

    let context = tokio::task::spawn_blocking(move || PipelineContext::open(config)).await??;
    let shared = Arc::new(Mutex::new(context));
    let app = api_router(Arc::clone(&shared));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Ok(mutex) = Arc::try_unwrap(shared) {
        if let Ok(context) = mutex.into_inner() {
            context.shutdown();
        }
    }
    Ok(())
}
