use std::net::SocketAddr;
use std::sync::Arc;

use lms_backend_rust::cache::RedisCache;
use lms_backend_rust::config::Config;
use lms_backend_rust::db::DatabaseProxy;
use lms_backend_rust::logging::init_tracing;
use lms_backend_rust::seed::seed_admin;
use lms_backend_rust::state::AppState;
use lms_backend_rust::workers::WorkerManager;
use lms_backend_rust::build_app;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level);

    let db_proxy = match DatabaseProxy::from_config(&config).await {
        Ok(proxy) => Some(Arc::new(proxy)),
        Err(err) => {
            tracing::warn!(error = %err, "database proxy not initialized");
            None
        }
    };

    let cache = match config.redis_url.as_deref() {
        Some(url) => match RedisCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("redis cache connected");
                Some(Arc::new(cache))
            }
            Err(err) => {
                tracing::warn!(error = %err, "redis cache unavailable, continuing without it");
                None
            }
        },
        None => None,
    };

    if let Some(ref proxy) = db_proxy {
        seed_admin(proxy).await;
    }

    let worker_manager = if let Some(ref proxy) = db_proxy {
        match WorkerManager::new(Arc::clone(proxy)).await {
            Ok(manager) => {
                if let Err(e) = manager.start().await {
                    tracing::error!(error = %e, "failed to start workers");
                }
                Some(manager)
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker manager not initialized");
                None
            }
        }
    } else {
        None
    };

    let addr = config.bind_addr();
    let app = build_app(AppState::new(config, db_proxy.clone(), cache));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "lms-backend listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("HTTP server stopped, initiating graceful shutdown sequence");

    if let Some(ref manager) = worker_manager {
        manager.stop().await;
    }
    if let Some(proxy) = db_proxy {
        proxy.close().await;
    }

    tracing::info!("Graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
