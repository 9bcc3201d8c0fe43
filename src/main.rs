use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use interlock::catalog::{Catalog, StaticCatalog};
use interlock::config::Config;
use interlock::notify::{LogNotifier, NotificationQueue};
use interlock::service::BookingService;
use interlock::store::BookingStore;
use interlock::{compactor, observability, tls, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    let tls_acceptor = config.tls.as_ref().map(tls::load_tls_acceptor).transpose()?;

    let catalog = match &config.catalog {
        Some(path) => StaticCatalog::from_json_file(path)?,
        None => StaticCatalog::campus_defaults(),
    };
    info!("catalog: {} resources", catalog.len());
    let catalog: Arc<dyn Catalog> = Arc::new(catalog);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = BookingStore::open(config.store_config(), catalog)?;
    let service = Arc::new(BookingService::new(store));
    let (notifications, notify_worker) =
        NotificationQueue::spawn(Arc::new(LogNotifier), config.notify_queue);
    let notifications = Arc::new(notifications);
    let factory = wire::InterlockFactory::new(
        service.clone(),
        notifications.clone(),
        config.password.clone(),
    );

    let compactor = {
        let service = service.clone();
        let threshold = config.compact_threshold;
        tokio::spawn(async move { compactor::run_compactor(service, threshold).await })
    };

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("interlock listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    compactor.abort();
    service.close().await?;
    info!("store closed");

    // The worker exits once the last queue handle is gone.
    drop(factory);
    drop(notifications);
    if tokio::time::timeout(Duration::from_secs(5), notify_worker).await.is_err() {
        tracing::warn!("notification worker did not finish, pending confirmations dropped");
    }

    info!("interlock stopped");
    Ok(())
}
