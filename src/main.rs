use scalegate::admin::{AdminServer, PKG_NAME, VERSION};
use scalegate::autoscale::{build_autoscalers, LoadSignal};
use scalegate::config::{Config, ScalingMode};
use scalegate::group::ScalingGroups;
use scalegate::host::HostLimits;
use scalegate::lifecycle::{LifecycleManager, LifecycleSettings};
use scalegate::metrics::{HttpLoadProbe, HttpMetricsSource, LoadProbe, MetricsSource};
use scalegate::pool::PoolConfig;
use scalegate::provider::{ComputeProvider, HttpComputeProvider};
use scalegate::proxy::{ProxyServer, ProxySettings};
use scalegate::router::HostRouter;
use scalegate::selector::build_selector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalegate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("scalegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let limits = HostLimits {
        max_connections: config.server.max_connections_per_host,
        max_queue_size: config.server.max_queue_size,
        problem_retry: config.server.problem_server_retry(),
    };
    let router = HostRouter::new(build_selector(&config.selector), limits);

    let lifecycle = match config.provider {
        Some(ref provider_config) => {
            let provider: Arc<dyn ComputeProvider> = Arc::new(HttpComputeProvider::new(provider_config)?);
            Some(
                LifecycleManager::new(
                    provider,
                    LifecycleSettings::from(provider_config),
                    shutdown_rx.clone(),
                )
                .await,
            )
        }
        None => None,
    };

    let groups = Arc::new(ScalingGroups::new(&config.groups, Arc::clone(&router), lifecycle));
    groups.bootstrap()?;

    let remote_signal = match config.metrics {
        Some(ref metrics_config) => {
            let metrics: Arc<dyn MetricsSource> = Arc::new(HttpMetricsSource::new(metrics_config)?);
            Some(LoadSignal::Remote {
                metrics,
                namespace: metrics_config.namespace.clone(),
            })
        }
        None => None,
    };
    let local_signal = if config.groups.iter().any(|g| g.mode == ScalingMode::Local) {
        let probe: Arc<dyn LoadProbe> = Arc::new(HttpLoadProbe::new(&config.local_probe)?);
        Some(LoadSignal::local(probe, &config.local_probe))
    } else {
        None
    };

    let autoscalers = build_autoscalers(groups.groups(), remote_signal, local_signal);
    info!(controllers = autoscalers.len(), "Starting autoscalers");
    for autoscaler in autoscalers {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(autoscaler.run(shutdown));
    }

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(proxy_addr, Arc::clone(&router), shutdown_rx.clone(), pool_config)
        .with_settings(ProxySettings::from_config(&config.server));
    let pool_stats = proxy.pool().stats();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&router),
            Arc::clone(&groups),
            shutdown_rx.clone(),
            admin_token,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!(
        total_requests = pool_stats.get_total_requests(),
        retries = pool_stats.get_retries(),
        "Proxy statistics"
    );

    for status in groups.status() {
        info!(
            group = status.name,
            current = status.current,
            desired = status.desired,
            "Final group state"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting load balancer");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        selector = ?config.selector.strategy,
        session_cookies = ?config.server.session_cookie_names,
        "Server configuration"
    );
    info!(
        max_connections_per_host = config.server.max_connections_per_host,
        max_queue_size = config.server.max_queue_size,
        problem_server_retry_secs = config.server.problem_server_retry_secs,
        max_attempts = config.server.max_attempts,
        request_timeout_secs = config.server.request_timeout_secs,
        "Request handling settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );

    for (id, group) in config.groups.iter().enumerate() {
        info!(
            group = group.label(id),
            mode = ?group.mode,
            image_id = %group.image_id,
            instance_type = %group.instance_type,
            min = group.min,
            max = group.max,
            scale = group.scale,
            scale_up_policies = group.scale_up.len(),
            scale_down_policies = group.scale_down.len(),
            "Configured scaling group"
        );
    }
}
