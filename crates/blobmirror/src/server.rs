use anyhow::{Context, Result};

use blobmirror_service::store::StoreConfig;
use blobmirror_service::{Cache, Config};

use crate::endpoints;

/// Starts the cache engine and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mirror-web")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        tracing::info!(
            primary = %config.primary,
            cache_path = %config.cache_path.display(),
            max_size = config.max_size,
            max_not_found = config.max_not_found,
            cache_time = %humantime::format_duration(config.cache_time),
            api_key_set = config.api_key.is_some(),
            "Loaded configuration"
        );

        let store = StoreConfig::parse(&config.primary)?
            .create()
            .context("failed to create the object store")?;
        let cache = Cache::new(&config, store).context("failed to create the cache")?;

        let bind = config.bind.clone();
        let app = endpoints::create_app(endpoints::ServiceState::new(config, cache));

        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

        axum::serve(listener, app).await?;
        tracing::info!("System shutdown complete");
        Ok(())
    })
}
