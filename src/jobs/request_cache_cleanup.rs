use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::saml::SamlProvider;

/// Drop expired AuthnRequest IDs, returning how many were removed.
pub fn run_cleanup(provider: &SamlProvider) -> usize {
    provider.request_cache().purge_expired()
}

/// Purge expired request IDs every `interval` until `shutdown` is cancelled.
pub async fn start_request_cache_cleanup_worker(
    provider: Arc<SamlProvider>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        "Starting SAML request cache cleanup worker"
    );

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("SAML request cache cleanup worker stopped");
                return;
            }
            _ = ticker.tick() => {
                let removed = run_cleanup(&provider);
                if removed > 0 {
                    tracing::info!(
                        removed,
                        outstanding = provider.request_cache().len(),
                        "Purged expired SAML request IDs"
                    );
                } else {
                    tracing::debug!("SAML request cache cleanup run complete, nothing to purge");
                }
            }
        }
    }
}
