use anyhow::{Context, Result};
use load_core::telemetry::init_tracing;
use load_core::{LoadError, RunOutcome, StopReason, load_config, run_incremental_load};
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Long-running incremental load on container hosting services like AWS
/// EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config.
///     Main loop runs until a shutdown signal is received:
///         - run one incremental load
///         - capped: run again right away
///         - caught up or failed: sleep for the interval, then run again
///     A shutdown signal lets the current run finish, then exits.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var("LOAD_CONFIG_PATH").ok();
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let interval = interval_from_env()?;

    info!(
        "Loading {} into {} every {:?}",
        config.source.options.table,
        config.sink.options.table_uri(),
        interval
    );

    let shutdown = CancellationToken::new();
    register_shutdown(shutdown.clone());

    run_until_shutdown(|| run_incremental_load(&config), interval, shutdown).await
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
fn register_shutdown(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, exiting after the current run"),
            _ = terminate => info!("Received SIGTERM, exiting after the current run"),
        }
        shutdown.cancel();
    });
}

/// Runs loads back to back until `shutdown` is cancelled. A run in
/// progress is never interrupted; the token is only checked between runs
/// and while sleeping.
async fn run_until_shutdown<F, Fut>(
    mut run_once: F,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<RunOutcome, LoadError>>,
{
    while !shutdown.is_cancelled() {
        match run_once().await {
            Ok(outcome) => match outcome.stop_reason {
                StopReason::Capped => {
                    info!(
                        "Run capped at watermark {}, continuing immediately",
                        outcome.final_watermark
                    );
                    continue;
                }
                StopReason::Exhausted => {
                    info!(
                        "Caught up at watermark {} ({} rows this run)",
                        outcome.final_watermark, outcome.rows_loaded
                    );
                }
                StopReason::Failed => {
                    let message = outcome.error.map(|e| e.message).unwrap_or_default();
                    warn!(
                        "Run failed at watermark {}, will retry: {}",
                        outcome.final_watermark, message
                    );
                }
            },
            Err(e) if e.is_retryable() => {
                warn!("Load could not start, will retry: {}", e);
            }
            Err(e) => {
                error!("A fatal error occurred: {}", e);
                return Err(e).context("Load cycle failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    info!("Shutdown requested, no further runs");
    Ok(())
}

fn interval_from_env() -> Result<Duration> {
    let secs = match std::env::var("LOAD_INTERVAL_SECS") {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("LOAD_INTERVAL_SECS is not a number: {}", value))?,
        Err(_) => DEFAULT_INTERVAL_SECS,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use load_core::Watermark;
    use load_core::errors::ConfigError;
    use load_core::telemetry::LoadMetrics;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn outcome(stop_reason: StopReason) -> RunOutcome {
        RunOutcome {
            initial_watermark: Watermark::FLOOR,
            final_watermark: Watermark::from_micros(0),
            rows_loaded: 10,
            iterations: 1,
            stop_reason,
            error: None,
            metrics: LoadMetrics::default(),
        }
    }

    #[tokio::test]
    async fn test_capped_runs_continue_until_shutdown() {
        let shutdown = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let token = shutdown.clone();
        let counter = calls.clone();
        let result = run_until_shutdown(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let token = token.clone();
                async move {
                    if n < 3 {
                        Ok::<_, LoadError>(outcome(StopReason::Capped))
                    } else {
                        // Signal arrives mid-run; this run still completes.
                        token.cancel();
                        Ok(outcome(StopReason::Exhausted))
                    }
                }
            },
            HOUR,
            shutdown,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_run_starts_after_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        run_until_shutdown(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, LoadError>(outcome(StopReason::Exhausted)) }
            },
            HOUR,
            shutdown,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_the_loop() {
        let result = run_until_shutdown(
            || async {
                Err::<RunOutcome, _>(LoadError::Config(ConfigError::MissingField {
                    field: "load.timestamp_column".to_string(),
                }))
            },
            HOUR,
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
    }
}
