use std::time::Instant;

use lambda_runtime::{Error, LambdaEvent, service_fn};
use load_core::loader::Plan;
use load_core::telemetry::init_tracing;
use load_core::{
    LoadConfig, RunOutcome, StopReason, Watermark, load_config, plan_incremental_load,
    run_incremental_load,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// One invocation runs one incremental load. The scheduler that triggers
/// the function re-invokes it; a `capped` response means it should do so
/// soon.
async fn lambda_handler(event: LambdaEvent<LoadRequest>) -> Result<LoadResponse, Error> {
    let start_time = Instant::now();
    let request = event.payload;

    let config = match load_config(request.config_path.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            let error_msg = format!("Failed to load configuration: {}", e);
            error!("{}", error_msg);
            return Ok(LoadResponse::failed(error_msg, start_time));
        }
    };

    Ok(handle(&config, request.dry_run.unwrap_or(false), start_time).await)
}

async fn handle(config: &LoadConfig, dry_run: bool, start_time: Instant) -> LoadResponse {
    if dry_run {
        return match plan_incremental_load(config).await {
            Ok(plan) => {
                info!("DRY RUN: next batch would hold {} rows", plan.next_batch_rows);
                LoadResponse::planned(plan, start_time)
            }
            Err(e) => {
                let error_msg = format!("Dry run failed: {}", e);
                error!("{}", error_msg);
                LoadResponse::failed(error_msg, start_time)
            }
        };
    }

    match run_incremental_load(config).await {
        Ok(outcome) => LoadResponse::from_outcome(outcome, start_time),
        Err(e) => {
            let error_msg = format!("Load could not start: {}", e);
            error!("{}", error_msg);
            LoadResponse::failed(error_msg, start_time)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();
    lambda_runtime::run(service_fn(lambda_handler)).await
}

#[derive(Debug, Default, Deserialize)]
struct LoadRequest {
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

#[derive(Debug, Serialize)]
struct LoadResponse {
    pub status: String,
    pub rows_loaded: u64,
    pub iterations: u32,
    pub initial_watermark: Option<Watermark>,
    pub final_watermark: Option<Watermark>,
    pub stop_reason: Option<StopReason>,
    pub pending_rows: Option<usize>,
    pub runtime_seconds: f64,
    pub errors: Vec<String>,
}

impl LoadResponse {
    fn empty(status: &str, start_time: Instant) -> Self {
        Self {
            status: status.to_string(),
            rows_loaded: 0,
            iterations: 0,
            initial_watermark: None,
            final_watermark: None,
            stop_reason: None,
            pending_rows: None,
            runtime_seconds: start_time.elapsed().as_secs_f64(),
            errors: vec![],
        }
    }

    fn failed(error_msg: String, start_time: Instant) -> Self {
        Self {
            errors: vec![error_msg],
            ..Self::empty("error", start_time)
        }
    }

    fn planned(plan: Plan, start_time: Instant) -> Self {
        Self {
            initial_watermark: Some(plan.watermark),
            final_watermark: plan.next_batch_max,
            pending_rows: Some(plan.next_batch_rows),
            ..Self::empty("dry_run", start_time)
        }
    }

    fn from_outcome(outcome: RunOutcome, start_time: Instant) -> Self {
        let status = match outcome.stop_reason {
            StopReason::Exhausted => "success",
            StopReason::Capped => "capped",
            StopReason::Failed => "error",
        };
        Self {
            rows_loaded: outcome.rows_loaded,
            iterations: outcome.iterations,
            initial_watermark: Some(outcome.initial_watermark),
            final_watermark: Some(outcome.final_watermark),
            stop_reason: Some(outcome.stop_reason),
            errors: outcome.error.into_iter().map(|e| e.message).collect(),
            ..Self::empty(status, start_time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use load_core::loader::RunError;
    use load_core::telemetry::LoadMetrics;

    fn outcome(stop_reason: StopReason, error: Option<RunError>) -> RunOutcome {
        RunOutcome {
            initial_watermark: Watermark::FLOOR,
            final_watermark: "2020-01-03T00:00:00".parse().unwrap(),
            rows_loaded: 42,
            iterations: 1,
            stop_reason,
            error,
            metrics: LoadMetrics::default(),
        }
    }

    #[test]
    fn test_request_fields_are_optional() {
        let request: LoadRequest = serde_json::from_str("{}").unwrap();
        assert!(request.config_path.is_none());
        assert!(request.dry_run.is_none());
    }

    #[test]
    fn test_capped_outcome_is_not_an_error() {
        let response = LoadResponse::from_outcome(outcome(StopReason::Capped, None), Instant::now());
        assert_eq!(response.status, "capped");
        assert!(response.errors.is_empty());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["stop_reason"], "capped");
        assert_eq!(json["final_watermark"], "2020-01-03T00:00:00");
    }

    #[test]
    fn test_failed_outcome_reports_message() {
        let error = RunError {
            message: "Sink error: timeout".to_string(),
            retryable: true,
        };
        let response =
            LoadResponse::from_outcome(outcome(StopReason::Failed, Some(error)), Instant::now());
        assert_eq!(response.status, "error");
        assert_eq!(response.rows_loaded, 42);
        assert_eq!(response.errors, vec!["Sink error: timeout".to_string()]);
    }
}
