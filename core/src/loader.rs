//! Loop Controller.
//!
//! Runs Fetch -> Write -> Advance cycles one at a time until the source is
//! exhausted or the iteration cap is reached. Nothing is persisted besides
//! the rows themselves: a failed or capped run is resumed by running again,
//! which re-derives the watermark from the sink.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::fetch_batch;
use crate::config::{LoadConfig, LoadSettings};
use crate::errors::{ConfigError, LoadError};
use crate::sink::delta::DeltaSink;
use crate::sink::{Sink, WriteMode};
use crate::source::Source;
use crate::source::postgres::PostgresSource;
use crate::telemetry::LoadMetrics;
use crate::watermark::{self, Watermark};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A batch came back smaller than `batch_size`; nothing is left after
    /// the final watermark.
    Exhausted,
    /// `max_iterations` batches were written; more rows may remain.
    Capped,
    /// An iteration failed. Everything before it is durable.
    Failed,
}

/// Progress of one run, threaded through each iteration by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub watermark: Watermark,
    /// Batches written so far.
    pub iteration: u32,
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Iterating(RunState),
    Done(RunState),
    Capped(RunState),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub initial_watermark: Watermark,
    pub final_watermark: Watermark,
    pub rows_loaded: u64,
    pub iterations: u32,
    pub stop_reason: StopReason,
    pub error: Option<RunError>,
    pub metrics: LoadMetrics,
}

impl RunOutcome {
    /// True when the sink has caught up with the source.
    pub fn is_caught_up(&self) -> bool {
        self.stop_reason == StopReason::Exhausted
    }
}

/// Result of a dry run: what the next run would start from and load first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub watermark: Watermark,
    pub next_batch_rows: usize,
    pub next_batch_max: Option<Watermark>,
    /// The first batch is full, so at least one more would follow.
    pub more_pending: bool,
}

struct Start {
    watermark: Watermark,
    initialize: bool,
}

struct Step {
    watermark: Watermark,
    rows: usize,
}

pub struct IncrementalLoader<S, K> {
    source: S,
    sink: K,
    settings: LoadSettings,
}

impl<S: Source, K: Sink> IncrementalLoader<S, K> {
    pub fn new(source: S, sink: K, settings: LoadSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            source,
            sink,
            settings,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    fn column(&self) -> &str {
        &self.settings.timestamp_column
    }

    /// `Init`: where this run starts, and whether the first batch
    /// recreates the target.
    ///
    /// `recreate_target` only applies to a first-ever population, i.e. a
    /// sink that is missing or empty. Once the target holds rows every run
    /// resumes from them.
    async fn start(&self, metrics: &mut LoadMetrics) -> Result<Start, LoadError> {
        metrics.record_watermark_query();
        let watermark = watermark::resolve(&self.sink, self.column()).await?;
        if !self.settings.recreate_target {
            return Ok(Start {
                watermark,
                initialize: false,
            });
        }

        // The floor is only resolved for a missing or empty sink.
        let initialize = watermark == Watermark::FLOOR;
        if initialize {
            info!(
                "recreate_target is set and {} holds no rows, first batch recreates it",
                self.sink.name()
            );
        } else {
            warn!(
                "recreate_target is set but {} already holds rows up to {}; appending instead of recreating",
                self.sink.name(),
                watermark
            );
        }
        Ok(Start {
            watermark,
            initialize,
        })
    }

    async fn iterate(
        &self,
        state: RunState,
        initialize: bool,
        metrics: &mut LoadMetrics,
    ) -> Result<Step, LoadError> {
        let batch = fetch_batch(
            &self.source,
            self.column(),
            state.watermark,
            self.settings.batch_size,
        )
        .await?;
        metrics.record_fetch(batch.len());

        if batch.is_empty() {
            return Ok(Step {
                watermark: state.watermark,
                rows: 0,
            });
        }

        let rows = batch.len();
        let mode = if state.iteration == 0 && initialize {
            WriteMode::Initialize
        } else {
            WriteMode::Append
        };
        let result = self.sink.write(batch.records, mode).await?;
        metrics.record_write(result.rows_written);

        metrics.record_watermark_query();
        let next = watermark::advance(&self.sink, self.column(), state.watermark).await?;
        if let Some(batch_max) = batch.max {
            if batch_max != next {
                warn!(
                    "Sink watermark {} differs from batch max {} after write",
                    next, batch_max
                );
            }
        }

        Ok(Step {
            watermark: next,
            rows,
        })
    }

    fn transition(&self, state: RunState, step: Step) -> LoopState {
        if step.rows == 0 {
            return LoopState::Done(state);
        }

        let next = RunState {
            watermark: step.watermark,
            iteration: state.iteration + 1,
            rows_loaded: state.rows_loaded + step.rows as u64,
        };

        info!(
            "Iteration {}/{}: loaded {} rows from {}, watermark {} -> {}",
            next.iteration,
            self.settings.max_iterations,
            step.rows,
            self.source.name(),
            state.watermark,
            next.watermark
        );

        if step.rows < self.settings.batch_size {
            LoopState::Done(next)
        } else if next.iteration >= self.settings.max_iterations {
            LoopState::Capped(next)
        } else {
            LoopState::Iterating(next)
        }
    }

    /// Runs one incremental load.
    ///
    /// `Err` is only returned when the run cannot start. Failures inside an
    /// iteration end the run with [`StopReason::Failed`] and the last
    /// durable watermark.
    pub async fn run(&self) -> Result<RunOutcome, LoadError> {
        let mut metrics = LoadMetrics::default();
        let mut state = LoopState::Init;
        let mut initial_watermark = Watermark::FLOOR;
        let mut initialize = false;

        loop {
            state = match state {
                LoopState::Init => {
                    let start = self.start(&mut metrics).await?;
                    initial_watermark = start.watermark;
                    initialize = start.initialize;
                    info!(
                        "Starting load {} -> {} after {}",
                        self.source.name(),
                        self.sink.name(),
                        initial_watermark
                    );
                    LoopState::Iterating(RunState {
                        watermark: initial_watermark,
                        iteration: 0,
                        rows_loaded: 0,
                    })
                }
                LoopState::Iterating(current) => match self
                    .iterate(current, initialize, &mut metrics)
                    .await
                {
                    Ok(step) => self.transition(current, step),
                    Err(e) => {
                        error!(
                            "Iteration {} failed at watermark {}: {}",
                            current.iteration + 1,
                            current.watermark,
                            e
                        );
                        return Ok(self.outcome(
                            initial_watermark,
                            current,
                            StopReason::Failed,
                            Some(RunError {
                                message: e.to_string(),
                                retryable: e.is_retryable(),
                            }),
                            metrics,
                        ));
                    }
                },
                LoopState::Done(last) => {
                    info!(
                        "Source exhausted after {} iterations, {} rows loaded, watermark {}",
                        last.iteration, last.rows_loaded, last.watermark
                    );
                    return Ok(self.outcome(
                        initial_watermark,
                        last,
                        StopReason::Exhausted,
                        None,
                        metrics,
                    ));
                }
                LoopState::Capped(last) => {
                    warn!(
                        "Reached max_iterations ({}) with {} rows loaded, watermark {}; more rows may remain",
                        self.settings.max_iterations, last.rows_loaded, last.watermark
                    );
                    return Ok(self.outcome(
                        initial_watermark,
                        last,
                        StopReason::Capped,
                        None,
                        metrics,
                    ));
                }
            };
        }
    }

    /// Dry run: resolves the watermark and reads the first pending batch
    /// without writing it.
    pub async fn plan(&self) -> Result<Plan, LoadError> {
        let mut metrics = LoadMetrics::default();
        let watermark = self.start(&mut metrics).await?.watermark;
        let batch = fetch_batch(
            &self.source,
            self.column(),
            watermark,
            self.settings.batch_size,
        )
        .await?;

        Ok(Plan {
            watermark,
            next_batch_rows: batch.len(),
            next_batch_max: batch.max,
            more_pending: batch.len() == self.settings.batch_size,
        })
    }

    fn outcome(
        &self,
        initial_watermark: Watermark,
        last: RunState,
        stop_reason: StopReason,
        error: Option<RunError>,
        metrics: LoadMetrics,
    ) -> RunOutcome {
        RunOutcome {
            initial_watermark,
            final_watermark: last.watermark,
            rows_loaded: last.rows_loaded,
            iterations: last.iteration,
            stop_reason,
            error,
            metrics,
        }
    }
}

async fn connect(
    config: &LoadConfig,
) -> Result<IncrementalLoader<PostgresSource, DeltaSink>, LoadError> {
    config.validate()?;
    let source = PostgresSource::connect(&config.source.options).await?;
    let sink = DeltaSink::from_options(&config.sink.options);
    Ok(IncrementalLoader::new(source, sink, config.load.clone())?)
}

/// Entry point: validate `config`, connect to the source and target, run
/// one incremental load.
pub async fn run_incremental_load(config: &LoadConfig) -> Result<RunOutcome, LoadError> {
    connect(config).await?.run().await
}

/// Entry point for dry runs. Nothing is written.
pub async fn plan_incremental_load(config: &LoadConfig) -> Result<Plan, LoadError> {
    connect(config).await?.plan().await
}
