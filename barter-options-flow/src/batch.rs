use crate::{
    baseline::{BaselineContext, BaselineStorage},
    clock::Clock,
    config::SignalConfig,
    engine::{self, Evaluation, PipelineStage, SignalEngine},
    error::FlowError,
    market_making::{self, StrikeActivity},
    pressure,
    types::{InstitutionalSignal, PressureSample},
};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use std::sync::Arc;
use tracing::debug;

/// Everything a worker needs to score one sample without touching shared state.
#[derive(Debug)]
struct ScoringTask<'a> {
    index: usize,
    sample: &'a PressureSample,
    context: BaselineContext,
    history: Vec<f64>,
    activity: Vec<StrikeActivity>,
}

/// [`SignalEngine`] that scores large batches on a dedicated worker pool.
///
/// Stateful steps (baseline writes, pressure history, strike activity) run
/// sequentially in input order; only the pure scoring is fanned out. Output
/// order always matches input order and a failing sample only drops itself.
pub struct BatchSignalEngine<S> {
    engine: SignalEngine<S>,
    pool: ThreadPool,
}

impl<S> std::fmt::Debug for BatchSignalEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSignalEngine")
            .field("engine", &self.engine)
            .field("worker_threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl<S: BaselineStorage> BatchSignalEngine<S> {
    pub fn new(config: SignalConfig, storage: S, clock: Arc<dyn Clock>) -> Result<Self, FlowError> {
        config.validate()?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.batch.worker_threads)
            .thread_name(|index| format!("flow-scorer-{index}"))
            .build()
            .map_err(|error| FlowError::InvalidConfig(format!("worker pool: {error}")))?;

        Ok(Self {
            engine: SignalEngine::new(config, storage, clock),
            pool,
        })
    }

    /// Process a batch, returning the emitted signals in input order.
    pub fn process_batch(&mut self, samples: &[PressureSample]) -> Vec<InstitutionalSignal> {
        if samples.len() < self.engine.config().batch.parallel_threshold {
            return samples
                .iter()
                .filter_map(|sample| self.engine.process_sample(sample))
                .collect();
        }

        debug!(
            samples = samples.len(),
            workers = self.pool.current_num_threads(),
            "scoring batch in parallel"
        );
        self.engine.count_processed(samples.len() as u64);

        let mut outcomes: Vec<Option<(PipelineStage, Result<Evaluation, FlowError>)>> =
            (0..samples.len()).map(|_| None).collect();

        let mut valid = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            match sample.validate() {
                Ok(()) => valid.push(index),
                Err(error) => outcomes[index] = Some((PipelineStage::Idle, Err(error))),
            }
        }

        // Baselines are resolved before any of this batch's rows are recorded
        let (_, baseline, ..) = self.engine.parts_mut();
        let keys: Vec<_> = valid.iter().map(|&index| samples[index].key()).collect();
        let contexts = baseline.contexts(&keys);
        for &index in &valid {
            baseline.record(&samples[index]);
        }

        let (config, _, analyzer, detector, scorer) = self.engine.parts_mut();
        let mut tasks = Vec::with_capacity(valid.len());
        for index in valid {
            let sample = &samples[index];
            if let Some(suppression) = engine::activity_gate(config, sample) {
                outcomes[index] = Some((PipelineStage::BaselineUpdated, Ok(Err(suppression))));
                continue;
            }

            let Some(context) = contexts.get(&sample.key()).cloned() else {
                outcomes[index] = Some((
                    PipelineStage::BaselineUpdated,
                    Err(FlowError::Analysis(format!("no baseline resolved for {}", sample.key()))),
                ));
                continue;
            };

            tasks.push(ScoringTask {
                index,
                sample,
                context,
                history: analyzer.record(sample),
                activity: detector.record(sample),
            });
        }

        let scored: Vec<(usize, Result<Evaluation, FlowError>)> = self.pool.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let pressure = pressure::analyze_history(&config.pressure, task.sample, &task.history);
                    let market_making =
                        market_making::analyze_activity(&config.market_making, task.sample, &task.activity);
                    let result = engine::evaluate(
                        config,
                        scorer,
                        task.sample,
                        &task.context,
                        &pressure,
                        market_making,
                    );
                    (task.index, result)
                })
                .collect()
        });

        for (index, result) in scored {
            outcomes[index] = Some((PipelineStage::MarketMakingChecked, result));
        }

        samples
            .iter()
            .zip(outcomes)
            .filter_map(|(sample, outcome)| {
                let (stage, result) = outcome?;
                self.engine.conclude(sample, stage, result)
            })
            .collect()
    }

    pub fn engine(&self) -> &SignalEngine<S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SignalEngine<S> {
        &mut self.engine
    }

    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}
