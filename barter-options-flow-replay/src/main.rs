use barter_options_flow::{
    AggregatedWindow, AggregatorConfig, BaselineStorage, BatchSignalEngine, ManualClock,
    MemoryBaselineStorage, PressureSample, SignalConfig, SqliteBaselineStorage, WindowAggregator,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    time::interval,
};
use tracing::{error, info, warn};

/// Samples sharing a `window_start`, processed as one engine cycle
type Cycle = Vec<PressureSample>;

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    // Samples file: first argument, else SAMPLES_PATH
    let Some(samples_path) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SAMPLES_PATH").ok())
    else {
        error!("no samples file given (pass a path or set SAMPLES_PATH)");
        return;
    };

    let signal_config = SignalConfig::from_env();
    let aggregator_config = AggregatorConfig::from_env();
    if let Err(error) = signal_config
        .validate()
        .and_then(|()| aggregator_config.validate())
    {
        error!(%error, "invalid configuration");
        return;
    }

    // Replay time follows the samples, not the wall clock
    let clock = ManualClock::new(Utc::now());

    let engine = match BatchSignalEngine::new(signal_config, open_storage(), Arc::new(clock.clone())) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to build signal engine");
            return;
        }
    };
    let aggregator = Arc::new(WindowAggregator::new(aggregator_config, Arc::new(clock.clone())));
    info!(backend = engine.engine().baseline_backend(), "signal engine ready");

    // Configurable via REPLAY_CHANNEL_SIZE env var (default: 64 cycles)
    let channel_size = std::env::var("REPLAY_CHANNEL_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(64);
    let (tx, rx) = mpsc::channel::<Cycle>(channel_size);

    info!(path = %samples_path, "replaying pressure samples");
    let reader = tokio::spawn(read_cycles(samples_path, tx));
    let stats = tokio::spawn(log_statistics(aggregator.clone()));

    let processor = {
        let aggregator = aggregator.clone();
        tokio::task::spawn_blocking(move || process_cycles(engine, aggregator, clock, rx))
    };

    match reader.await {
        Ok(Ok(samples)) => info!(samples, "finished reading samples"),
        Ok(Err(error)) => error!(%error, "failed to read samples"),
        Err(error) => error!(%error, "sample reader panicked"),
    }

    if let Err(error) = processor.await {
        error!(%error, "signal processor panicked");
    }
    stats.abort();

    info!(statistics = ?aggregator.statistics(), "replay complete");
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// SQLite at FLOW_DB_PATH if set and openable, otherwise in-memory history.
fn open_storage() -> Box<dyn BaselineStorage> {
    let Ok(db_path) = std::env::var("FLOW_DB_PATH") else {
        info!("FLOW_DB_PATH not set, baseline history kept in memory");
        return Box::new(MemoryBaselineStorage::new());
    };

    match SqliteBaselineStorage::open(&db_path) {
        Ok(storage) => {
            info!(path = %db_path, "baseline history in sqlite");
            Box::new(storage)
        }
        Err(error) => {
            warn!(path = %db_path, %error, "failed to open sqlite, falling back to memory");
            Box::new(MemoryBaselineStorage::new())
        }
    }
}

/// Read JSON-lines samples, grouping consecutive samples with the same
/// `window_start` into one cycle. Returns the number of samples read.
async fn read_cycles(path: String, tx: mpsc::Sender<Cycle>) -> std::io::Result<usize> {
    let mut lines = BufReader::new(File::open(&path).await?).lines();
    let mut cycle: Cycle = Vec::new();
    let mut count = 0;
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let sample = match serde_json::from_str::<PressureSample>(&line) {
            Ok(sample) => sample,
            Err(error) => {
                warn!(line = line_number, %error, "skipping malformed sample line");
                continue;
            }
        };
        count += 1;

        if cycle
            .last()
            .is_some_and(|last| last.window_start != sample.window_start)
        {
            if tx.send(std::mem::take(&mut cycle)).await.is_err() {
                warn!("signal processor stopped, abandoning replay");
                return Ok(count);
            }
        }
        cycle.push(sample);
    }

    if !cycle.is_empty() {
        let _ = tx.send(cycle).await;
    }

    Ok(count)
}

fn process_cycles(
    mut engine: BatchSignalEngine<Box<dyn BaselineStorage>>,
    aggregator: Arc<WindowAggregator>,
    clock: ManualClock,
    mut rx: mpsc::Receiver<Cycle>,
) {
    while let Some(cycle) = rx.blocking_recv() {
        if let Some(first) = cycle.first() {
            clock.set(first.window_start);
        }

        for signal in engine.process_batch(&cycle) {
            if let Some(window) = aggregator.add_signal(signal) {
                emit_window(&window);
            }
        }
    }

    if let Err(error) = engine.engine_mut().flush() {
        warn!(%error, "failed to flush baseline history");
    }
    if let Some(window) = aggregator.flush() {
        emit_window(&window);
    }

    let summary = engine.engine().summary();
    info!(
        total_signals = summary.total_signals,
        samples = summary.samples_processed,
        suppressed = summary.samples_suppressed,
        errors = summary.analysis_errors,
        avg_confidence = summary.avg_confidence,
        baseline_degraded = summary.baseline_degraded,
        tracked_contracts = summary.tracked_contracts,
        tracked_strikes = summary.tracked_strikes,
        "signal engine summary"
    );
}

/// Closed windows go to stdout as JSON lines for downstream consumers.
fn emit_window(window: &AggregatedWindow) {
    match serde_json::to_string(window) {
        Ok(json) => println!("{json}"),
        Err(error) => warn!(boundary = %window.boundary, %error, "failed to encode window"),
    }
}

async fn log_statistics(aggregator: Arc<WindowAggregator>) {
    // Configurable via STATS_INTERVAL_SECS env var (default: 10s)
    let mut timer = interval(stats_interval(std::env::var("STATS_INTERVAL_SECS").ok()));

    loop {
        timer.tick().await;
        let stats = aggregator.statistics();
        info!(
            signals = stats.signals_processed,
            windows = stats.windows_created,
            open = stats.current_open_count,
            stored = stats.stored_windows,
            "aggregator statistics"
        );
    }
}

/// Parse-or-default interval, never below one second.
fn stats_interval(value: Option<String>) -> Duration {
    let secs = value
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(10)
        .max(1);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_interval() {
        struct TestCase {
            input: Option<&'static str>,
            expected: Duration,
        }

        let tests = vec![
            TestCase {
                // TC0: unset uses the default
                input: None,
                expected: Duration::from_secs(10),
            },
            TestCase {
                // TC1: zero is clamped to one second
                input: Some("0"),
                expected: Duration::from_secs(1),
            },
            TestCase {
                // TC2: unparsable uses the default
                input: Some("soon"),
                expected: Duration::from_secs(10),
            },
            TestCase {
                // TC3: explicit value
                input: Some("30"),
                expected: Duration::from_secs(30),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = stats_interval(test.input.map(String::from));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
