//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the main crawl loop that coordinates all aspects of
//! the crawling process, including:
//! - Resuming from the checkpoint or seeding the frontier
//! - Dispatching fetch-process cycles to a bounded pool of workers
//! - Requeueing continuation targets and retries
//! - Periodic and final checkpoints
//! - Graceful shutdown and halting on persistence failures
//!
//! The frontier is owned by the main loop alone. Workers receive a leased
//! target and report an outcome; only the main loop pushes, reissues and
//! settles.

use crate::config::{Config, SourceFormat};
use crate::crawler::extractor::Extractors;
use crate::crawler::fetcher::{build_http_client, FetchSettings, HttpFetcher};
use crate::crawler::{FetchResult, Fetcher, Frontier, Lease, Target};
use crate::state::{CycleState, Ledger};
use crate::storage::{
    Checkpoint, CheckpointError, CrawlCounters, RecordStore, RunStatus, SqliteStore,
    StorageError, CHECKPOINT_VERSION,
};
use crate::ScraperError;
use chrono::{Days, NaiveDate, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type SharedStore = Arc<Mutex<Box<dyn RecordStore>>>;

fn lock_store(store: &SharedStore) -> MutexGuard<'_, Box<dyn RecordStore>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a run takes its starting frontier from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Continue from the checkpoint, or from the seeds if there is none
    #[default]
    Resume,
    /// Ignore the checkpoint and start from the seeds
    Fresh,
    /// Start from the seeds with outing listings narrowed to recent dates
    Update,
}

impl StartMode {
    fn ignores_checkpoint(self) -> bool {
        self != Self::Resume
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: CrawlCounters,
    /// Sequence of the latest durable checkpoint
    pub last_checkpoint: Option<u64>,
    /// Targets left in the frontier
    pub pending: usize,
}

/// Per-cycle tallies reported back to the main loop
#[derive(Debug, Default)]
struct CycleProgress {
    next: Vec<Target>,
    written: usize,
    duplicates: usize,
    extraction_errors: usize,
}

#[derive(Debug)]
enum CycleOutcome {
    /// Records persisted (or none were new); continuation targets attached
    Completed(CycleProgress),
    /// Transient failure; the target comes back as its next attempt
    Retry(Target),
    /// Fatal fetch failure or unusable body
    Skipped { extraction_failed: bool },
    /// Detail target whose record is already in the ledger
    Known,
    /// Append failed; the run must halt
    Failed(StorageError),
}

#[derive(Debug)]
struct CycleReport {
    ticket: u64,
    /// Where the cycle's pipeline stopped
    state: CycleState,
    outcome: CycleOutcome,
}

enum LoopEvent {
    Joined(Option<Result<CycleReport, JoinError>>),
    Cancelled,
    Tick,
}

/// Everything a worker needs, cheap to clone
#[derive(Clone)]
struct CycleContext {
    fetcher: Arc<dyn Fetcher>,
    extractors: Arc<Extractors>,
    ledger: Arc<Ledger>,
    store: SharedStore,
    cancel: CancellationToken,
}

impl CycleContext {
    async fn run_cycle(self, lease: Lease) -> CycleReport {
        let Lease { ticket, target } = lease;
        let span = tracing::debug_span!(
            "cycle",
            url = %target.request_url(),
            source = %target.source,
            attempt = target.attempt
        );
        let mut state = CycleState::Idle;
        let outcome = self.process(&target, &mut state).instrument(span).await;
        CycleReport {
            ticket,
            state,
            outcome,
        }
    }

    /// Walks one target through fetch, extract, filter and persist
    async fn process(&self, target: &Target, state: &mut CycleState) -> CycleOutcome {
        if let Some(identity) = &target.identity_hint {
            if !self.ledger.is_new(identity) {
                tracing::debug!(identity = %identity, "Record already stored, skipping detail fetch");
                return CycleOutcome::Known;
            }
        }

        advance(state, CycleState::Fetching);
        let body = match self.fetcher.fetch(target).await {
            FetchResult::Success { body, status, .. } => {
                tracing::debug!(status, bytes = body.len(), "Fetched");
                body
            }
            FetchResult::RetryableFailure { error, retry_after } => {
                advance(state, CycleState::Idle);
                tracing::warn!(
                    error = %error,
                    retry_in_ms = retry_after.as_millis() as u64,
                    "Retryable fetch failure"
                );
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(retry_after) => false,
                    _ = self.cancel.cancelled() => true,
                };
                if interrupted {
                    advance(state, CycleState::ShuttingDown);
                    tracing::debug!("Backoff cut short by shutdown");
                }
                return CycleOutcome::Retry(target.retry());
            }
            FetchResult::FatalFailure { error } => {
                advance(state, CycleState::Idle);
                tracing::warn!(error = %error, "Skipping target");
                return CycleOutcome::Skipped {
                    extraction_failed: false,
                };
            }
        };

        advance(state, CycleState::Extracting);
        let observed_at = Utc::now();
        let extraction = match self.extractors.extract(target, &body, observed_at) {
            Ok(extraction) => extraction,
            Err(e) => {
                advance(state, CycleState::Idle);
                tracing::warn!(error = %e, "Skipping page, body could not be extracted");
                return CycleOutcome::Skipped {
                    extraction_failed: true,
                };
            }
        };
        for skipped in &extraction.skipped {
            tracing::warn!(error = %skipped, "Skipping candidate");
        }

        advance(state, CycleState::Filtering);
        let mut progress = CycleProgress {
            extraction_errors: extraction.skipped.len(),
            ..CycleProgress::default()
        };
        let mut fresh = Vec::new();
        for record in extraction.records {
            if self.ledger.reserve(&record.identity, observed_at) {
                fresh.push(record);
            } else {
                tracing::trace!(identity = %record.identity, "Duplicate");
                progress.duplicates += 1;
            }
        }

        if !fresh.is_empty() {
            advance(state, CycleState::Persisting);
            let identities: Vec<String> = fresh.iter().map(|r| r.identity.clone()).collect();
            let appended = lock_store(&self.store).append(&fresh);
            match appended {
                Ok(written) => {
                    self.ledger.confirm(&identities);
                    progress.written = written;
                    tracing::debug!(written, duplicates = progress.duplicates, "Persisted records");
                }
                Err(e) => {
                    advance(state, CycleState::Idle);
                    self.ledger.release(&identities);
                    tracing::error!(error = %e, records = identities.len(), "Append failed");
                    return CycleOutcome::Failed(e);
                }
            }
        }

        advance(state, CycleState::Requeueing);
        progress.next = extraction.targets;
        CycleOutcome::Completed(progress)
    }
}

fn advance(state: &mut CycleState, next: CycleState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal cycle transition {} -> {}",
        state,
        next
    );
    tracing::trace!(from = %state, to = %next, "Cycle state");
    *state = next;
}

/// Builds the run id: UTC start time plus process id
fn new_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), std::process::id())
}

/// Main crawler coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    config_hash: String,
    store: SharedStore,
    fetcher: Arc<dyn Fetcher>,
    extractors: Arc<Extractors>,
    ledger: Arc<Ledger>,
    frontier: Frontier,
    counters: CrawlCounters,
    /// Sequence of the latest checkpoint written by any run
    sequence: u64,
    last_checkpoint: Option<u64>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `config` - The crawler configuration
    /// * `config_hash` - SHA-256 of the configuration file
    /// * `mode` - Where the starting frontier comes from (the record store is always kept)
    /// * `cancel` - Cancelled on SIGINT/SIGTERM
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Successfully created coordinator
    /// * `Err(ScraperError)` - Data directory, checkpoint or HTTP client unusable
    pub fn new(
        config: Config,
        config_hash: String,
        mode: StartMode,
        cancel: CancellationToken,
    ) -> Result<Self, ScraperError> {
        let store = SqliteStore::open(&config.output.data_dir)?;
        let client = build_http_client(&config.user_agent, config.crawler.timeout())?;
        let fetcher = HttpFetcher::new(client, FetchSettings::from_config(&config));

        Self::with_parts(
            config,
            config_hash,
            mode,
            Box::new(store),
            Arc::new(fetcher),
            cancel,
        )
    }

    /// Creates a coordinator over an explicit store and fetcher
    pub fn with_parts(
        config: Config,
        config_hash: String,
        mode: StartMode,
        store: Box<dyn RecordStore>,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Result<Self, ScraperError> {
        let extractors = Extractors::from_config(&config)?;
        let max_depth = config.crawler.max_depth;

        let checkpoint = match store.load_checkpoint() {
            Ok(checkpoint) => checkpoint,
            Err(e) if mode.ignores_checkpoint() => {
                tracing::warn!(error = %e, ?mode, "Ignoring unreadable checkpoint");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let sequence = checkpoint.as_ref().map_or(0, |c| c.sequence);

        let (frontier, ledger, counters, last_checkpoint) = match checkpoint {
            Some(checkpoint) if !mode.ignores_checkpoint() => {
                if checkpoint.config_hash != config_hash {
                    tracing::warn!(
                        checkpoint_run = %checkpoint.run_id,
                        "Configuration changed since the checkpoint was written"
                    );
                }
                tracing::info!(
                    sequence = checkpoint.sequence,
                    pending = checkpoint.frontier.pending.len(),
                    ledger = checkpoint.ledger.len(),
                    "Resuming from checkpoint"
                );
                (
                    Frontier::restore(checkpoint.frontier, max_depth),
                    Ledger::from_entries(checkpoint.ledger),
                    checkpoint.counters,
                    Some(checkpoint.sequence),
                )
            }
            _ => {
                match mode {
                    StartMode::Resume => {
                        tracing::info!("No checkpoint found, starting from the configured seeds")
                    }
                    StartMode::Fresh => tracing::info!("Starting fresh from the configured seeds"),
                    StartMode::Update => {
                        tracing::info!("Updating from the configured seeds")
                    }
                }
                (
                    seed_frontier(&config, mode, store.as_ref())?,
                    Ledger::new(),
                    CrawlCounters::default(),
                    None,
                )
            }
        };

        // Records durable before the last checkpoint was taken
        let stored = store.identities()?;
        tracing::info!(stored = stored.len(), "Rebuilt ledger from record store");
        ledger.restore(stored);

        Ok(Self {
            config: Arc::new(config),
            config_hash,
            store: Arc::new(Mutex::new(store)),
            fetcher,
            extractors: Arc::new(extractors),
            ledger: Arc::new(ledger),
            frontier,
            counters,
            sequence,
            last_checkpoint,
            cancel,
        })
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn counters(&self) -> CrawlCounters {
        self.counters
    }

    fn store(&self) -> MutexGuard<'_, Box<dyn RecordStore>> {
        lock_store(&self.store)
    }

    fn context(&self) -> CycleContext {
        CycleContext {
            fetcher: Arc::clone(&self.fetcher),
            extractors: Arc::clone(&self.extractors),
            ledger: Arc::clone(&self.ledger),
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
        }
    }

    /// Runs the crawl until the frontier drains, a shutdown is requested,
    /// or a persistence failure halts it
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlReport)` - Completed or gracefully interrupted
    /// * `Err(ScraperError::Halted)` - Append failed; the last good checkpoint is the resume point
    /// * `Err(ScraperError)` - Run bookkeeping or the final checkpoint failed
    pub async fn run(&mut self) -> Result<CrawlReport, ScraperError> {
        let run_id = new_run_id();
        let run = self.store().begin_run(&run_id, &self.config_hash)?;
        let span = tracing::info_span!("run", run_id = %run_id);
        self.crawl(run, run_id.clone()).instrument(span).await
    }

    async fn crawl(&mut self, run: i64, run_id: String) -> Result<CrawlReport, ScraperError> {
        tracing::info!(
            pending = self.frontier.len(),
            workers = self.config.crawler.workers,
            "Starting crawl"
        );

        let workers = self.config.crawler.workers.max(1) as usize;
        let interval_cycles = self.config.checkpoint.interval_cycles;
        let period = Duration::from_secs(self.config.checkpoint.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let context = self.context();
        let cancel = self.cancel.clone();
        let mut tasks: JoinSet<CycleReport> = JoinSet::new();
        let mut halt: Option<StorageError> = None;
        let mut cycles_since_checkpoint = 0u64;
        let mut cancelled = false;

        loop {
            if halt.is_none() {
                while tasks.len() < workers && !cancel.is_cancelled() {
                    let Some(lease) = self.frontier.pop() else {
                        break;
                    };
                    tasks.spawn(context.clone().run_cycle(lease));
                }
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if tasks.is_empty() {
                break;
            }

            let event = tokio::select! {
                joined = tasks.join_next() => LoopEvent::Joined(joined),
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                _ = ticker.tick() => LoopEvent::Tick,
            };

            match event {
                LoopEvent::Joined(Some(joined)) => {
                    if let Some(error) = self.handle_joined(joined) {
                        tracing::error!(error = %error, "Persistence failed, halting crawl");
                        halt.get_or_insert(error);
                    }
                    cycles_since_checkpoint += 1;
                    if halt.is_none() && interval_cycles > 0 && cycles_since_checkpoint >= interval_cycles {
                        self.periodic_checkpoint(run, &run_id);
                        cycles_since_checkpoint = 0;
                        ticker.reset();
                    }
                }
                LoopEvent::Joined(None) => {}
                LoopEvent::Cancelled => {
                    cancelled = true;
                    break;
                }
                LoopEvent::Tick => {
                    if halt.is_none() {
                        self.periodic_checkpoint(run, &run_id);
                        cycles_since_checkpoint = 0;
                    }
                }
            }
        }

        if cancelled {
            if let Some(error) = self.shut_down(&mut tasks).await {
                halt.get_or_insert(error);
            }
        }

        // Leases whose worker panicked
        let abandoned = self.frontier.requeue_in_flight();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Requeued targets of abandoned cycles");
        }

        if let Some(error) = halt {
            if let Err(e) = self.store().finish_run(run, RunStatus::Failed) {
                tracing::error!(error = %e, "Failed to mark run as failed");
            }
            return Err(ScraperError::Halted {
                reason: error.to_string(),
                last_checkpoint: self.last_checkpoint,
            });
        }

        let status = if cancelled {
            RunStatus::Interrupted
        } else if !self.frontier.is_empty() {
            tracing::warn!(
                pending = self.frontier.len(),
                "Crawl stopped with targets left, resume by running again"
            );
            RunStatus::Interrupted
        } else {
            tracing::info!("Frontier is empty, crawl complete");
            RunStatus::Completed
        };

        self.checkpoint(run, &run_id)?;
        self.store().finish_run(run, status)?;

        tracing::info!(
            status = %status,
            cycles = self.counters.cycles,
            fetched = self.counters.fetched,
            written = self.counters.records_written,
            duplicates = self.counters.duplicates,
            skipped = self.counters.skipped,
            visited = self.frontier.visited_count(),
            "Crawl finished"
        );

        Ok(CrawlReport {
            run_id,
            status,
            counters: self.counters,
            last_checkpoint: self.last_checkpoint,
            pending: self.frontier.len(),
        })
    }

    /// Lets in-flight cycles finish within the grace period, then aborts the rest
    async fn shut_down(&mut self, tasks: &mut JoinSet<CycleReport>) -> Option<StorageError> {
        let grace = self.config.crawler.grace();
        tracing::info!(
            in_flight = tasks.len(),
            grace_secs = grace.as_secs(),
            "Shutdown requested, draining workers"
        );

        let deadline = tokio::time::Instant::now() + grace;
        let mut halt = None;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => {
                    if let Some(error) = self.handle_joined(joined) {
                        halt.get_or_insert(error);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(remaining = tasks.len(), "Grace period elapsed, aborting cycles");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(report) = joined {
                            if let Some(error) = self.settle(report) {
                                halt.get_or_insert(error);
                            }
                        }
                    }
                    break;
                }
            }
        }
        halt
    }

    fn handle_joined(&mut self, joined: Result<CycleReport, JoinError>) -> Option<StorageError> {
        match joined {
            Ok(report) => self.settle(report),
            Err(e) => {
                tracing::error!(error = %e, "Worker task failed");
                None
            }
        }
    }

    /// Applies a cycle outcome to the frontier and the counters
    ///
    /// Returns the storage error of a failed cycle.
    fn settle(&mut self, report: CycleReport) -> Option<StorageError> {
        let leased = self.frontier.settle(report.ticket);

        let error = match report.outcome {
            CycleOutcome::Completed(progress) => {
                self.counters.cycles += 1;
                self.counters.fetched += 1;
                self.counters.records_written += progress.written as u64;
                self.counters.duplicates += progress.duplicates as u64;
                self.counters.extraction_errors += progress.extraction_errors as u64;

                let mut queued = 0;
                for next in progress.next {
                    if self.frontier.push(next) {
                        queued += 1;
                    }
                }
                tracing::debug!(queued, pending = self.frontier.len(), "Cycle complete");
                None
            }
            CycleOutcome::Retry(target) => {
                self.counters.cycles += 1;
                self.counters.retries += 1;
                self.frontier.reissue(target);
                None
            }
            CycleOutcome::Skipped { extraction_failed } => {
                self.counters.cycles += 1;
                self.counters.skipped += 1;
                if extraction_failed {
                    self.counters.fetched += 1;
                    self.counters.extraction_errors += 1;
                }
                None
            }
            CycleOutcome::Known => {
                self.counters.cycles += 1;
                self.counters.duplicates += 1;
                None
            }
            CycleOutcome::Failed(error) => {
                if let Some(target) = leased {
                    self.frontier.reissue(target);
                }
                Some(error)
            }
        };

        if error.is_none() {
            self.finish_cycle(report.state);
        }
        error
    }

    /// Final transition of a settled cycle
    ///
    /// `Done` once nothing is pending or in flight, `Idle` otherwise. A
    /// cycle that is already shutting down stays there.
    fn finish_cycle(&self, mut state: CycleState) -> CycleState {
        if state.is_terminal() {
            return state;
        }
        if self.frontier.is_drained() {
            advance(&mut state, CycleState::Done);
        } else if state != CycleState::Idle {
            advance(&mut state, CycleState::Idle);
        }
        state
    }

    /// Checkpoint taken while workers keep running; failures are not fatal
    fn periodic_checkpoint(&mut self, run: i64, run_id: &str) {
        if let Err(e) = self.checkpoint(run, run_id) {
            tracing::error!(
                error = %e,
                last_good = ?self.last_checkpoint,
                "Periodic checkpoint failed, crawl continues"
            );
        }
    }

    fn checkpoint(&mut self, run: i64, run_id: &str) -> Result<u64, CheckpointError> {
        let sequence = self.sequence + 1;
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            sequence,
            written_at: Utc::now(),
            run_id: run_id.to_string(),
            config_hash: self.config_hash.clone(),
            frontier: self.frontier.snapshot(),
            ledger: self.ledger.snapshot(),
            counters: self.counters,
        };

        let mut store = lock_store(&self.store);
        store.write_checkpoint(&checkpoint)?;
        if let Err(e) = store.note_checkpoint(run, sequence) {
            tracing::warn!(error = %e, sequence, "Failed to record checkpoint on the run");
        }
        drop(store);

        self.sequence = sequence;
        self.last_checkpoint = Some(sequence);
        tracing::info!(
            sequence,
            pending = checkpoint.frontier.pending.len(),
            ledger = checkpoint.ledger.len(),
            written = self.counters.records_written,
            "Checkpoint written"
        );
        Ok(sequence)
    }
}

/// Builds the initial frontier from every configured seed
///
/// API seeds start at offset 0 with the source's page size. In update mode
/// outing seeds of API sources also get a `date` window, see [`update_window`].
fn seed_frontier(
    config: &Config,
    mode: StartMode,
    store: &dyn RecordStore,
) -> Result<Frontier, ScraperError> {
    let today = Utc::now().date_naive();
    let mut frontier = Frontier::new(config.crawler.max_depth);
    for source in &config.sources {
        let window = match (mode, source.format) {
            (StartMode::Update, SourceFormat::C2cApi) => update_window(
                store,
                &source.name,
                config.crawler.update_margin_days,
                today,
            )?,
            _ => None,
        };

        for seed in &source.seeds {
            let mut target = Target::seed(&source.name, seed)?;
            if source.format == SourceFormat::C2cApi {
                target = target.with_cursor(0, source.page_size);
            }
            if let Some(window) = &window {
                if target.kind() == "outings" {
                    target = target.with_query_param("date", window);
                }
            }
            frontier.push(target);
        }
    }
    tracing::info!(seeds = frontier.len(), "Seeded frontier");
    Ok(frontier)
}

/// Date filter for an update of `source`: `<start>,<today>`
///
/// `start` is the latest stored outing date minus `margin_days`, so outings
/// published late for recent dates are picked up. `None` when nothing is
/// stored yet, in which case every date is crawled.
fn update_window(
    store: &dyn RecordStore,
    source: &str,
    margin_days: u32,
    today: NaiveDate,
) -> Result<Option<String>, ScraperError> {
    let Some(latest) = store.latest_outing_date(source)? else {
        tracing::info!(source, "No stored outings, updating every date");
        return Ok(None);
    };

    let start = latest
        .checked_sub_days(Days::new(u64::from(margin_days)))
        .unwrap_or(NaiveDate::MIN)
        .min(today);
    let window = format!("{},{}", start.format("%Y-%m-%d"), today.format("%Y-%m-%d"));
    tracing::info!(source, latest = %latest, window = %window, "Updating recent outings");
    Ok(Some(window))
}

/// Runs the main crawl operation
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - SHA-256 of the configuration file
/// * `mode` - Where the starting frontier comes from
/// * `cancel` - Shutdown signal
///
/// # Example
///
/// ```no_run
/// use c2c_scraper::config::load_config_with_hash;
/// use c2c_scraper::crawler::{run_crawl, StartMode};
/// use std::path::Path;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, hash) = load_config_with_hash(Path::new("scraper.toml"))?;
/// let report = run_crawl(config, hash, StartMode::Resume, CancellationToken::new()).await?;
/// println!("{} new records", report.counters.records_written);
/// # Ok(())
/// # }
/// ```
pub async fn run_crawl(
    config: Config,
    config_hash: String,
    mode: StartMode,
    cancel: CancellationToken,
) -> Result<CrawlReport, ScraperError> {
    let mut coordinator = Coordinator::new(config, config_hash, mode, cancel)?;
    coordinator.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CheckpointConfig, CrawlerConfig, OutputConfig, SourceConfig, UserAgentConfig,
    };
    use crate::crawler::enforce_attempt_budget;
    use crate::storage::read_checkpoint;
    use crate::{FatalFetchError, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use tempfile::TempDir;

    const LISTING: &str = "https://api.camptocamp.org/routes";

    /// Scripted fetcher keyed by request URL
    #[derive(Default)]
    struct FakeFetcher {
        scripts: Mutex<HashMap<String, VecDeque<FetchResult>>>,
        requests: Mutex<Vec<String>>,
        max_attempts: u32,
    }

    impl FakeFetcher {
        fn new(max_attempts: u32) -> Self {
            Self {
                max_attempts,
                ..Self::default()
            }
        }

        fn respond(self, url: &str, body: serde_json::Value) -> Self {
            self.script(
                url,
                FetchResult::Success {
                    body: body.to_string(),
                    status: 200,
                    final_url: url::Url::parse(url).unwrap(),
                },
            )
        }

        fn fail(self, url: &str, times: usize) -> Self {
            (0..times).fold(self, |fetcher, _| {
                fetcher.script(
                    url,
                    FetchResult::RetryableFailure {
                        error: TransportError::Status { status: 503 },
                        retry_after: Duration::from_millis(1),
                    },
                )
            })
        }

        fn script(self, url: &str, result: FetchResult) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(result);
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, target: &Target) -> FetchResult {
            let url = target.request_url().to_string();
            self.requests.lock().unwrap().push(url.clone());
            let result = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(FetchResult::FatalFailure {
                    error: FatalFetchError::Status { status: 404 },
                });
            enforce_attempt_budget(result, target, self.max_attempts)
        }
    }

    fn test_config(data_dir: &Path, max_depth: u32, max_attempts: u32) -> Config {
        Config {
            crawler: CrawlerConfig {
                max_depth,
                workers: 2,
                min_request_interval: 100,
                max_attempts,
                request_timeout: 5,
                backoff_base: 1,
                backoff_max: 10,
                shutdown_grace: 1,
                respect_robots: false,
                update_margin_days: 7,
            },
            checkpoint: CheckpointConfig {
                interval_secs: 3600,
                interval_cycles: 1,
            },
            user_agent: UserAgentConfig {
                crawler_name: "TestCrawler".to_string(),
                crawler_version: "1.0".to_string(),
                contact_url: "https://example.com/about".to_string(),
                contact_email: "admin@example.com".to_string(),
            },
            output: OutputConfig {
                data_dir: data_dir.to_path_buf(),
            },
            sources: vec![SourceConfig {
                name: "c2c".to_string(),
                format: SourceFormat::C2cApi,
                seeds: vec![LISTING.to_string()],
                page_size: 2,
                follow_associations: false,
                allowed_hosts: Vec::new(),
                preferred_lang: "fr".to_string(),
                html: None,
            }],
        }
    }

    fn page(offset: u64) -> String {
        format!("{}?offset={}&limit=2", LISTING, offset)
    }

    fn docs(total: u64, ids: &[u64]) -> serde_json::Value {
        let documents: Vec<_> = ids.iter().map(|id| json!({"document_id": id})).collect();
        json!({"total": total, "documents": documents})
    }

    fn coordinator(config: Config, store: SqliteStore, fetcher: Arc<FakeFetcher>) -> Coordinator {
        Coordinator::with_parts(
            config,
            "hash".to_string(),
            StartMode::Resume,
            Box::new(store),
            fetcher,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_crawl_follows_pagination() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(5)
                .respond(&page(0), docs(3, &[1, 2]))
                .respond(&page(2), docs(3, &[3])),
        );
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 5, 5), store, fetcher.clone());

        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.counters.records_written, 3);
        assert_eq!(report.counters.fetched, 2);
        assert_eq!(coordinator.store().count_records().unwrap(), 3);
        assert_eq!(fetcher.requests(), vec![page(0), page(2)]);

        let checkpoint = read_checkpoint(dir.path()).unwrap().unwrap();
        assert!(checkpoint.frontier.pending.is_empty());
        assert_eq!(checkpoint.ledger.len(), 3);
        assert_eq!(Some(checkpoint.sequence), report.last_checkpoint);
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(5).fail(&page(0), 3).respond(&page(0), docs(2, &[1, 2])));
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 5, 5), store, fetcher.clone());

        let report = coordinator.run().await.unwrap();

        assert_eq!(fetcher.requests().len(), 4);
        assert_eq!(report.counters.retries, 3);
        assert_eq!(report.counters.records_written, 2);
        assert_eq!(report.counters.skipped, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(2).fail(&page(0), 3).respond(&page(0), docs(2, &[1, 2])));
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 5, 2), store, fetcher.clone());

        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(fetcher.requests().len(), 2);
        assert_eq!(report.counters.retries, 1);
        assert_eq!(report.counters.skipped, 1);
        assert_eq!(coordinator.store().count_records().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_depth_guard() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(5)
                .respond(&page(0), docs(10, &[1, 2]))
                .respond(&page(2), docs(10, &[3, 4]))
                .respond(&page(4), docs(10, &[5, 6])),
        );
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 1, 5), store, fetcher.clone());

        let report = coordinator.run().await.unwrap();

        assert_eq!(fetcher.requests(), vec![page(0), page(2)]);
        assert_eq!(report.counters.records_written, 4);
    }

    #[tokio::test]
    async fn test_duplicates_across_pages_are_written_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(5)
                .respond(&page(0), docs(4, &[1, 2]))
                .respond(&page(2), docs(4, &[2, 1])),
        );
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 5, 5), store, fetcher);

        let report = coordinator.run().await.unwrap();

        assert_eq!(report.counters.records_written, 2);
        assert_eq!(report.counters.duplicates, 2);
        assert_eq!(coordinator.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_error_halts_at_last_checkpoint() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(5)
                .respond(&page(0), docs(4, &[1, 2]))
                .respond(&page(2), docs(4, &[3, 4])),
        );
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_four BEFORE INSERT ON records
                 WHEN NEW.document_id = '4'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let mut config = test_config(dir.path(), 5, 5);
        config.crawler.workers = 1;
        let mut coordinator = coordinator(config, store, fetcher);

        let err = coordinator.run().await.unwrap_err();

        match err {
            ScraperError::Halted { last_checkpoint, .. } => assert_eq!(last_checkpoint, Some(1)),
            other => panic!("expected Halted, got {:?}", other),
        }

        // Record 3 shared the failed transaction
        assert_eq!(coordinator.store().count_records().unwrap(), 2);
        assert!(coordinator.ledger().is_new("api.camptocamp.org/routes/3"));
        assert_eq!(coordinator.ledger().pending(), 0);

        let checkpoint = read_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 1);
        assert_eq!(checkpoint.frontier.pending.len(), 1);
        assert_eq!(checkpoint.frontier.pending[0].request_url().as_str(), page(2));
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(5).respond(&page(0), docs(4, &[1, 2])));
        let store = SqliteStore::open(dir.path()).unwrap();
        let mut first = coordinator(test_config(dir.path(), 5, 5), store, fetcher);
        first.run().await.unwrap();
        drop(first);

        // page(2) answered 404 in the first run; nothing is left to do
        let fetcher = Arc::new(FakeFetcher::new(5));
        let store = SqliteStore::open(dir.path()).unwrap();
        let mut second = coordinator(test_config(dir.path(), 5, 5), store, fetcher.clone());
        assert!(!second.ledger().is_new("api.camptocamp.org/routes/1"));
        assert!(second.frontier().is_drained());

        let report = second.run().await.unwrap();
        assert!(fetcher.requests().is_empty());
        assert_eq!(report.counters.records_written, 2);
    }

    /// Fetcher whose every call panics
    struct PanickingFetcher;

    #[async_trait]
    impl Fetcher for PanickingFetcher {
        async fn fetch(&self, _target: &Target) -> FetchResult {
            panic!("fetcher bug")
        }
    }

    #[tokio::test]
    async fn test_abandoned_cycle_is_not_completed() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let mut coordinator = Coordinator::with_parts(
            test_config(dir.path(), 5, 5),
            "hash".to_string(),
            StartMode::Resume,
            Box::new(store),
            Arc::new(PanickingFetcher),
            CancellationToken::new(),
        )
        .unwrap();

        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.pending, 1);
        let runs = SqliteStore::open(dir.path()).unwrap().recent_runs(1).unwrap();
        assert_eq!(runs[0].status, RunStatus::Interrupted);

        let checkpoint = read_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(checkpoint.frontier.pending.len(), 1);
        assert_eq!(checkpoint.frontier.pending[0].request_url().as_str(), page(0));
        assert!(checkpoint.frontier.visited.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_backoff_shuts_cycle_down() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(5).script(
            &page(0),
            FetchResult::RetryableFailure {
                error: TransportError::Status { status: 503 },
                retry_after: Duration::from_secs(600),
            },
        ));
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        let mut coordinator = Coordinator::with_parts(
            test_config(dir.path(), 5, 5),
            "hash".to_string(),
            StartMode::Resume,
            Box::new(store),
            fetcher,
            cancel.clone(),
        )
        .unwrap();

        let lease = coordinator.frontier.pop().unwrap();
        cancel.cancel();
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.context().run_cycle(lease),
        )
        .await
        .unwrap();

        assert_eq!(report.state, CycleState::ShuttingDown);
        assert!(matches!(&report.outcome, CycleOutcome::Retry(next) if next.attempt == 1));

        // The retry goes back to the frontier and the cycle stays shut down
        assert!(coordinator.settle(report).is_none());
        assert_eq!(coordinator.frontier.len(), 1);
        assert_eq!(
            coordinator.finish_cycle(CycleState::ShuttingDown),
            CycleState::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_last_cycle_reaches_done() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(5).respond(&page(0), docs(2, &[1, 2])));
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let mut coordinator = coordinator(test_config(dir.path(), 5, 5), store, fetcher);

        let lease = coordinator.frontier.pop().unwrap();
        // Still leased, so the crawl is not done yet
        assert_eq!(coordinator.finish_cycle(CycleState::Requeueing), CycleState::Idle);

        let report = coordinator.context().run_cycle(lease).await;
        assert_eq!(report.state, CycleState::Requeueing);
        assert!(coordinator.settle(report).is_none());
        assert!(coordinator.frontier.is_drained());
        assert_eq!(coordinator.finish_cycle(CycleState::Requeueing), CycleState::Done);
        assert_eq!(coordinator.finish_cycle(CycleState::Idle), CycleState::Done);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_keeps_seeds() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(5));
        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        let mut coordinator = Coordinator::with_parts(
            test_config(dir.path(), 5, 5),
            "hash".to_string(),
            StartMode::Resume,
            Box::new(store),
            fetcher.clone(),
            cancel.clone(),
        )
        .unwrap();

        cancel.cancel();
        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert!(fetcher.requests().is_empty());
        let checkpoint = read_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(checkpoint.frontier.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_known_detail_is_not_fetched() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), 5, 5);
        config.sources[0].seeds = vec!["https://api.camptocamp.org/outings".to_string()];
        config.sources[0].follow_associations = true;

        let outings = "https://api.camptocamp.org/outings?offset=0&limit=2";
        let fetcher = Arc::new(
            FakeFetcher::new(5)
                .respond(
                    outings,
                    json!({"total": 1, "documents": [{
                        "document_id": 10,
                        "date_start": "2024-01-12",
                        "associations": {"routes": [{"document_id": 7}]}
                    }]}),
                ),
        );

        let store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let known = crate::crawler::Record::new(
            &Target::seed("c2c", "https://api.camptocamp.org/routes/7").unwrap(),
            "routes",
            "7",
            serde_json::Map::new(),
            Utc::now(),
        );
        let mut boxed: Box<dyn RecordStore> = Box::new(store);
        boxed.append(&[known]).unwrap();

        let mut coordinator = Coordinator::with_parts(
            config,
            "hash".to_string(),
            StartMode::Resume,
            boxed,
            fetcher.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        let report = coordinator.run().await.unwrap();
        assert_eq!(fetcher.requests(), vec![outings.to_string()]);
        assert_eq!(report.counters.records_written, 1);
        assert_eq!(report.counters.duplicates, 1);
    }

    fn stored_outing(store: &mut SqliteStore, id: &str, date_start: &str) {
        let target = Target::seed("c2c", "https://api.camptocamp.org/outings").unwrap();
        let mut fields = serde_json::Map::new();
        fields.insert("date_start".to_string(), json!(date_start));
        let record = crate::crawler::Record::new(&target, "outings", id, fields, Utc::now());
        store.append(&[record]).unwrap();
    }

    #[test]
    fn test_update_window() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::new_in_memory(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();

        assert_eq!(update_window(&store, "c2c", 7, today).unwrap(), None);

        stored_outing(&mut store, "1", "2024-05-02");
        stored_outing(&mut store, "2", "2024-06-10");
        assert_eq!(
            update_window(&store, "c2c", 7, today).unwrap().as_deref(),
            Some("2024-06-03,2024-06-30")
        );
        assert_eq!(
            update_window(&store, "c2c", 0, today).unwrap().as_deref(),
            Some("2024-06-10,2024-06-30")
        );

        // Dates in the future never push the window past today
        stored_outing(&mut store, "3", "2024-12-24");
        assert_eq!(
            update_window(&store, "c2c", 7, today).unwrap().as_deref(),
            Some("2024-06-30,2024-06-30")
        );
    }

    #[test]
    fn test_update_seeds_only_outing_listings() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::new_in_memory(dir.path()).unwrap();
        stored_outing(&mut store, "1", "2024-06-10");

        let mut config = test_config(dir.path(), 5, 5);
        config.sources[0].seeds = vec![
            "https://api.camptocamp.org/outings?date=2000-01-01,2000-12-31".to_string(),
            LISTING.to_string(),
        ];

        let mut frontier = seed_frontier(&config, StartMode::Update, &store).unwrap();
        let outings = frontier.pop().unwrap().target;
        let routes = frontier.pop().unwrap().target;

        let dates: Vec<String> = outings
            .url
            .query_pairs()
            .filter(|(k, _)| k == "date")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(dates.len(), 1);
        assert!(dates[0].starts_with("2024-06-03,"));
        assert!(routes.url.query().is_none());

        let mut resumed = seed_frontier(&config, StartMode::Resume, &store).unwrap();
        let untouched = resumed.pop().unwrap().target;
        assert_eq!(untouched.url.query(), Some("date=2000-01-01,2000-12-31"));
    }
}
