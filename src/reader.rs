use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::ReadConfig;
use crate::error::{ReaderError, SubmitFailure};

/// Fixed backoff between submission retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(2000);

/// Closed interval of post numbers, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub start: u32,
    pub end: u32,
}

impl ReadRange {
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ReadRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Server-side view of a topic: read cursor plus total addressable posts.
#[derive(Debug, Clone, Copy)]
pub struct TopicState {
    /// `last_read_post_number` as reported by the server, if any.
    pub last_read: Option<u32>,
    pub total_posts: u32,
}

impl TopicState {
    /// First post to dwell on. Resuming continues at the post after the
    /// server-side cursor, so a fully-read topic yields nothing to do;
    /// otherwise reading starts over from post 1.
    pub fn effective_start(&self, start_from_current: bool) -> u32 {
        if start_from_current {
            self.last_read.map_or(1, |n| n + 1)
        } else {
            1
        }
    }
}

/// Lazily slices `[cursor, end]` into contiguous batches of random size.
/// Yields nothing when the start position is already past the end.
#[derive(Debug)]
pub struct BatchPlan {
    cursor: u32,
    end: u32,
    min_size: u32,
    max_size: u32,
}

impl BatchPlan {
    pub fn new(start: u32, end: u32, config: &ReadConfig) -> Result<Self, ReaderError> {
        config.validate()?;
        Ok(Self {
            cursor: start,
            end,
            min_size: config.min_req_size,
            max_size: config.max_req_size,
        })
    }

    pub fn next_range<R: Rng>(&mut self, rng: &mut R) -> Option<ReadRange> {
        if self.cursor > self.end {
            return None;
        }
        let size = rng.gen_range(self.min_size..=self.max_size);
        let batch_end = (self.cursor + size - 1).min(self.end);
        let range = ReadRange {
            start: self.cursor,
            end: batch_end,
        };
        self.cursor = batch_end + 1;
        Some(range)
    }
}

/// One timings request: per-post dwell times plus the batch aggregate.
#[derive(Debug, Clone)]
pub struct TimingsPayload {
    pub topic_id: u64,
    /// Post number -> dwell time in milliseconds.
    pub timings: BTreeMap<u32, u32>,
    /// Total simulated engagement for the batch. This is the exact sum of
    /// the per-post draws, not an independent redraw.
    pub topic_time: u64,
}

/// Draws one dwell per post uniformly in `[min_read_time, max_read_time]`.
pub fn synthesize_timings<R: Rng>(
    topic_id: u64,
    range: ReadRange,
    config: &ReadConfig,
    rng: &mut R,
) -> TimingsPayload {
    let mut timings = BTreeMap::new();
    let mut topic_time: u64 = 0;
    for post in range.start..=range.end {
        let dwell = rng.gen_range(config.min_read_time..=config.max_read_time);
        topic_time += u64::from(dwell);
        timings.insert(post, dwell);
    }
    TimingsPayload {
        topic_id,
        timings,
        topic_time,
    }
}

/// Progress shown after each batch, rounded to two decimals.
pub fn percent_complete(end: u32, total: u32) -> f64 {
    (f64::from(end) / f64::from(total) * 10_000.0).round() / 100.0
}

/// Cooperative stop flag flipped by the Ctrl-C watcher. The driver checks
/// it before every submission and never mid-flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Performs the actual network submission of one batch. A trait so the
/// driver can be exercised without a server.
#[async_trait]
pub trait TimingsSink {
    async fn submit(&self, payload: &TimingsPayload) -> Result<(), SubmitFailure>;
}

/// Per-batch attempt lifecycle.
#[derive(Debug)]
enum BatchState {
    Pending,
    Submitting { attempt: u32 },
    Retrying { attempt: u32, reason: String },
    Acked,
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct BatchRecord {
    pub range: ReadRange,
    pub percent: f64,
}

/// What one topic read accomplished. Empty `batches` means there was
/// nothing left to read.
#[derive(Debug, Default)]
pub struct ReadSummary {
    pub batches: Vec<BatchRecord>,
}

/// Drives one topic from its current read position to the end: slice into
/// batches, synthesize dwell times, submit with bounded retry, pace like a
/// person actually scrolling.
pub struct TopicReader<'a, S, R> {
    sink: &'a S,
    config: &'a ReadConfig,
    rng: R,
    cancel: CancelToken,
    dry_run: bool,
}

impl<'a, S: TimingsSink, R: Rng> TopicReader<'a, S, R> {
    pub fn new(
        sink: &'a S,
        config: &'a ReadConfig,
        rng: R,
        cancel: CancelToken,
        dry_run: bool,
    ) -> Self {
        Self {
            sink,
            config,
            rng,
            cancel,
            dry_run,
        }
    }

    pub async fn read_topic(
        &mut self,
        topic_id: u64,
        state: &TopicState,
    ) -> Result<ReadSummary, ReaderError> {
        let start = state.effective_start(self.config.start_from_current);
        let total = state.total_posts;
        let mut plan = BatchPlan::new(start, total, self.config)?;
        let mut summary = ReadSummary::default();

        println!(
            "Start reading: topic_id={}, start={}, total_posts={}",
            topic_id, start, total
        );

        while let Some(range) = plan.next_range(&mut self.rng) {
            if self.cancel.is_cancelled() {
                return Err(ReaderError::Interrupted);
            }
            let payload = synthesize_timings(topic_id, range, self.config, &mut self.rng);
            let percent = percent_complete(range.end, total);

            if self.dry_run {
                println!("[dry-run] Would send {} ({}%)", range, percent);
            } else {
                self.submit_with_retry(topic_id, range, &payload).await?;
                println!("Sent {} ({}%)", range, percent);
            }
            summary.batches.push(BatchRecord { range, percent });

            let delay =
                self.config.base_delay + self.rng.gen_range(0..=self.config.random_delay_range);
            sleep(Duration::from_millis(delay)).await;
        }

        Ok(summary)
    }

    async fn submit_with_retry(
        &self,
        topic_id: u64,
        range: ReadRange,
        payload: &TimingsPayload,
    ) -> Result<(), ReaderError> {
        let mut state = BatchState::Pending;
        loop {
            state = match state {
                BatchState::Pending => BatchState::Submitting { attempt: 1 },
                BatchState::Submitting { attempt } => {
                    debug!(topic_id, %range, attempt, "submitting batch");
                    match self.sink.submit(payload).await {
                        Ok(()) => BatchState::Acked,
                        Err(SubmitFailure::Transient(reason))
                            if attempt <= self.config.retry_count =>
                        {
                            BatchState::Retrying { attempt, reason }
                        }
                        Err(failure) => BatchState::Failed {
                            attempts: attempt,
                            reason: failure.reason().to_string(),
                        },
                    }
                }
                BatchState::Retrying { attempt, reason } => {
                    warn!(
                        topic_id,
                        %range,
                        attempt,
                        %reason,
                        "batch submission failed, backing off"
                    );
                    sleep(RETRY_BACKOFF).await;
                    BatchState::Submitting {
                        attempt: attempt + 1,
                    }
                }
                BatchState::Acked => return Ok(()),
                BatchState::Failed { attempts, reason } => {
                    return Err(ReaderError::SubmitFatal {
                        topic_id,
                        start: range.start,
                        end: range.end,
                        attempts,
                        reason,
                    })
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn fast_config() -> ReadConfig {
        ReadConfig {
            base_delay: 0,
            random_delay_range: 0,
            topic_delay: 0,
            ..ReadConfig::default()
        }
    }

    struct RecordingSink {
        payloads: Mutex<Vec<TimingsPayload>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                payloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TimingsSink for RecordingSink {
        async fn submit(&self, payload: &TimingsPayload) -> Result<(), SubmitFailure> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct FailingSink {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TimingsSink for FailingSink {
        async fn submit(&self, _payload: &TimingsPayload) -> Result<(), SubmitFailure> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SubmitFailure::Transient("HTTP 500".to_string()))
        }
    }

    fn collect_ranges(start: u32, end: u32, config: &ReadConfig, seed: u64) -> Vec<ReadRange> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut plan = BatchPlan::new(start, end, config).unwrap();
        let mut ranges = Vec::new();
        while let Some(range) = plan.next_range(&mut rng) {
            ranges.push(range);
        }
        ranges
    }

    #[test]
    fn partition_covers_interval_exactly() {
        let config = fast_config();
        for seed in 0..50 {
            let ranges = collect_ranges(1, 25, &config, seed);
            assert!(!ranges.is_empty() && ranges.len() <= 4, "seed {}", seed);
            assert_eq!(ranges.first().unwrap().start, 1);
            assert_eq!(ranges.last().unwrap().end, 25);
            let mut expected_start = 1;
            for (i, range) in ranges.iter().enumerate() {
                assert_eq!(range.start, expected_start, "gap or overlap at seed {}", seed);
                assert!(range.start <= range.end);
                if i < ranges.len() - 1 {
                    assert!(range.len() >= 8 && range.len() <= 20);
                } else {
                    assert!(range.len() <= 20);
                }
                expected_start = range.end + 1;
            }
            let total: u32 = ranges.iter().map(ReadRange::len).sum();
            assert_eq!(total, 25);
        }
    }

    #[test]
    fn partition_is_empty_when_start_is_past_end() {
        let config = fast_config();
        assert!(collect_ranges(16, 15, &config, 7).is_empty());
    }

    #[test]
    fn partition_rejects_bad_sizing() {
        let config = ReadConfig {
            min_req_size: 9,
            max_req_size: 3,
            ..fast_config()
        };
        assert!(matches!(
            BatchPlan::new(1, 10, &config),
            Err(ReaderError::Config { .. })
        ));
    }

    #[test]
    fn dwell_times_are_bounded_and_sum_matches() {
        let config = fast_config();
        let mut rng = StdRng::seed_from_u64(11);
        let range = ReadRange { start: 3, end: 9 };
        let payload = synthesize_timings(77, range, &config, &mut rng);
        assert_eq!(payload.timings.len(), 7);
        assert_eq!(*payload.timings.keys().next().unwrap(), 3);
        assert_eq!(*payload.timings.keys().last().unwrap(), 9);
        let mut sum: u64 = 0;
        for dwell in payload.timings.values() {
            assert!(*dwell >= config.min_read_time && *dwell <= config.max_read_time);
            sum += u64::from(*dwell);
        }
        assert_eq!(payload.topic_time, sum);
    }

    #[test]
    fn percent_is_rounded_to_two_decimals() {
        assert_eq!(percent_complete(25, 25), 100.0);
        assert_eq!(percent_complete(20, 25), 80.0);
        assert_eq!(percent_complete(1, 3), 33.33);
    }

    #[test]
    fn resume_starts_after_server_cursor() {
        let state = TopicState {
            last_read: Some(10),
            total_posts: 25,
        };
        assert_eq!(state.effective_start(true), 11);
        assert_eq!(state.effective_start(false), 1);

        let fresh = TopicState {
            last_read: None,
            total_posts: 25,
        };
        assert_eq!(fresh.effective_start(true), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_topic_submits_every_post_once() {
        let sink = RecordingSink::new();
        let config = fast_config();
        let state = TopicState {
            last_read: None,
            total_posts: 25,
        };
        let mut reader = TopicReader::new(
            &sink,
            &config,
            StdRng::seed_from_u64(3),
            CancelToken::default(),
            false,
        );
        let summary = reader.read_topic(42, &state).await.unwrap();

        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), summary.batches.len());
        assert_eq!(summary.batches.first().unwrap().range.start, 1);
        assert_eq!(summary.batches.last().unwrap().range.end, 25);
        assert_eq!(summary.batches.last().unwrap().percent, 100.0);
        for (record, payload) in summary.batches.iter().zip(payloads.iter()) {
            assert_eq!(payload.topic_id, 42);
            assert_eq!(payload.timings.len() as u32, record.range.len());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fully_read_topic_is_a_noop() {
        let sink = RecordingSink::new();
        let config = ReadConfig {
            start_from_current: true,
            ..fast_config()
        };
        let state = TopicState {
            last_read: Some(15),
            total_posts: 15,
        };
        let mut reader = TopicReader::new(
            &sink,
            &config,
            StdRng::seed_from_u64(5),
            CancelToken::default(),
            false,
        );
        let summary = reader.read_topic(9, &state).await.unwrap();
        assert!(summary.batches.is_empty());
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_escalate_to_fatal() {
        let sink = FailingSink {
            attempts: AtomicU32::new(0),
        };
        let config = fast_config();
        let state = TopicState {
            last_read: None,
            total_posts: 10,
        };
        let mut reader = TopicReader::new(
            &sink,
            &config,
            StdRng::seed_from_u64(1),
            CancelToken::default(),
            false,
        );
        let started = Instant::now();
        let err = reader.read_topic(7, &state).await.unwrap_err();

        // retry_count = 3: four attempts separated by three 2000 ms waits
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(6000));
        match err {
            ReaderError::SubmitFatal {
                topic_id,
                start,
                attempts,
                ..
            } => {
                assert_eq!(topic_id, 7);
                assert_eq!(start, 1);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected SubmitFatal, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_the_next_submission() {
        let sink = RecordingSink::new();
        let config = fast_config();
        let cancel = CancelToken::default();
        cancel.cancel();
        let state = TopicState {
            last_read: None,
            total_posts: 10,
        };
        let mut reader =
            TopicReader::new(&sink, &config, StdRng::seed_from_u64(2), cancel, false);
        let err = reader.read_topic(1, &state).await.unwrap_err();
        assert!(matches!(err, ReaderError::Interrupted));
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_sends_nothing() {
        let sink = RecordingSink::new();
        let config = fast_config();
        let state = TopicState {
            last_read: None,
            total_posts: 25,
        };
        let mut reader = TopicReader::new(
            &sink,
            &config,
            StdRng::seed_from_u64(8),
            CancelToken::default(),
            true,
        );
        let summary = reader.read_topic(42, &state).await.unwrap();
        assert!(!summary.batches.is_empty());
        assert!(sink.payloads.lock().unwrap().is_empty());
    }
}
