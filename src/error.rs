use thiserror::Error;

/// Everything that can abort a topic read or the whole run.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("invalid batch sizing: min_req_size={min} max_req_size={max}")]
    Config { min: u32, max: u32 },

    #[error("invalid read times: min_read_time={min} max_read_time={max}")]
    DwellConfig { min: u32, max: u32 },

    #[error("invalid topic URL: {0}")]
    BadTopicUrl(String),

    #[error("topic {topic_id}: failed to fetch topic state: {reason}")]
    Fetch { topic_id: u64, reason: String },

    #[error("topic {topic_id}: posts {start}-{end} failed after {attempts} attempts: {reason}")]
    SubmitFatal {
        topic_id: u64,
        start: u32,
        end: u32,
        attempts: u32,
        reason: String,
    },

    #[error("failed to load {url}: HTTP {status}")]
    PageLoad { url: String, status: u16 },

    #[error("login failed: {0}")]
    Login(String),

    #[error("CSRF token not found. Are you logged in?")]
    CsrfNotFound,

    #[error("interrupted, stopping before the next batch")]
    Interrupted,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Classification a `TimingsSink` reports back to the submission driver.
/// The driver owns retry and escalation, the sink only labels the failure.
#[derive(Debug, Clone)]
pub enum SubmitFailure {
    /// Worth retrying: non-2xx status or a transport hiccup.
    Transient(String),
    /// Not worth retrying, e.g. the request could not even be built.
    Fatal(String),
}

impl SubmitFailure {
    pub fn reason(&self) -> &str {
        match self {
            SubmitFailure::Transient(r) | SubmitFailure::Fatal(r) => r,
        }
    }
}
