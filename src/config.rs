//! Configuration types.
//!
//! Every tunable of the pipeline lives here. Each section has a `Default`
//! and a `from_env()` that overrides individual fields from `LEAD_RELAY_*`
//! environment variables, falling back to the default when a variable is
//! unset or unparsable.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub ingress: IngressConfig,
    pub classifier: ClassifierConfig,
    pub verification: VerificationConfig,
    pub delivery: DeliveryConfig,
    pub hub: HubConfig,
}

impl PipelineConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Self {
        Self {
            ingress: IngressConfig::from_env(),
            classifier: ClassifierConfig::from_env(),
            verification: VerificationConfig::from_env(),
            delivery: DeliveryConfig::from_env(),
            hub: HubConfig::from_env(),
        }
    }

    /// Reject configurations that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.classifier.validate()?;
        self.delivery.validate()?;
        if self.verification.max_attempts == 0 {
            return Err(invalid("verification.max_attempts", "must be at least 1"));
        }
        if self.verification.confirmation_phrases.is_empty() {
            return Err(invalid(
                "verification.confirmation_phrases",
                "at least one phrase is required",
            ));
        }
        if self.ingress.max_tracked_ids == 0 {
            return Err(invalid("ingress.max_tracked_ids", "must be at least 1"));
        }
        Ok(())
    }
}

// ── Ingress ─────────────────────────────────────────────────────────

/// Ingress deduplicator settings.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// How long a processed message id is remembered.
    pub dedup_window: Duration,
    /// Hard cap on remembered ids; oldest are evicted first.
    pub max_tracked_ids: usize,
    /// Identities the bot itself sends from (phone numbers or JIDs).
    pub own_ids: Vec<String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60),
            max_tracked_ids: 10_000,
            own_ids: Vec::new(),
        }
    }
}

impl IngressConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dedup_window: env_secs("LEAD_RELAY_DEDUP_WINDOW_SECS", d.dedup_window),
            max_tracked_ids: env_parse("LEAD_RELAY_DEDUP_MAX_IDS", d.max_tracked_ids),
            own_ids: env_list("LEAD_RELAY_OWN_IDS"),
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Weights applied to each suspicion signal before normalization.
#[derive(Debug, Clone, Copy)]
pub struct SignalWeights {
    pub frequency: f64,
    pub latency: f64,
    pub entropy: f64,
    pub content: f64,
    pub history: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            frequency: 0.2,
            latency: 0.35,
            entropy: 0.15,
            content: 0.2,
            history: 0.1,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.frequency + self.latency + self.entropy + self.content + self.history
    }
}

/// Bot/human classifier settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub weights: SignalWeights,
    /// Aggregate scores below this are allowed through.
    pub low_threshold: f64,
    /// Aggregate scores at or above this block the contact permanently.
    pub high_threshold: f64,
    /// Rolling window for the frequency signal.
    pub frequency_window: Duration,
    /// Messages inside `frequency_window` that saturate the frequency signal.
    pub frequency_ceiling: usize,
    /// Replies faster than this score 1.0 on the latency signal.
    pub latency_bot: Duration,
    /// Replies slower than this score 0.0 on the latency signal.
    pub latency_human: Duration,
    /// Recent message texts kept per contact for the entropy signal.
    pub history_len: usize,
    /// Half-life of the historical carryover penalty.
    pub carryover_half_life: Duration,
    /// Score records idle for longer than this are dropped.
    pub record_ttl: Duration,
    /// Hard cap on score records.
    pub max_records: usize,
    /// Fraction of records evicted when the cap is exceeded.
    pub record_eviction_fraction: f64,
    /// Outbound timestamps older than this are ignored and swept.
    pub outbound_timestamp_ttl: Duration,
    /// Hard cap on stored outbound timestamps.
    pub max_outbound_timestamps: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            low_threshold: 0.3,
            high_threshold: 0.75,
            frequency_window: Duration::from_secs(10),
            frequency_ceiling: 6,
            latency_bot: Duration::from_millis(1000),
            latency_human: Duration::from_millis(3000),
            history_len: 10,
            carryover_half_life: Duration::from_secs(3600),
            record_ttl: Duration::from_secs(30 * 60),
            max_records: 5_000,
            record_eviction_fraction: 0.2,
            outbound_timestamp_ttl: Duration::from_secs(10 * 60),
            max_outbound_timestamps: 10_000,
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            weights: SignalWeights {
                frequency: env_parse("LEAD_RELAY_WEIGHT_FREQUENCY", d.weights.frequency),
                latency: env_parse("LEAD_RELAY_WEIGHT_LATENCY", d.weights.latency),
                entropy: env_parse("LEAD_RELAY_WEIGHT_ENTROPY", d.weights.entropy),
                content: env_parse("LEAD_RELAY_WEIGHT_CONTENT", d.weights.content),
                history: env_parse("LEAD_RELAY_WEIGHT_HISTORY", d.weights.history),
            },
            low_threshold: env_parse("LEAD_RELAY_SCORE_LOW", d.low_threshold),
            high_threshold: env_parse("LEAD_RELAY_SCORE_HIGH", d.high_threshold),
            frequency_window: env_secs("LEAD_RELAY_FREQUENCY_WINDOW_SECS", d.frequency_window),
            frequency_ceiling: env_parse("LEAD_RELAY_FREQUENCY_CEILING", d.frequency_ceiling),
            latency_bot: env_millis("LEAD_RELAY_LATENCY_BOT_MS", d.latency_bot),
            latency_human: env_millis("LEAD_RELAY_LATENCY_HUMAN_MS", d.latency_human),
            history_len: env_parse("LEAD_RELAY_SCORE_HISTORY_LEN", d.history_len),
            carryover_half_life: env_secs(
                "LEAD_RELAY_CARRYOVER_HALF_LIFE_SECS",
                d.carryover_half_life,
            ),
            record_ttl: env_secs("LEAD_RELAY_SCORE_TTL_SECS", d.record_ttl),
            max_records: env_parse("LEAD_RELAY_SCORE_MAX_RECORDS", d.max_records),
            record_eviction_fraction: env_parse(
                "LEAD_RELAY_SCORE_EVICTION_FRACTION",
                d.record_eviction_fraction,
            ),
            outbound_timestamp_ttl: env_secs(
                "LEAD_RELAY_OUTBOUND_TS_TTL_SECS",
                d.outbound_timestamp_ttl,
            ),
            max_outbound_timestamps: env_parse(
                "LEAD_RELAY_OUTBOUND_TS_MAX",
                d.max_outbound_timestamps,
            ),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        if [w.frequency, w.latency, w.entropy, w.content, w.history]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(invalid("classifier.weights", "weights must be non-negative"));
        }
        if w.total() <= 0.0 {
            return Err(invalid("classifier.weights", "at least one weight must be positive"));
        }
        if !(0.0..=1.0).contains(&self.low_threshold)
            || !(0.0..=1.0).contains(&self.high_threshold)
            || self.low_threshold >= self.high_threshold
        {
            return Err(invalid(
                "classifier.thresholds",
                "expected 0 <= low < high <= 1",
            ));
        }
        if self.latency_bot >= self.latency_human {
            return Err(invalid(
                "classifier.latency",
                "latency_bot must be shorter than latency_human",
            ));
        }
        check_fraction("classifier.record_eviction_fraction", self.record_eviction_fraction)
    }
}

// ── Verification ────────────────────────────────────────────────────

/// Verification handshake settings.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Challenge issues plus failed answers allowed before blocking.
    pub max_attempts: u32,
    /// A pending challenge older than this blocks on next access.
    pub timeout: Duration,
    /// Whole-token phrases that confirm a human.
    pub confirmation_phrases: Vec<String>,
    pub challenge_prompt: String,
    pub retry_prompt: String,
    pub verified_ack: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10 * 60),
            confirmation_phrases: [
                "yes",
                "sim",
                "si",
                "confirm",
                "confirmo",
                "human",
                "humano",
                "i am human",
                "sou humano",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            challenge_prompt:
                "Before we continue, please reply YES so we know you're a person.".to_string(),
            retry_prompt: "Sorry, I didn't catch that. Please reply YES to continue.".to_string(),
            verified_ack: "Thanks! How can I help you today?".to_string(),
        }
    }
}

impl VerificationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let phrases = env_list("LEAD_RELAY_CONFIRMATION_PHRASES");
        Self {
            max_attempts: env_parse("LEAD_RELAY_VERIFY_MAX_ATTEMPTS", d.max_attempts),
            timeout: env_secs("LEAD_RELAY_VERIFY_TIMEOUT_SECS", d.timeout),
            confirmation_phrases: if phrases.is_empty() {
                d.confirmation_phrases
            } else {
                phrases
            },
            challenge_prompt: std::env::var("LEAD_RELAY_CHALLENGE_PROMPT")
                .unwrap_or(d.challenge_prompt),
            retry_prompt: std::env::var("LEAD_RELAY_CHALLENGE_RETRY_PROMPT")
                .unwrap_or(d.retry_prompt),
            verified_ack: std::env::var("LEAD_RELAY_VERIFIED_ACK").unwrap_or(d.verified_ack),
        }
    }
}

// ── Delivery ────────────────────────────────────────────────────────

/// Outbound delivery manager settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Total calls to the send primitive before giving up.
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// Per-attempt timeout on the send primitive.
    pub send_timeout: Duration,
    /// Identical content to the same recipient inside this window is dropped.
    pub duplicate_window: Duration,
    /// Characters of normalized content that feed the fingerprint.
    pub fingerprint_chars: usize,
    pub max_sent_records: usize,
    pub sent_eviction_fraction: f64,
    pub max_in_flight: usize,
    pub in_flight_eviction_fraction: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(30),
            fingerprint_chars: 500,
            max_sent_records: 5_000,
            sent_eviction_fraction: 0.2,
            max_in_flight: 500,
            in_flight_eviction_fraction: 0.5,
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("LEAD_RELAY_SEND_MAX_ATTEMPTS", d.max_attempts),
            backoff_base: env_millis("LEAD_RELAY_SEND_BACKOFF_MS", d.backoff_base),
            send_timeout: env_millis("LEAD_RELAY_SEND_TIMEOUT_MS", d.send_timeout),
            duplicate_window: env_secs("LEAD_RELAY_SEND_DEDUP_WINDOW_SECS", d.duplicate_window),
            fingerprint_chars: env_parse("LEAD_RELAY_FINGERPRINT_CHARS", d.fingerprint_chars),
            max_sent_records: env_parse("LEAD_RELAY_SENT_MAX", d.max_sent_records),
            sent_eviction_fraction: env_parse(
                "LEAD_RELAY_SENT_EVICTION_FRACTION",
                d.sent_eviction_fraction,
            ),
            max_in_flight: env_parse("LEAD_RELAY_IN_FLIGHT_MAX", d.max_in_flight),
            in_flight_eviction_fraction: env_parse(
                "LEAD_RELAY_IN_FLIGHT_EVICTION_FRACTION",
                d.in_flight_eviction_fraction,
            ),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("delivery.max_attempts", "must be at least 1"));
        }
        if self.max_sent_records == 0 || self.max_in_flight == 0 {
            return Err(invalid("delivery caps", "caps must be at least 1"));
        }
        check_fraction("delivery.sent_eviction_fraction", self.sent_eviction_fraction)?;
        check_fraction(
            "delivery.in_flight_eviction_fraction",
            self.in_flight_eviction_fraction,
        )
    }
}

// ── Hub ─────────────────────────────────────────────────────────────

/// Conversation router settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Cached engines unused for longer than this are dropped.
    pub engine_idle_window: Duration,
    /// Hard cap on cached engines.
    pub max_cached_engines: usize,
    /// Reply sent when an agent turn fails.
    pub fallback_reply: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            engine_idle_window: Duration::from_secs(30 * 60),
            max_cached_engines: 2_000,
            fallback_reply: "Sorry, something went wrong on our side. Could you send that again?"
                .to_string(),
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            engine_idle_window: env_secs("LEAD_RELAY_ENGINE_IDLE_SECS", d.engine_idle_window),
            max_cached_engines: env_parse("LEAD_RELAY_ENGINE_CACHE_MAX", d.max_cached_engines),
            fallback_reply: std::env::var("LEAD_RELAY_FALLBACK_REPLY").unwrap_or(d.fallback_reply),
        }
    }
}

// ── Outbound gateway ────────────────────────────────────────────────

/// HTTP messaging gateway used for outbound sends.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `https://gateway.example.com`.
    pub base_url: String,
    /// Instance (sender line) name on the gateway.
    pub instance: String,
    pub api_key: SecretString,
    /// Longer texts are split into several sends.
    pub max_message_len: usize,
}

impl GatewayConfig {
    /// Returns `None` when no gateway is configured; the binary then runs
    /// with a dry-run channel.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("LEAD_RELAY_GATEWAY_URL").ok()?;
        let instance =
            std::env::var("LEAD_RELAY_GATEWAY_INSTANCE").unwrap_or_else(|_| "default".to_string());
        let api_key = std::env::var("LEAD_RELAY_GATEWAY_API_KEY").unwrap_or_default();

        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            instance,
            api_key: SecretString::from(api_key),
            max_message_len: env_parse("LEAD_RELAY_GATEWAY_MAX_LEN", 4_000),
        })
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// HTTP listener and storage location.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// libSQL database file; `:memory:` keeps everything in memory.
    pub db_path: String,
    /// Interval of the background sweep over in-memory caches.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "lead_relay.db".to_string(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: std::env::var("LEAD_RELAY_BIND").unwrap_or(d.bind),
            db_path: std::env::var("LEAD_RELAY_DB_PATH").unwrap_or(d.db_path),
            sweep_interval: env_secs("LEAD_RELAY_SWEEP_INTERVAL_SECS", d.sweep_interval),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn check_fraction(key: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(key, "must be in (0, 1]"))
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Comma-separated list; empty entries are dropped.
pub(crate) fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
