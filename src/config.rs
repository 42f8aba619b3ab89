use std::time::Duration;

use crate::error::{Error, Result};

/// When a write is answered `Accepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Answer once the record is below the head offset, i.e. durably stored.
    Durable,
    /// Answer as soon as the record is admitted into the head buffer.
    Admitted,
}

/// Configuration for a single partition
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Partition number, part of every persisted key
    pub partition_id: u32,

    /// Buffered head bytes that trigger a flush (default: 8MB)
    pub flush_size_threshold: usize,

    /// Maximum age of the oldest buffered record before a flush (default: 50ms)
    pub flush_max_age: Duration,

    /// Delay before retrying a failed storage write (default: 100ms)
    pub flush_retry_backoff: Duration,

    /// Payload parts larger than this are split (default: 500KB)
    pub max_part_size: usize,

    /// Maximum number of queued requests waiting for quota (default: 10_000)
    pub max_pending_requests: usize,

    /// How often the driver logs partition metrics (default: 30s)
    pub metrics_interval: Duration,

    pub ack_policy: AckPolicy,

    pub compaction: CompactionConfig,

    pub quota: QuotaConfig,

    pub retention: RetentionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Byte ceiling per level; level `i` is promoted once it holds at least
    /// `level_ceilings[i]` bytes. Must be strictly increasing.
    /// (default: 4 levels of 512KB, 2MB, 4MB, 8MB)
    pub level_ceilings: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Admitted write bytes per second; `None` disables the tracker (default: None)
    pub bytes_per_second: Option<u64>,

    /// Sliding window length (default: 1s)
    pub window: Duration,

    /// Number of buckets the window is divided into (default: 10)
    pub buckets: usize,

    /// Reservations not consumed within this time are released (default: 5s)
    pub reservation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Blocks whose newest record is older than this are trimmed (default: None)
    pub max_age: Option<Duration>,

    /// Body bytes retained before the oldest blocks are trimmed (default: None)
    pub max_bytes: Option<u64>,

    /// Implicit message groups not written for this long are dropped (default: 24h)
    pub source_id_max_age: Option<Duration>,

    /// Implicit message groups beyond this count are dropped, least recently
    /// written first (default: None)
    pub source_id_max_count: Option<usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level_ceilings: vec![512 << 10, 2 << 20, 4 << 20, 8 << 20],
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: None,
            max_bytes: None,
            source_id_max_age: Some(Duration::from_secs(24 * 60 * 60)),
            source_id_max_count: None,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: None,
            window: Duration::from_secs(1),
            buckets: 10,
            reservation_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_id: 0,
            flush_size_threshold: 8 * 1024 * 1024, // 8MB
            flush_max_age: Duration::from_millis(50),
            flush_retry_backoff: Duration::from_millis(100),
            max_part_size: 500 * 1024, // 500KB
            max_pending_requests: 10_000,
            metrics_interval: Duration::from_secs(30),
            ack_policy: AckPolicy::Durable,
            compaction: CompactionConfig::default(),
            quota: QuotaConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl PartitionConfig {
    /// Create a new config for the given partition
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            ..Default::default()
        }
    }

    /// Set the head size that triggers a flush
    pub fn flush_size_threshold(mut self, size: usize) -> Self {
        self.flush_size_threshold = size;
        self
    }

    /// Set the maximum head age before a flush
    pub fn flush_max_age(mut self, age: Duration) -> Self {
        self.flush_max_age = age;
        self
    }

    /// Set the backoff between storage write retries
    pub fn flush_retry_backoff(mut self, backoff: Duration) -> Self {
        self.flush_retry_backoff = backoff;
        self
    }

    /// Set the maximum size of a single record part
    pub fn max_part_size(mut self, size: usize) -> Self {
        self.max_part_size = size;
        self
    }

    /// Set the request queue capacity
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set when writes are acknowledged
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Configure write quota settings
    pub fn quota(mut self, config: QuotaConfig) -> Self {
        self.quota = config;
        self
    }

    /// Configure retention settings
    pub fn retention(mut self, config: RetentionConfig) -> Self {
        self.retention = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_part_size == 0 {
            return Err(Error::InvalidConfig("max_part_size must be positive".into()));
        }
        if self.flush_size_threshold == 0 {
            return Err(Error::InvalidConfig(
                "flush_size_threshold must be positive".into(),
            ));
        }
        self.compaction.validate()?;
        self.quota.validate()
    }
}

impl CompactionConfig {
    /// Set the per-level byte ceilings
    pub fn level_ceilings(mut self, ceilings: Vec<u64>) -> Self {
        self.level_ceilings = ceilings;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.level_ceilings.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one compaction level is required".into(),
            ));
        }
        if self.level_ceilings.len() > u8::MAX as usize {
            return Err(Error::InvalidConfig("too many compaction levels".into()));
        }
        if self.level_ceilings.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig(format!(
                "level ceilings must be strictly increasing: {:?}",
                self.level_ceilings
            )));
        }
        Ok(())
    }
}

impl QuotaConfig {
    /// Set the admitted byte rate
    pub fn bytes_per_second(mut self, rate: u64) -> Self {
        self.bytes_per_second = Some(rate);
        self
    }

    /// Set the sliding window length
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the number of window buckets
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set the reservation timeout
    pub fn reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    /// Total bytes admissible within one window.
    pub fn window_budget(&self) -> Option<u64> {
        self.bytes_per_second
            .map(|rate| (rate as u128 * self.window.as_millis() / 1000) as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 || self.window.is_zero() {
            return Err(Error::InvalidConfig(
                "quota window needs at least one bucket and a non-zero length".into(),
            ));
        }
        Ok(())
    }
}

impl RetentionConfig {
    /// Set the maximum age of retained blocks
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Set the maximum retained body size
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    /// Set how long an idle implicit message group is kept
    pub fn source_id_max_age(mut self, age: Duration) -> Self {
        self.source_id_max_age = Some(age);
        self
    }

    /// Set the number of implicit message groups kept
    pub fn source_id_max_count(mut self, count: usize) -> Self {
        self.source_id_max_count = Some(count);
        self
    }
}
