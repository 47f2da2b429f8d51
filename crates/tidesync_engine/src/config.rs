//! Configuration for sync rounds.

use std::path::PathBuf;
use std::time::Duration;
use tidesync_protocol::{ConflictResolutionPolicy, SerializerKind};

/// Default number of rows per batch part.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Options shared by every round of an orchestrator.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rows per batch part; also the in-memory threshold of a batch.
    pub batch_size: usize,
    /// Root of the per-round batch directories.
    pub batch_directory: PathBuf,
    /// Root of the snapshot directories.
    pub snapshots_directory: PathBuf,
    /// Delete a round's batch directory once the round is committed.
    pub clean_folder: bool,
    /// Purge tombstones every peer has seen after a committed round.
    pub clean_metadatas: bool,
    /// Disable constraints while changes are applied.
    pub disable_constraints_on_apply_changes: bool,
    /// Policy used when no conflict resolver is installed.
    pub conflict_resolution_policy: ConflictResolutionPolicy,
    /// Serializer for batch files and HTTP payloads.
    pub serializer: SerializerKind,
    /// Retry behaviour of `synchronize_with_retry`.
    pub retry: RetryConfig,
}

impl SyncOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        let root = std::env::temp_dir().join("tidesync");
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_directory: root.join("batches"),
            snapshots_directory: root.join("snapshots"),
            clean_folder: true,
            clean_metadatas: true,
            disable_constraints_on_apply_changes: false,
            conflict_resolution_policy: ConflictResolutionPolicy::ServerWins,
            serializer: SerializerKind::Json,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the batch directory.
    pub fn with_batch_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.batch_directory = dir.into();
        self
    }

    /// Sets the snapshots directory.
    pub fn with_snapshots_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots_directory = dir.into();
        self
    }

    /// Keeps or deletes batch directories after a committed round.
    pub fn with_clean_folder(mut self, clean: bool) -> Self {
        self.clean_folder = clean;
        self
    }

    /// Enables or disables tombstone cleanup.
    pub fn with_clean_metadatas(mut self, clean: bool) -> Self {
        self.clean_metadatas = clean;
        self
    }

    /// Disables constraints while applying changes.
    pub fn with_disable_constraints(mut self, disable: bool) -> Self {
        self.disable_constraints_on_apply_changes = disable;
        self
    }

    /// Sets the conflict resolution policy.
    pub fn with_conflict_resolution_policy(mut self, policy: ConflictResolutionPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }

    /// Sets the serializer.
    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter.
            let jitter = delay_secs * 0.25 * jitter_fraction();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.batch_size, 10_000);
        assert!(options.clean_folder);
        assert!(options.clean_metadatas);
        assert!(!options.disable_constraints_on_apply_changes);
        assert_eq!(
            options.conflict_resolution_policy,
            ConflictResolutionPolicy::ServerWins
        );
        assert_eq!(options.serializer, SerializerKind::Json);
        assert!(options.batch_directory.ends_with("tidesync/batches"));
    }

    #[test]
    fn options_builder() {
        let options = SyncOptions::new()
            .with_batch_size(0)
            .with_batch_directory("/data/batches")
            .with_clean_folder(false)
            .with_serializer(SerializerKind::Cbor);

        assert_eq!(options.batch_size, 1);
        assert_eq!(options.batch_directory, PathBuf::from("/data/batches"));
        assert!(!options.clean_folder);
        assert_eq!(options.serializer, SerializerKind::Cbor);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
