// Configuration surface for the dispatch pipeline.
//
// All sections deserialize from a single YAML file and carry Default impls
// so partial files work. Environment-specific wiring (database URLs, bucket
// names) lives here; behavior knobs (part size, batch size) have the same
// defaults the production deployment uses.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Minimum multipart part size accepted by the object store, in megabytes.
pub const MULTIPART_MIN_PART_MB: u64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: WorkersConfig,
    pub s3: S3Config,
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub push_db: DatabaseConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Megabytes per multipart part; floored at the object store minimum.
    pub amazon_part_size: u64,
    /// Recipients per batch handed to the batch processor.
    pub batch_size: usize,
    /// Outbound topic format, expanded with `{app}` and `{service}`.
    pub topic_template: String,
    /// Publish-failure ratio at which a running job trips to circuitbreak.
    pub circuit_break_ratio: f64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            amazon_part_size: MULTIPART_MIN_PART_MB,
            batch_size: 1000,
            topic_template: "push-{app}-{service}".to_string(),
            circuit_break_ratio: 0.5,
        }
    }
}

impl WorkersConfig {
    /// Part size in megabytes with the object-store floor applied.
    pub fn effective_part_size_mb(&self) -> u64 {
        self.amazon_part_size.max(MULTIPART_MIN_PART_MB)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub folder: String,
    pub region: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "stampede".to_string(),
            folder: "jobs".to_string(),
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent messages per queue.
    pub concurrency: usize,
    /// Lease duration before an unacked message is re-delivered.
    pub lease_secs: u64,
    /// Idle poll interval for worker loops.
    pub poll_interval_ms: u64,
    /// Deliveries before a message is dead-lettered.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            lease_secs: 60,
            poll_interval_ms: 100,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/stampede".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub brokers: String,
    pub message_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            message_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. A missing file is a startup
    /// error, not a silent fall-through to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| DispatchError::Configuration(format!("cannot parse {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workers.amazon_part_size, 5);
        assert_eq!(config.workers.batch_size, 1000);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.workers.topic_template, "push-{app}-{service}");
    }

    #[test]
    fn test_part_size_floor() {
        let workers = WorkersConfig {
            amazon_part_size: 1,
            ..Default::default()
        };
        assert_eq!(workers.effective_part_size_mb(), MULTIPART_MIN_PART_MB);
    }

    #[test]
    fn test_partial_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "workers:\n  batch_size: 250\ns3:\n  bucket: test-bucket\n"
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.workers.batch_size, 250);
        assert_eq!(config.s3.bucket, "test-bucket");
        // untouched sections keep their defaults
        assert_eq!(config.queue.lease_secs, 60);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::from_file("/nonexistent/stampede.yaml").unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }
}
