use std::time::Duration;

use crate::error::Error;

/// Reactor configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the bounded submission channel. A full channel makes
    /// [`Session::submit`](crate::Session::submit) fail with
    /// [`Error::SubmissionQueueFull`].
    pub submission_capacity: usize,
    /// Completions are handed to the consumer in batches of at most this many.
    pub max_completion_batch: usize,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Period of the housekeeping timer (deferred cleanup, idle expiry).
    pub housekeeping_interval: Duration,
    /// Upper bound on a single poll when no timer is due sooner.
    pub max_poll_wait: Duration,
    /// Name given to the reactor thread by [`ReactorBuilder::launch`](crate::ReactorBuilder::launch).
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            submission_capacity: 65536,
            max_completion_batch: 500,
            events_capacity: 1024,
            housekeeping_interval: Duration::from_secs(1),
            max_poll_wait: Duration::from_secs(1),
            thread_name: "curlew-reactor".to_string(),
        }
    }
}

impl Config {
    /// Check the configuration for values the reactor cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.submission_capacity == 0 {
            return Err(Error::InvalidConfig(
                "submission_capacity must be > 0".into(),
            ));
        }
        if self.max_completion_batch == 0 {
            return Err(Error::InvalidConfig(
                "max_completion_batch must be > 0".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(Error::InvalidConfig("events_capacity must be > 0".into()));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "housekeeping_interval must be > 0".into(),
            ));
        }
        if self.max_poll_wait.is_zero() {
            return Err(Error::InvalidConfig("max_poll_wait must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Channels ───────────────────────────────────────────────────

    pub fn submission_capacity(mut self, capacity: usize) -> Self {
        self.config.submission_capacity = capacity;
        self
    }

    pub fn max_completion_batch(mut self, batch: usize) -> Self {
        self.config.max_completion_batch = batch;
        self
    }

    // ── Loop settings ──────────────────────────────────────────────

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.config.housekeeping_interval = interval;
        self
    }

    pub fn max_poll_wait(mut self, wait: Duration) -> Self {
        self.config.max_poll_wait = wait;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
