use std::cell::Cell;
use std::marker::PhantomData;
use std::time::Duration;

use crate::{ContextManager, Error, Result};

const DEFAULT_MAX_REFERENCES: u32 = 10;
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Manager-wide settings that apply to every context handed out by a [`ContextManager`].
///
/// Use [`ContextManager::builder()`] to create a manager with a custom configuration; this type
/// describes the result and is also accepted by [`ContextManager::with_config()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ManagerConfig {
    max_references: u32,
    max_idle_time: Duration,
    cleanup_interval: Duration,
}

impl ManagerConfig {
    /// Creates a configuration, validating every value.
    ///
    /// * `max_references` - how many callers may share one top-level context at the same time.
    ///   Zero means there is no ceiling.
    /// * `max_idle_time` - how long an unreferenced top-level context may stay unused before the
    ///   reaper closes it. Must be positive.
    /// * `cleanup_interval` - how often the reaper scans for idle contexts. Zero disables the
    ///   reaper; idle contexts then stay registered until closed explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_idle_time` is zero.
    pub fn new(
        max_references: u32,
        max_idle_time: Duration,
        cleanup_interval: Duration,
    ) -> Result<Self> {
        if max_idle_time.is_zero() {
            return Err(Error::InvalidConfig {
                problem: "max_idle_time must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            max_references,
            max_idle_time,
            cleanup_interval,
        })
    }

    /// The maximum number of simultaneous references to one top-level context, or zero if
    /// there is no ceiling.
    #[must_use]
    pub fn max_references(&self) -> u32 {
        self.max_references
    }

    /// How long an unreferenced top-level context may stay unused before it is reaped.
    #[must_use]
    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    /// How often the reaper runs, or zero if it is disabled.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Whether the manager runs a background reaper with this configuration.
    #[must_use]
    pub fn reaper_enabled(&self) -> bool {
        !self.cleanup_interval.is_zero()
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_references: DEFAULT_MAX_REFERENCES,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Builder for creating an instance of [`ContextManager`].
///
/// Every setting is optional. Omitted settings use the defaults: a ceiling of 10 references
/// per context, a 5 minute idle threshold and a reaper that runs once a minute.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memctx::ContextManager;
///
/// let manager = ContextManager::builder()
///     .max_references(2)
///     .max_idle_time(Duration::from_secs(30))
///     .cleanup_interval(Duration::from_secs(5))
///     .build()
///     .unwrap();
///
/// assert_eq!(manager.config().max_references(), 2);
/// # manager.shutdown().unwrap();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ContextManagerBuilder {
    max_references: Option<u32>,
    max_idle_time: Option<Duration>,
    cleanup_interval: Option<Duration>,

    _not_sync: PhantomData<Cell<()>>,
}

impl ContextManagerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            max_references: None,
            max_idle_time: None,
            cleanup_interval: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets how many callers may share one top-level context at the same time.
    ///
    /// Zero removes the ceiling.
    pub fn max_references(mut self, max_references: u32) -> Self {
        self.max_references = Some(max_references);
        self
    }

    /// Sets how long an unreferenced top-level context may stay unused before the reaper
    /// closes it.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self
    }

    /// Sets how often the reaper scans for idle contexts.
    ///
    /// [`Duration::ZERO`] disables the reaper.
    pub fn cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = Some(cleanup_interval);
        self
    }

    /// Resolves the configured values, substituting defaults for anything not set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a value is out of range.
    pub fn build_config(&self) -> Result<ManagerConfig> {
        let defaults = ManagerConfig::default();

        ManagerConfig::new(
            self.max_references.unwrap_or(defaults.max_references),
            self.max_idle_time.unwrap_or(defaults.max_idle_time),
            self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        )
    }

    /// Builds the manager, starting its reaper if the cleanup interval is positive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a value is out of range.
    pub fn build(self) -> Result<ContextManager> {
        Ok(ContextManager::with_config(self.build_config()?))
    }
}
