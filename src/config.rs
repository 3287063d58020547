//! Configuration for the simulation stack.

use crate::error::{Error, Result};

/// Default socket byte-cache limit, matching the kernel default wmem ceiling.
pub const DEFAULT_CACHE_LIMIT: usize = 212_992;

/// Default maximum transfer unit.
pub const DEFAULT_MTU: usize = 1492;

/// Simulation configuration.
///
/// Controls the PFC watermarks and the socket buffering parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Queue fill fraction at which a PAUSE frame is emitted.
    /// Default: 0.9
    pub pfc_pause_threshold: f64,
    /// Queue fill fraction at which a RESUME frame is emitted.
    /// Default: 0.5
    pub pfc_resume_threshold: f64,
    /// Socket byte-cache limit in bytes.
    /// Default: 212,992
    pub socket_cache_limit: usize,
    /// Maximum transfer unit in bytes. The per-rank connection cache is
    /// derived as `mtu_size * 100`.
    /// Default: 1492
    pub mtu_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pfc_pause_threshold: 0.9,
            pfc_resume_threshold: 0.5,
            socket_cache_limit: DEFAULT_CACHE_LIMIT,
            mtu_size: DEFAULT_MTU,
        }
    }
}

impl SimConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PFC pause threshold.
    pub fn with_pause_threshold(mut self, threshold: f64) -> Self {
        self.pfc_pause_threshold = threshold;
        self
    }

    /// Set the PFC resume threshold.
    pub fn with_resume_threshold(mut self, threshold: f64) -> Self {
        self.pfc_resume_threshold = threshold;
        self
    }

    /// Set the socket cache limit.
    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.socket_cache_limit = limit;
        self
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu_size = mtu;
        self
    }

    /// Connection cache limit derived from the MTU.
    #[inline]
    pub fn connection_cache_limit(&self) -> usize {
        self.mtu_size * 100
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pfc_pause_threshold) {
            return Err(Error::InvalidConfig(format!(
                "pfc_pause_threshold {} outside [0, 1]",
                self.pfc_pause_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.pfc_resume_threshold) {
            return Err(Error::InvalidConfig(format!(
                "pfc_resume_threshold {} outside [0, 1]",
                self.pfc_resume_threshold
            )));
        }
        if self.mtu_size == 0 {
            return Err(Error::InvalidConfig("mtu_size must be positive".into()));
        }
        Ok(())
    }
}
