//! Staged BLE scan schedule
//!
//! Discovery starts broad (no filter, duplicates allowed) so peers whose
//! service UUID is not in the primary advertisement are still seen. If the
//! warm-up window classifies nothing, the broad scan is restarted once. After a
//! second, longer window the scan narrows to the service-UUID filter.
//!
//! The schedule is a pure state machine; the controller owns the timers and
//! feeds window expiries back in. Every (re)start bumps a generation so timers
//! from an earlier scan are ignored.

use crate::transport::abstraction::ScanRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Staged scan windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanStrategyConfig {
    /// First broad window in milliseconds (default 4s)
    pub warm_up_ms: u64,
    /// Second broad window before narrowing, in milliseconds (default 10s)
    pub settle_ms: u64,
}

impl Default for ScanStrategyConfig {
    fn default() -> Self {
        Self {
            warm_up_ms: 4_000,
            settle_ms: 10_000,
        }
    }
}

impl ScanStrategyConfig {
    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.warm_up_ms == 0 || self.settle_ms == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "Scan windows must be > 0".to_string(),
            ));
        }
        if self.settle_ms < self.warm_up_ms {
            return Err(ScannerError::InvalidScanConfig(
                "Settle window must be >= warm-up window".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
}

/// Where the schedule currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStage {
    /// Not scanning
    Idle,
    /// First broad window
    WarmUp,
    /// Second broad window, possibly after a restart
    Extended,
    /// Narrowed to the service UUID
    Filtered,
}

/// What the controller should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    pub generation: u64,
    pub stage: ScanStage,
    /// Scan parameters for this stage
    pub request: ScanRequest,
    /// The radio scan must be stopped and started with `request`
    pub restart: bool,
    /// When to report the next window expiry, if any
    pub next_window: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ScanSchedule {
    service_uuid: Uuid,
    config: ScanStrategyConfig,
    stage: ScanStage,
    generation: u64,
    classified: u64,
}

impl ScanSchedule {
    pub fn new(service_uuid: Uuid, config: ScanStrategyConfig) -> Self {
        Self {
            service_uuid,
            config,
            stage: ScanStage::Idle,
            generation: 0,
            classified: 0,
        }
    }

    pub fn stage(&self) -> ScanStage {
        self.stage
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advertisements classified since the scan began
    pub fn classified(&self) -> u64 {
        self.classified
    }

    /// Start (or restart) the staged scan
    pub fn begin(&mut self) -> ScanStep {
        self.generation += 1;
        self.classified = 0;
        self.stage = ScanStage::WarmUp;
        ScanStep {
            generation: self.generation,
            stage: self.stage,
            request: ScanRequest::broad(),
            restart: true,
            next_window: Some(self.config.warm_up()),
        }
    }

    pub fn record_classified(&mut self) {
        if self.stage != ScanStage::Idle {
            self.classified += 1;
        }
    }

    /// Advance after a window expired; `None` for stale or final windows
    pub fn on_window_elapsed(&mut self, generation: u64) -> Option<ScanStep> {
        if generation != self.generation {
            return None;
        }
        match self.stage {
            ScanStage::WarmUp => {
                self.stage = ScanStage::Extended;
                Some(ScanStep {
                    generation: self.generation,
                    stage: self.stage,
                    request: ScanRequest::broad(),
                    restart: self.classified == 0,
                    next_window: Some(self.config.settle()),
                })
            }
            ScanStage::Extended => {
                self.stage = ScanStage::Filtered;
                Some(ScanStep {
                    generation: self.generation,
                    stage: self.stage,
                    request: ScanRequest::filtered(self.service_uuid),
                    restart: true,
                    next_window: None,
                })
            }
            ScanStage::Filtered | ScanStage::Idle => None,
        }
    }

    pub fn stop(&mut self) {
        self.generation += 1;
        self.stage = ScanStage::Idle;
    }
}
