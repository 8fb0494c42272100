//! Adaptive load calibration: search strategies that drive a calibration
//! test through repeated measurement cycles and accumulate one ordered
//! sequence of calibration points.

pub mod passfail;
pub mod ramp;
pub mod rates;
pub mod registry;
pub mod search;
pub mod throughput;

pub use ramp::Ramp;
pub use search::BinarySearch;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::proto::client::Latency;

/// The result of one measurement cycle. Produced once, never mutated; the
/// whole run's points are consumed by the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationPoint {
    /// Packet size measured with, in bytes including CRC.
    pub pkt_size: u32,
    /// Load value tested, in percent of line rate.
    pub value: f64,
    pub success: bool,
    pub throughput_mpps: f64,
    pub loss_pct: f64,
    /// Latency counters per latency core, when the test samples them.
    pub latency: Option<BTreeMap<u32, Latency>>,
    /// Wall-clock duration of the probe (bisection: of the whole search for
    /// this packet size).
    pub duration_secs: f64,
}

/// What one probe measured, before the strategy folds it into a point.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    pub throughput_mpps: f64,
    pub loss_pct: f64,
    pub latency: Option<BTreeMap<u32, Latency>>,
}

/// A calibration test parametrizes the search strategies: it owns the remote
/// endpoints, knows the search bounds, and performs one measurement cycle per
/// `run_probe` call. Concrete tests live in the registry.
#[async_trait]
pub trait CalibrationTest: Send {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Smallest packet size the test can generate. Requested sizes below this
    /// are shifted up by `min_pkt_size() - 64`.
    fn min_pkt_size(&self) -> u32 {
        64
    }

    /// Lower bound of the bisection interval for a packet size.
    fn lower_bound(&self, pkt_size: u32) -> f64;

    /// Upper bound of the bisection interval for a packet size.
    fn upper_bound(&self, pkt_size: u32) -> f64;

    /// First load value of a ramp run.
    fn start_value(&self) -> f64 {
        0.0
    }

    /// Step a ramp run advances by after every probe.
    fn step_value(&self) -> f64 {
        10.0
    }

    /// Bring the remote endpoints up. Called once before any probe.
    async fn setup(&mut self) -> Result<()>;

    /// Hook before each probe.
    async fn prepare(&mut self, _pkt_size: u32, _value: f64) -> Result<()> {
        Ok(())
    }

    /// One measurement cycle: configure the load, hold for `duration`
    /// seconds, sample statistics before and after.
    async fn run_probe(&mut self, pkt_size: u32, duration: f64, value: f64)
        -> Result<ProbeOutcome>;

    /// Hook after each probe.
    async fn cleanup(&mut self, _pkt_size: u32) -> Result<()> {
        Ok(())
    }

    /// Stop the remote endpoints. Called once after the last probe, also on
    /// aborted runs.
    async fn teardown(&mut self) -> Result<()>;

    /// Fold a finished point into the test's KPI.
    fn update_kpi(&mut self, _point: &CalibrationPoint) {}

    /// The single short-string KPI summarizing the run.
    fn kpi(&self) -> String {
        "***Not measured***".to_string()
    }
}

/// Shift a requested packet size up when the test cannot generate it.
pub(crate) fn effective_pkt_size(requested: u32, min: u32) -> u32 {
    if requested < min {
        requested + min - 64
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_pkt_size_shifts_small_sizes() {
        assert_eq!(effective_pkt_size(64, 64), 64);
        assert_eq!(effective_pkt_size(64, 78), 78);
        assert_eq!(effective_pkt_size(68, 78), 82);
        assert_eq!(effective_pkt_size(128, 78), 128);
    }
}
