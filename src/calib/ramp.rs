//! Linear ramp: probe a fixed ladder of load values and keep every point,
//! successful or not. Used to characterize latency across the whole load
//! range rather than to find a single convergent maximum.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::calib::{effective_pkt_size, CalibrationPoint, CalibrationTest};
use crate::config::General;

pub struct Ramp {
    points: Vec<CalibrationPoint>,
}

impl Ramp {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Points accumulated so far; see [`super::BinarySearch::points`].
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<CalibrationPoint> {
        self.points
    }

    /// Sweep the configured packet sizes, stepping the load from the test's
    /// start value until it would exceed 100% of line rate.
    pub async fn run(&mut self, test: &mut dyn CalibrationTest, general: &General) -> Result<()> {
        for &requested in &general.pkt_sizes {
            let pkt_size = effective_pkt_size(requested, test.min_pkt_size());
            info!(pkt_size, "testing packet size");

            let mut value = test.start_value();
            while value <= 100.0 {
                debug!(value, "probing");
                let started = Instant::now();

                test.prepare(pkt_size, value).await?;
                let outcome = test
                    .run_probe(pkt_size, general.test_duration, value)
                    .await?;
                test.cleanup(pkt_size).await?;

                self.points.push(CalibrationPoint {
                    pkt_size,
                    value,
                    success: outcome.success,
                    throughput_mpps: outcome.throughput_mpps,
                    loss_pct: outcome.loss_pct,
                    latency: outcome.latency,
                    duration_secs: started.elapsed().as_secs_f64(),
                });

                value += test.step_value();
            }
        }
        Ok(())
    }
}

impl Default for Ramp {
    fn default() -> Self {
        Self::new()
    }
}
