//! Bisection search for the highest sustainable load.
//!
//! The search assumes the lower bound of the interval succeeds and the upper
//! bound fails. The first probed value is the upper bound itself: if the
//! ceiling holds there is nothing to search for. The first follow-up probe is
//! offset so that the interval width is a power-of-2 multiple of the
//! precision; when that optimistic probe succeeds, the search then lands on
//! an integer multiple of the precision instead of a fraction of it. The
//! offset applies to that one probe only.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::calib::{effective_pkt_size, CalibrationPoint, CalibrationTest, ProbeOutcome};
use crate::config::General;

pub struct BinarySearch {
    points: Vec<CalibrationPoint>,
}

impl BinarySearch {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Points accumulated so far. Populated incrementally, so a run aborted
    /// by an error or an interrupt still exposes every completed packet size.
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<CalibrationPoint> {
        self.points
    }

    /// Sweep the configured packet sizes, producing one convergent point per
    /// size.
    pub async fn run(&mut self, test: &mut dyn CalibrationTest, general: &General) -> Result<()> {
        for &requested in &general.pkt_sizes {
            let pkt_size = effective_pkt_size(requested, test.min_pkt_size());
            info!(pkt_size, "testing packet size");

            let started = Instant::now();
            let mut point = self.search_one(test, pkt_size, general).await?;
            point.duration_secs = started.elapsed().as_secs_f64();

            test.update_kpi(&point);
            self.points.push(point);
        }
        Ok(())
    }

    async fn search_one(
        &mut self,
        test: &mut dyn CalibrationTest,
        pkt_size: u32,
        general: &General,
    ) -> Result<CalibrationPoint> {
        let precision = general.test_precision;
        let mut lower = test.lower_bound(pkt_size);
        let mut upper = test.upper_bound(pkt_size);

        let mut adjust = precision;
        while upper - lower > adjust {
            adjust *= 2.0;
        }
        let mut adjust = (upper - lower - adjust) / 2.0;

        let mut value = upper;
        let mut best = ProbeOutcome::default();

        while upper - lower >= precision {
            debug!(lower, upper, value, "probing");

            test.prepare(pkt_size, value).await?;
            let outcome = test
                .run_probe(pkt_size, general.test_duration, value)
                .await?;
            test.cleanup(pkt_size).await?;

            if outcome.success {
                debug!(value, "success, raising lower bound");
                lower = value;
                best = outcome;
            } else {
                debug!(value, "failure, lowering upper bound");
                upper = value;
            }

            value = lower + (upper - lower) / 2.0 + adjust;
            adjust = 0.0;
        }

        Ok(CalibrationPoint {
            pkt_size,
            value: lower,
            success: best.success,
            throughput_mpps: (best.throughput_mpps * 100.0).round() / 100.0,
            loss_pct: best.loss_pct,
            latency: best.latency,
            duration_secs: 0.0,
        })
    }
}

impl Default for BinarySearch {
    fn default() -> Self {
        Self::new()
    }
}
