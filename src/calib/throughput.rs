//! Generic forwarding-throughput test: the tester generates load on one core
//! and timestamps latency on another, the SUT forwards, and a probe succeeds
//! when the end-to-end loss stays within the tolerated percentage.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time;
use tracing::debug;

use crate::calib::rates::line_rate_to_pps;
use crate::calib::{CalibrationPoint, CalibrationTest, ProbeOutcome};
use crate::config::Config;
use crate::proto::client::TcpControlClient;
use crate::remote::host::CONNECT_DEADLINE;
use crate::remote::{cpu_id, RemoteHost};

/// Wait after starting generation before the first sample, and again after
/// stopping the generator so in-flight packets drain before loss is counted.
const SETTLE_WINDOW: Duration = Duration::from_secs(2);

/// Core roles on the tester, as ordinals within its NUMA socket. Core 0 is
/// left to the engine's master thread.
const GEN_CORE: u32 = 1;
const LAT_CORE: u32 = 2;

pub struct ThroughputTest {
    cfg: Config,
    tester: Option<TcpControlClient>,
    sut: Option<TcpControlClient>,
    gen_core: u32,
    lat_core: u32,
    kpi: Option<String>,
}

impl ThroughputTest {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            tester: None,
            sut: None,
            gen_core: 0,
            lat_core: 0,
            kpi: None,
        }
    }
}

#[async_trait]
impl CalibrationTest for ThroughputTest {
    fn name(&self) -> &'static str {
        "throughput"
    }

    fn description(&self) -> &'static str {
        "Maximum forwarding throughput within the tolerated packet loss"
    }

    fn lower_bound(&self, _pkt_size: u32) -> f64 {
        0.0
    }

    fn upper_bound(&self, _pkt_size: u32) -> f64 {
        100.0
    }

    async fn setup(&mut self) -> Result<()> {
        let mut tester_host = RemoteHost::from_config("tester", &self.cfg.tester);
        let mut sut_host = RemoteHost::from_config("sut", &self.cfg.sut);

        let topology = tester_host
            .cpu_topology()
            .await
            .context("failed to read tester cpu topology")?;
        let socket = self.cfg.tester.socket_id;
        self.gen_core = cpu_id(&topology, GEN_CORE, socket, false)?;
        self.lat_core = cpu_id(&topology, LAT_CORE, socket, false)?;

        self.tester = Some(launch_endpoint(&mut tester_host, &self.cfg.tester.engine_args, self.cfg.tester.config_file.as_deref()).await?);
        self.sut = Some(launch_endpoint(&mut sut_host, &self.cfg.sut.engine_args, self.cfg.sut.config_file.as_deref()).await?);
        Ok(())
    }

    async fn run_probe(
        &mut self,
        pkt_size: u32,
        duration: f64,
        value: f64,
    ) -> Result<ProbeOutcome> {
        let gen_core = self.gen_core;
        let lat_core = self.lat_core;
        let tester = self.tester.as_mut().context("tester not set up")?;

        tester.stop_all().await?;
        tester.reset_stats().await?;
        tester.set_pkt_size(&[gen_core], pkt_size).await?;
        tester.set_speed(&[gen_core], value).await?;
        tester.start_all().await?;

        let hz = tester.hz().await?;
        time::sleep(SETTLE_WINDOW).await;
        let start = tester.tot_stats().await?;
        time::sleep(Duration::from_secs_f64(duration)).await;
        // Sample before stopping the cores: stopping takes long enough to
        // skew the window otherwise.
        let stop = tester.tot_stats().await?;

        tester.stop(&[gen_core], None).await?;
        time::sleep(SETTLE_WINDOW).await;
        let latency = tester.lat_stats(&[lat_core], 0).await?;
        tester.stop_all().await?;

        let tx = stop.tx.saturating_sub(start.tx);
        let tsc = stop.tsc.saturating_sub(start.tsc);
        let mpps = if tsc > 0 && hz > 0 {
            tx as f64 / (tsc as f64 / hz as f64) / 1_000_000.0
        } else {
            0.0
        };

        let ports: Vec<u32> = (0..self.cfg.general.number_of_ports).collect();
        let port_totals = tester.port_stats(&ports).await?;
        let rx_total = port_totals[6];
        let tx_total = port_totals[7];

        let can_be_lost = (tx_total as f64 * self.cfg.general.tolerated_loss / 100.0) as u64;
        let lost = tx_total.saturating_sub(rx_total);
        debug!(rx_total, tx_total, lost, can_be_lost, "loss accounting");

        let configured_pps = (value / 100.0) * line_rate_to_pps(pkt_size, 1);
        debug!(
            configured_mpps = configured_pps / 1_000_000.0,
            effective_mpps = mpps,
            "probe rates"
        );

        let loss_pct = if tx_total > 0 {
            100.0 * lost as f64 / tx_total as f64
        } else {
            0.0
        };

        Ok(ProbeOutcome {
            success: lost <= can_be_lost,
            throughput_mpps: mpps,
            loss_pct,
            latency: Some(latency),
        })
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(tester) = self.tester.as_mut() {
            tester.stop_all().await.ok();
        }
        if let Some(sut) = self.sut.as_mut() {
            sut.stop_all().await.ok();
        }
        self.tester = None;
        self.sut = None;
        Ok(())
    }

    fn update_kpi(&mut self, point: &CalibrationPoint) {
        // The headline number is the 64-byte throughput.
        if point.pkt_size == 64 {
            self.kpi = Some(format!("{:.2} Mpps", point.throughput_mpps));
        }
    }

    fn kpi(&self) -> String {
        self.kpi
            .clone()
            .unwrap_or_else(|| "***Not measured***".to_string())
    }
}

async fn launch_endpoint(
    host: &mut RemoteHost,
    args: &str,
    config_file: Option<&str>,
) -> Result<TcpControlClient> {
    let client = match config_file {
        Some(file) => host.run_with_config(Path::new(file), args).await?,
        None => host.run_with_retry(args, CONNECT_DEADLINE).await?,
    };
    Ok(client)
}
