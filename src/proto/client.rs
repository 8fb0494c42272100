//! Request/response client for the traffic engine's control port.
//!
//! The protocol is strictly request/response: one command is in flight at a
//! time, and a new command is only sent once the previous response (including
//! any interleaved capture records) has been consumed. The client owns its
//! stream exclusively, which is what enforces that discipline.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::proto::{CaptureRecord, ControlCodec, ControlEvent, ProtocolError};

/// Per-read timeout used when a command expects a response line.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settle delays after state-changing commands. The engine applies some
/// commands asynchronously; issuing the next command too early yields stale
/// statistics. These are part of the protocol contract, not tuning knobs.
const SETTLE_STOP: Duration = Duration::from_secs(3);
const SETTLE_START: Duration = Duration::from_secs(3);
const SETTLE_RESET: Duration = Duration::from_secs(1);
const SETTLE_PKT_SIZE: Duration = Duration::from_secs(1);
const SETTLE_DUMP: Duration = Duration::from_millis(1500);

/// Latency counters for one execution unit, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Latency {
    pub min: u64,
    pub max: u64,
    pub avg: u64,
}

/// Summed per-core counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreStats {
    pub rx: u64,
    pub tx: u64,
    pub drop: u64,
    /// Cycle counter of the last core queried.
    pub tsc: u64,
}

/// Aggregate counters for the whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalStats {
    pub rx: u64,
    pub tx: u64,
    pub tsc: u64,
    /// Cycle counter frequency in Hz.
    pub hz: u64,
}

/// Speed assignment for [`ControlClient::slope_speed`].
#[derive(Debug, Clone)]
pub struct CoreSpeed {
    pub cores: Vec<u32>,
    pub speed: f64,
}

pub struct ControlClient<S> {
    framed: Framed<S, ControlCodec>,
    captures: VecDeque<CaptureRecord>,
    /// A regular line that arrived during a capture-only read; handed to the
    /// next `receive` call so no response is lost.
    pending_line: Option<String>,
}

/// The production client over the engine's TCP control port.
pub type TcpControlClient = ControlClient<TcpStream>;

impl<S: AsyncRead + AsyncWrite + Unpin> ControlClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, ControlCodec::new()),
            captures: VecDeque::new(),
            pending_line: None,
        }
    }

    /// Write one command to the engine. The caller supplies the trailing
    /// newline; nothing is read back.
    pub async fn send(&mut self, command: &str) -> Result<(), ProtocolError> {
        debug!(command = command.trim_end(), "sending control command");
        self.framed.send(command.to_string()).await
    }

    /// Read until a regular response line arrives, transparently queueing any
    /// capture records found along the way. Returns `None` if nothing becomes
    /// readable within `timeout` -- that is "no more data this cycle", not an
    /// error.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.pending_line.take() {
            return Ok(Some(line));
        }
        loop {
            match time::timeout(timeout, self.framed.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(ProtocolError::ConnectionClosed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(ControlEvent::Capture(c)))) => self.captures.push_back(c),
                Ok(Some(Ok(ControlEvent::Line(line)))) => {
                    debug!(response = %line, "received control response");
                    return Ok(Some(line));
                }
            }
        }
    }

    /// Read until one capture record has been fully consumed and queued.
    /// Returns false on timeout.
    pub async fn receive_capture(&mut self, timeout: Duration) -> Result<bool, ProtocolError> {
        loop {
            match time::timeout(timeout, self.framed.next()).await {
                Err(_) => return Ok(false),
                Ok(None) => return Err(ProtocolError::ConnectionClosed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(ControlEvent::Capture(c)))) => {
                    self.captures.push_back(c);
                    return Ok(true);
                }
                Ok(Some(Ok(ControlEvent::Line(line)))) => {
                    debug!(response = %line, "regular line during capture-only read, stashing");
                    self.pending_line = Some(line);
                }
            }
        }
    }

    /// Dequeue the oldest pending capture record. Never blocks.
    pub fn pop_capture(&mut self) -> Option<CaptureRecord> {
        self.captures.pop_front()
    }

    async fn query(&mut self, command: &str) -> Result<String, ProtocolError> {
        self.send(command).await?;
        self.receive(RESPONSE_TIMEOUT)
            .await?
            .ok_or_else(|| ProtocolError::NoResponse {
                command: command.trim_end().to_string(),
            })
    }

    fn parse_fields(command: &str, response: &str, n: usize) -> Result<Vec<u64>, ProtocolError> {
        let fields: Result<Vec<u64>, _> = response
            .split(',')
            .take(n)
            .map(|f| f.trim().parse::<u64>())
            .collect();
        match fields {
            Ok(v) if v.len() == n => Ok(v),
            _ => Err(ProtocolError::BadResponse {
                command: command.trim_end().to_string(),
                response: response.to_string(),
            }),
        }
    }

    fn core_list(cores: &[u32]) -> String {
        cores
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Stop all cores on the remote instance.
    pub async fn stop_all(&mut self) -> Result<(), ProtocolError> {
        debug!("stop all");
        self.send("stop all\n").await?;
        time::sleep(SETTLE_STOP).await;
        Ok(())
    }

    /// Stop specific cores, optionally a single task on them.
    pub async fn stop(&mut self, cores: &[u32], task: Option<u32>) -> Result<(), ProtocolError> {
        debug!(?cores, ?task, "stopping cores");
        let task_part = task.map(|t| format!(" {}", t)).unwrap_or_default();
        self.send(&format!("stop {}{}\n", Self::core_list(cores), task_part))
            .await?;
        time::sleep(SETTLE_STOP).await;
        Ok(())
    }

    /// Start all cores. No settle delay: generation begins immediately and
    /// the caller times the measurement window itself.
    pub async fn start_all(&mut self) -> Result<(), ProtocolError> {
        debug!("start all");
        self.send("start all\n").await
    }

    pub async fn start(&mut self, cores: &[u32]) -> Result<(), ProtocolError> {
        debug!(?cores, "starting cores");
        self.send(&format!("start {}\n", Self::core_list(cores)))
            .await?;
        time::sleep(SETTLE_START).await;
        Ok(())
    }

    pub async fn reset_stats(&mut self) -> Result<(), ProtocolError> {
        debug!("reset stats");
        self.send("reset stats\n").await?;
        time::sleep(SETTLE_RESET).await;
        Ok(())
    }

    /// Stop everything and reset statistics, the usual probe preamble.
    pub async fn stop_all_and_reset(&mut self) -> Result<(), ProtocolError> {
        self.stop_all().await?;
        self.reset_stats().await
    }

    /// Set the generated packet size on the given cores. The engine expects
    /// the size without the 4-byte CRC, which it appends itself.
    pub async fn set_pkt_size(&mut self, cores: &[u32], pkt_size: u32) -> Result<(), ProtocolError> {
        debug!(?cores, pkt_size, "setting packet size");
        for core in cores {
            self.send(&format!("pkt_size {} 0 {}\n", core, pkt_size.saturating_sub(4)))
                .await?;
        }
        time::sleep(SETTLE_PKT_SIZE).await;
        Ok(())
    }

    /// Overwrite `length` bytes of the generated packet at `offset`.
    pub async fn set_value(
        &mut self,
        cores: &[u32],
        offset: u32,
        value: u64,
        length: u32,
    ) -> Result<(), ProtocolError> {
        debug!(?cores, offset, value, length, "setting packet bytes");
        for core in cores {
            self.send(&format!(
                "set value {} 0 {} {} {}\n",
                core, offset, value, length
            ))
            .await?;
        }
        Ok(())
    }

    pub async fn reset_values(&mut self, cores: &[u32]) -> Result<(), ProtocolError> {
        debug!(?cores, "resetting packet bytes");
        for core in cores {
            self.send(&format!("reset values {} 0\n", core)).await?;
        }
        Ok(())
    }

    /// Set the offered load as a percentage of line rate.
    pub async fn set_speed(&mut self, cores: &[u32], speed: f64) -> Result<(), ProtocolError> {
        debug!(?cores, speed, "setting speed");
        for core in cores {
            self.send(&format!("speed {} 0 {}\n", core, speed)).await?;
        }
        Ok(())
    }

    /// Ramp each core group from zero up to its target speed over `duration`
    /// seconds. With `n_steps == 0` a step is taken every half second.
    pub async fn slope_speed(
        &mut self,
        cores_speed: &[CoreSpeed],
        duration: f64,
        n_steps: usize,
    ) -> Result<(), ProtocolError> {
        let n_steps = if n_steps == 0 {
            (duration * 2.0) as usize
        } else {
            n_steps
        };
        let step_duration = duration / n_steps as f64;
        let deltas: Vec<f64> = cores_speed.iter().map(|a| a.speed / n_steps as f64).collect();
        let mut current: Vec<f64> = vec![0.0; cores_speed.len()];

        for step in 0..n_steps {
            time::sleep(Duration::from_secs_f64(step_duration)).await;
            for (idx, assignment) in cores_speed.iter().enumerate() {
                // Set the final step directly to avoid accumulated rounding.
                if step + 1 == n_steps {
                    current[idx] = assignment.speed;
                } else {
                    current[idx] += deltas[idx];
                }
                self.set_speed(&assignment.cores, current[idx]).await?;
            }
        }
        Ok(())
    }

    /// Set the offered load in packets per second, converted to a percentage
    /// of the 10GbE line rate for the given packet size.
    pub async fn set_pps(
        &mut self,
        cores: &[u32],
        pps: f64,
        pkt_size: u32,
    ) -> Result<(), ProtocolError> {
        debug!(?cores, pps, pkt_size, "setting packets per second");
        let speed = pps / (1_250_000_000.0 / (pkt_size as f64 + 20.0));
        for core in cores {
            self.send(&format!("speed {} 0 {}\n", core, speed)).await?;
        }
        Ok(())
    }

    /// Set the number of packets to send on the given cores.
    pub async fn set_count(&mut self, count: u64, cores: &[u32]) -> Result<(), ProtocolError> {
        for core in cores {
            self.send(&format!("count {} 0 {}\n", core, count)).await?;
        }
        Ok(())
    }

    /// Latency counters per core, keyed by core id.
    pub async fn lat_stats(
        &mut self,
        cores: &[u32],
        task: u32,
    ) -> Result<BTreeMap<u32, Latency>, ProtocolError> {
        let mut out = BTreeMap::new();
        for &core in cores {
            let command = format!("lat stats {} {} \n", core, task);
            let response = self.query(&command).await?;
            let fields = Self::parse_fields(&command, &response, 3)?;
            out.insert(
                core,
                Latency {
                    min: fields[0],
                    max: fields[1],
                    avg: fields[2],
                },
            );
        }
        Ok(out)
    }

    /// Receive/transmit/drop counters summed over the given cores.
    pub async fn core_stats(&mut self, cores: &[u32], task: u32) -> Result<CoreStats, ProtocolError> {
        let mut stats = CoreStats {
            rx: 0,
            tx: 0,
            drop: 0,
            tsc: 0,
        };
        for &core in cores {
            let command = format!("core stats {} {}\n", core, task);
            let response = self.query(&command).await?;
            let fields = Self::parse_fields(&command, &response, 4)?;
            stats.rx += fields[0];
            stats.tx += fields[1];
            stats.drop += fields[2];
            stats.tsc = fields[3];
        }
        Ok(stats)
    }

    /// Aggregate counters and the cycle counter frequency.
    pub async fn tot_stats(&mut self) -> Result<TotalStats, ProtocolError> {
        let command = "tot stats\n";
        let response = self.query(command).await?;
        let fields = Self::parse_fields(command, &response, 4)?;
        Ok(TotalStats {
            rx: fields[0],
            tx: fields[1],
            tsc: fields[2],
            hz: fields[3],
        })
    }

    /// Cycle counter frequency of the remote instance.
    pub async fn hz(&mut self) -> Result<u64, ProtocolError> {
        Ok(self.tot_stats().await?.hz)
    }

    /// Total input-error count and the cycle counter it was read at.
    pub async fn tot_ierrors(&mut self) -> Result<(u64, u64), ProtocolError> {
        let command = "tot ierrors tot\n";
        let response = self.query(command).await?;
        let fields = Self::parse_fields(command, &response, 2)?;
        Ok((fields[0], fields[1]))
    }

    /// The 12 hardware counters of each port, summed element-wise.
    pub async fn port_stats(&mut self, ports: &[u32]) -> Result<[u64; 12], ProtocolError> {
        let mut totals = [0u64; 12];
        for &port in ports {
            let command = format!("port_stats {}\n", port);
            let response = self.query(&command).await?;
            let fields = Self::parse_fields(&command, &response, 12)?;
            for (t, f) in totals.iter_mut().zip(fields) {
                *t += f;
            }
        }
        Ok(totals)
    }

    /// Ask the engine to capture `count` packets on the receive path of one
    /// core. The captures arrive as `pktdump` records on this stream.
    pub async fn dump_rx(
        &mut self,
        core: u32,
        task: u32,
        count: u32,
    ) -> Result<(), ProtocolError> {
        debug!(core, task, count, "activating rx dump");
        self.send(&format!("dump_rx {} {} {}\n", core, task, count))
            .await?;
        // Give the engine time to arm packet dumping.
        time::sleep(SETTLE_DUMP).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (ControlClient<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (ControlClient::new(near), far)
    }

    async fn read_command(far: &mut tokio::io::DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        far.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_queues_captures_before_response() {
        let (mut client, mut far) = pair();
        far.write_all(b"pktdump,0,4\nabcd\npktdump,1,0\n\n12,34\n")
            .await
            .unwrap();

        let line = client.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line.as_deref(), Some("12,34"));

        let first = client.pop_capture().unwrap();
        assert_eq!(first.port_id(), 0);
        assert_eq!(first.payload(), b"abcd");
        let second = client.pop_capture().unwrap();
        assert_eq!(second.port_id(), 1);
        assert!(second.is_empty());

        // Empty queue keeps returning None.
        assert!(client.pop_capture().is_none());
        assert!(client.pop_capture().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_as_none() {
        let (mut client, _far) = pair();
        let got = client.receive(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_capture_only() {
        let (mut client, mut far) = pair();
        far.write_all(b"pktdump,2,3\nxyz\n").await.unwrap();

        assert!(client.receive_capture(Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.pop_capture().unwrap().payload(), b"xyz");
        assert!(!client.receive_capture(Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_only_stashes_regular_line() {
        let (mut client, mut far) = pair();
        far.write_all(b"100,200\npktdump,0,1\nz\n").await.unwrap();

        assert!(client.receive_capture(Duration::from_secs(1)).await.unwrap());
        // The line that arrived first must not be lost.
        let line = client.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(line.as_deref(), Some("100,200"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tot_stats_parses_fields() {
        let (mut client, mut far) = pair();
        far.write_all(b"100,200,300,2700000000\n").await.unwrap();

        let stats = client.tot_stats().await.unwrap();
        assert_eq!(stats.rx, 100);
        assert_eq!(stats.tx, 200);
        assert_eq!(stats.tsc, 300);
        assert_eq!(stats.hz, 2_700_000_000);

        let sent = read_command(&mut far, "tot stats\n".len()).await;
        assert_eq!(sent, "tot stats\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_formats_core_list_and_task() {
        let (mut client, mut far) = pair();
        client.stop(&[1, 2, 3], Some(0)).await.unwrap();
        let sent = read_command(&mut far, "stop 1,2,3 0\n".len()).await;
        assert_eq!(sent, "stop 1,2,3 0\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_pkt_size_subtracts_crc() {
        let (mut client, mut far) = pair();
        client.set_pkt_size(&[4], 64).await.unwrap();
        let sent = read_command(&mut far, "pkt_size 4 0 60\n".len()).await;
        assert_eq!(sent, "pkt_size 4 0 60\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lat_stats_per_core() {
        let (mut client, mut far) = pair();
        far.write_all(b"10,90,45\n20,80,50\n").await.unwrap();

        let stats = client.lat_stats(&[5, 6], 0).await.unwrap();
        assert_eq!(
            stats[&5],
            Latency {
                min: 10,
                max: 90,
                avg: 45
            }
        );
        assert_eq!(stats[&6].avg, 50);

        let sent = read_command(&mut far, "lat stats 5 0 \nlat stats 6 0 \n".len()).await;
        assert_eq!(sent, "lat stats 5 0 \nlat stats 6 0 \n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_stats_sums_ports() {
        let (mut client, mut far) = pair();
        let one: String = (1..=12).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        far.write_all(format!("{one}\n{one}\n").as_bytes()).await.unwrap();

        let totals = client.port_stats(&[0, 1]).await.unwrap();
        assert_eq!(totals[0], 2);
        assert_eq!(totals[11], 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_value_and_reset_values_wire_format() {
        let (mut client, mut far) = pair();
        client.set_value(&[2], 14, 300, 4).await.unwrap();
        client.reset_values(&[1, 2]).await.unwrap();

        let expected = "set value 2 0 14 300 4\nreset values 1 0\nreset values 2 0\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_speed_per_core() {
        let (mut client, mut far) = pair();
        client.set_speed(&[3, 4], 42.5).await.unwrap();

        let expected = "speed 3 0 42.5\nspeed 4 0 42.5\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_pps_converts_to_line_rate_percent() {
        let (mut client, mut far) = pair();
        // 105-byte packets occupy 125 bytes on the wire, so line rate is
        // exactly 1e7 pps and 5e6 pps is half speed.
        client.set_pps(&[1], 5_000_000.0, 105).await.unwrap();

        let expected = "speed 1 0 0.5\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_count_per_core() {
        let (mut client, mut far) = pair();
        client.set_count(1000, &[1, 2]).await.unwrap();

        let expected = "count 1 0 1000\ncount 2 0 1000\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slope_speed_lands_exactly_on_target() {
        let (mut client, mut far) = pair();
        let assignments = [CoreSpeed {
            cores: vec![1],
            speed: 40.0,
        }];
        client.slope_speed(&assignments, 2.0, 2).await.unwrap();

        let expected = "speed 1 0 20\nspeed 1 0 40\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_core_stats_sums_cores_and_keeps_last_tsc() {
        let (mut client, mut far) = pair();
        far.write_all(b"10,20,5,1000\n30,40,7,2000\n").await.unwrap();

        let stats = client.core_stats(&[1, 2], 0).await.unwrap();
        assert_eq!(stats.rx, 40);
        assert_eq!(stats.tx, 60);
        assert_eq!(stats.drop, 12);
        assert_eq!(stats.tsc, 2000);

        let expected = "core stats 1 0\ncore stats 2 0\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tot_ierrors_parses_count_and_tsc() {
        let (mut client, mut far) = pair();
        far.write_all(b"5,123456\n").await.unwrap();

        assert_eq!(client.tot_ierrors().await.unwrap(), (5, 123456));

        let expected = "tot ierrors tot\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_rx_wire_format() {
        let (mut client, mut far) = pair();
        client.dump_rx(1, 0, 8).await.unwrap();

        let expected = "dump_rx 1 0 8\n";
        assert_eq!(read_command(&mut far, expected.len()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_without_response_is_an_error() {
        let (mut client, _far) = pair();
        let err = client.tot_stats().await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_response_is_an_error() {
        let (mut client, mut far) = pair();
        far.write_all(b"not,numbers,at,all\n").await.unwrap();
        let err = client.tot_stats().await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadResponse { .. }));
    }
}
