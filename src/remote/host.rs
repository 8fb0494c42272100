//! Bring a traffic engine instance up on a remote host and hand back a ready
//! control client.
//!
//! Launching is fire-and-forget: the launch command runs in a background task
//! while the connect loop polls the control port once per second. The two
//! sides communicate only through a write-once failure latch, so an engine
//! that dies immediately is reported right away instead of after the full
//! connect deadline.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, trace};

use crate::config::EndpointConfig;
use crate::proto::client::TcpControlClient;
use crate::proto::ControlClient;
use crate::remote::exec::{CommandRunner, ExecOutput, SshRunner};
use crate::remote::topology::{parse_lscpu, CpuTopology};
use crate::remote::{Endpoint, RemoteError};

/// How long `run_with_retry` keeps polling the control port by default.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(120);

/// Free and reserved hugepage counts on NUMA node 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugepageCounts {
    pub two_mb: u64,
    pub one_gb: u64,
}

pub struct RemoteHost {
    endpoint: Endpoint,
    runner: Arc<dyn CommandRunner>,
    launch_failure: Arc<OnceLock<String>>,
}

impl RemoteHost {
    pub fn new(endpoint: Endpoint, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            endpoint,
            runner,
            launch_failure: Arc::new(OnceLock::new()),
        }
    }

    pub fn from_config(name: &str, cfg: &EndpointConfig) -> Self {
        let endpoint = Endpoint::from_config(name, cfg);
        let runner = Arc::new(SshRunner::new(&endpoint.user, &endpoint.addr));
        Self::new(endpoint, runner)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run one shell command on the remote host.
    pub async fn run_cmd(&self, cmd: &str) -> Result<ExecOutput> {
        self.runner.run(cmd).await
    }

    /// Kill any previous engine instance, then start a new one with the given
    /// arguments in a background task. Returns as soon as the launch command
    /// is underway; a nonzero exit is recorded in the failure latch that
    /// `run_with_retry` watches.
    pub async fn launch(&mut self, args: &str) -> Result<()> {
        let bin_name = Path::new(&self.endpoint.engine_bin)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.endpoint.engine_bin.clone());

        // Freeing a large hugepage allocation takes a while. Without -w a new
        // instance can start before the pages are back and fail to allocate.
        self.runner
            .run(&format!("sudo killall -w {} 2>/dev/null", bin_name))
            .await
            .ok();

        let cmd = format!(
            "cd {}; sudo {} {}",
            self.endpoint.engine_dir, self.endpoint.engine_bin, args
        );
        info!(host = %self.endpoint.addr, %cmd, "launching traffic engine");

        let latch = Arc::new(OnceLock::new());
        self.launch_failure = latch.clone();
        let runner = self.runner.clone();
        tokio::spawn(async move {
            match runner.run(&cmd).await {
                Ok(out) if !out.success() => {
                    let _ = latch.set(out.output);
                }
                Err(e) => {
                    let _ = latch.set(e.to_string());
                }
                Ok(_) => {}
            }
        });
        Ok(())
    }

    /// One connection attempt to the engine's control port.
    pub async fn connect(&self) -> Result<TcpControlClient> {
        let stream = TcpStream::connect((self.endpoint.addr.as_str(), self.endpoint.control_port))
            .await
            .with_context(|| {
                format!(
                    "failed to connect to the traffic engine on {}:{}",
                    self.endpoint.addr, self.endpoint.control_port
                )
            })?;
        Ok(ControlClient::new(stream))
    }

    /// Launch the engine and poll the control port once per second until it
    /// accepts a connection, the launch fails, or `deadline` expires.
    pub async fn run_with_retry(
        &mut self,
        args: &str,
        deadline: Duration,
    ) -> Result<TcpControlClient, RemoteError> {
        self.launch(args).await.map_err(|e| RemoteError::LaunchFailed {
            host: self.endpoint.addr.clone(),
            output: e.to_string(),
        })?;

        debug!(host = %self.endpoint.addr, "waiting for the traffic engine to settle");
        let latch = self.launch_failure.clone();
        let host = self.endpoint.addr.clone();
        let port = self.endpoint.control_port;
        let this = &*self;
        poll_until_ready(deadline, &latch, &host, port, move || this.connect()).await
    }

    /// Copy a local engine config file to the remote host and launch with
    /// `-f <remote path>`.
    pub async fn run_with_config(
        &mut self,
        local_config: &Path,
        args: &str,
    ) -> Result<TcpControlClient> {
        let remote = self.copy_extra_config(local_config).await?;
        let client = self
            .run_with_retry(&format!("{} -f {}", args, remote), CONNECT_DEADLINE)
            .await?;
        info!(host = %self.endpoint.addr, name = %self.endpoint.name, "connected to traffic engine");
        Ok(client)
    }

    /// Copy an auxiliary config file into /tmp on the remote host. Returns
    /// the remote path.
    pub async fn copy_extra_config(&self, local: &Path) -> Result<String> {
        if !local.is_file() {
            bail!("config file {} does not exist", local.display());
        }
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = format!("/tmp/{}", name);
        debug!(local = %local.display(), %remote, "copying engine config");
        let out = self.runner.copy_to(local, &remote).await?;
        if !out.success() {
            bail!("failed to copy {} to {}: {}", local.display(), remote, out.output);
        }
        Ok(remote)
    }

    /// CPU topology of the remote host as socket -> core -> hwthreads.
    pub async fn cpu_topology(&self) -> Result<CpuTopology> {
        let out = self.runner.run("lscpu -p=cpu,core,socket").await?;
        if !out.success() {
            bail!(
                "lscpu failed on {}: {}",
                self.endpoint.addr,
                out.output
            );
        }
        parse_lscpu(&out.output)
    }

    pub async fn core_count(&self) -> Result<u32> {
        let out = self
            .runner
            .run("cat /proc/cpuinfo | grep processor | wc -l")
            .await?;
        out.output
            .trim()
            .parse()
            .with_context(|| format!("unexpected core count output {:?}", out.output))
    }

    /// Hugepage counts on node 0; a missing sysfs entry reads as 0.
    pub async fn hugepage_counts(&self) -> Result<HugepageCounts> {
        let read = |path: &str| {
            let cmd = format!("cat {} 2>/dev/null", path);
            async move {
                let parsed = self
                    .runner
                    .run(&cmd)
                    .await
                    .ok()
                    .filter(|out| out.success())
                    .and_then(|out| out.output.trim().parse::<u64>().ok());
                parsed.unwrap_or(0)
            }
        };
        let two_mb =
            read("/sys/devices/system/node/node0/hugepages/hugepages-2048kB/nr_hugepages").await;
        let one_gb =
            read("/sys/devices/system/node/node0/hugepages/hugepages-1048576kB/nr_hugepages").await;
        Ok(HugepageCounts { two_mb, one_gb })
    }

    /// (Re)mount the hugetlbfs the engine allocates from.
    pub async fn mount_hugepages(&self, directory: &str) -> Result<()> {
        self.runner
            .run(&format!("sudo mkdir -p {}", directory))
            .await?;
        // Unmount may legitimately fail if nothing was mounted.
        self.runner
            .run(&format!("sudo umount {}", directory))
            .await
            .ok();
        self.runner
            .run(&format!("sudo mount -t hugetlbfs nodev {}", directory))
            .await?;
        Ok(())
    }
}

/// The bounded-retry loop shared by `run_with_retry`: poll once per second,
/// stop immediately on a sticky launch failure, give up when the countdown
/// reaches zero.
pub(crate) async fn poll_until_ready<T, F, Fut>(
    deadline: Duration,
    failure: &OnceLock<String>,
    host: &str,
    port: u16,
    mut attempt: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut countdown = deadline.as_secs().max(1);
    loop {
        time::sleep(Duration::from_secs(1)).await;
        countdown -= 1;

        match attempt().await {
            Ok(ready) => return Ok(ready),
            Err(e) => trace!(%host, error = %e, "connect attempt failed"),
        }
        if let Some(output) = failure.get() {
            return Err(RemoteError::LaunchFailed {
                host: host.to_string(),
                output: output.clone(),
            });
        }
        if countdown == 0 {
            return Err(RemoteError::ConnectTimeout {
                host: host.to_string(),
                port,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockRunner {
        commands: Mutex<Vec<String>>,
        launch_status: i32,
        launch_output: &'static str,
    }

    impl MockRunner {
        fn new(launch_status: i32, launch_output: &'static str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                launch_status,
                launch_output,
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, cmd: &str) -> Result<ExecOutput> {
            self.commands.lock().unwrap().push(cmd.to_string());
            if cmd.starts_with("sudo killall") {
                return Ok(ExecOutput {
                    status: 0,
                    output: String::new(),
                });
            }
            Ok(ExecOutput {
                status: self.launch_status,
                output: self.launch_output.to_string(),
            })
        }

        async fn copy_to(&self, _local: &Path, _remote: &str) -> Result<ExecOutput> {
            Ok(ExecOutput {
                status: 0,
                output: String::new(),
            })
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            name: "tester".into(),
            addr: "192.0.2.1".into(),
            user: "root".into(),
            engine_dir: "/root/engine".into(),
            engine_bin: "./build/prox".into(),
            socket_id: 0,
            control_port: 8474,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_launch_failure_short_circuits() {
        let failure = Arc::new(OnceLock::new());
        let latch = failure.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(1500)).await;
            let _ = latch.set("segfault on startup".to_string());
        });

        let started = time::Instant::now();
        let result: Result<(), RemoteError> = poll_until_ready(
            Duration::from_secs(120),
            &failure,
            "192.0.2.1",
            8474,
            || async { bail!("connection refused") },
        )
        .await;

        match result {
            Err(RemoteError::LaunchFailed { host, output }) => {
                assert_eq!(host, "192.0.2.1");
                assert_eq!(output, "segfault on startup");
            }
            other => panic!("expected LaunchFailed, got {:?}", other),
        }
        // Must give up within a couple of poll intervals, not the deadline.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exhaustion_is_a_connect_timeout() {
        let failure = OnceLock::new();
        let started = time::Instant::now();
        let result: Result<(), RemoteError> =
            poll_until_ready(Duration::from_secs(5), &failure, "192.0.2.7", 8474, || async {
                bail!("connection refused")
            })
            .await;

        match result {
            Err(RemoteError::ConnectTimeout { host, port }) => {
                assert_eq!(host, "192.0.2.7");
                assert_eq!(port, 8474);
            }
            other => panic!("expected ConnectTimeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_polling() {
        let failure = OnceLock::new();
        let mut attempts = 0;
        let result = poll_until_ready(Duration::from_secs(120), &failure, "h", 1, || {
            attempts += 1;
            let ok = attempts >= 3;
            async move {
                if ok {
                    Ok(42u32)
                } else {
                    bail!("not yet")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_launch_failure_sets_latch() {
        let runner = Arc::new(MockRunner::new(1, "hugepage allocation failed"));
        let mut host = RemoteHost::new(endpoint(), runner.clone());

        host.launch("-t").await.unwrap();
        // Let the background launch task run to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            host.launch_failure.get().map(String::as_str),
            Some("hugepage allocation failed")
        );
        let commands = runner.commands.lock().unwrap();
        assert!(commands[0].starts_with("sudo killall -w prox"));
        assert!(commands[1].contains("cd /root/engine; sudo ./build/prox -t"));
    }

    #[tokio::test]
    async fn test_clean_launch_leaves_latch_unset() {
        let runner = Arc::new(MockRunner::new(0, ""));
        let mut host = RemoteHost::new(endpoint(), runner);
        host.launch("-t").await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(host.launch_failure.get().is_none());
    }
}
