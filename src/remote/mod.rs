//! Remote endpoint management: launch the traffic engine on a remote host,
//! retry-connect to its control port, and introspect the host's hardware.

pub mod exec;
pub mod host;
pub mod topology;

pub use exec::{CommandRunner, ExecOutput, SshRunner};
pub use host::RemoteHost;
pub use topology::{cpu_id, CpuTopology};

use thiserror::Error;

use crate::config::EndpointConfig;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The engine's launch command exited nonzero before a connection could
    /// be made. Carries whatever the launch command printed.
    #[error("traffic engine failed to start on {host}: {output}")]
    LaunchFailed { host: String, output: String },

    /// No successful connection within the deadline and no launch failure
    /// either; the host may not accept connections on the control port.
    #[error(
        "failed to connect to the traffic engine, check if {host} accepts connections on port {port}"
    )]
    ConnectTimeout { host: String, port: u16 },
}

/// Identity of one remote host. Immutable after construction; one per
/// tester/SUT role.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub addr: String,
    pub user: String,
    pub engine_dir: String,
    pub engine_bin: String,
    pub socket_id: u32,
    pub control_port: u16,
}

impl Endpoint {
    pub fn from_config(name: &str, cfg: &EndpointConfig) -> Self {
        Self {
            name: name.to_string(),
            addr: cfg.ip.clone(),
            user: cfg.user.clone(),
            engine_dir: cfg.engine_dir.clone(),
            engine_bin: cfg.engine_bin.clone(),
            socket_id: cfg.socket_id,
            control_port: cfg.control_port,
        }
    }
}
