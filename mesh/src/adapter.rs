use async_trait::async_trait;
use common::error::OracleError;
use tokio::sync::mpsc;

use crate::simulator::SimulatorAdapter;

/// Capability every mesh transport must provide (`spec.md` §6). Inbound
/// messages are delivered out-of-band onto the channel the adapter was
/// constructed with; this trait only covers the outbound/lifecycle
/// half of the contract.
#[async_trait]
pub trait MeshAdapter: Send + Sync {
    /// Establishes the transport connection. Returns `false` (never an
    /// `Err`) on failure so callers can fall back to `reconnect_loop`.
    async fn connect(&self) -> bool;

    /// Sends a direct message to `dest_id`. Returns `false` on
    /// transient failure; callers never treat this as fatal.
    async fn send_dm(&self, dest_id: &str, text: &str) -> bool;

    /// Closes the transport. Idempotent.
    async fn close(&self);

    /// Background reconnect loop for transports that can drop and
    /// need to be re-established. The default is a no-op, matching
    /// `original_source/mesh/base.py`'s base-class behavior for
    /// transports that don't need one (e.g. the simulator, which is
    /// always connected).
    async fn reconnect_loop(&self) {}

    fn connected(&self) -> bool;

    fn protocol_name(&self) -> &'static str;
}

/// Builds the configured mesh adapter, or the simulator when
/// `simulator` is set (which always overrides the configured
/// protocol, matching `original_source/mesh/__init__.py::create_interface`).
///
/// Only the simulator ships today; naming an unshipped radio protocol
/// is a configuration error rather than a panic, keeping the registry
/// open for future transports without the core daemon depending on
/// radio hardware libraries (`spec.md` §1).
pub fn create_adapter(
    protocol: &str,
    simulator: bool,
    max_response_bytes: usize,
    rate_limit_seconds: u64,
    inbound: mpsc::UnboundedSender<(String, String)>,
) -> Result<Box<dyn MeshAdapter>, OracleError> {
    if simulator {
        return Ok(Box::new(SimulatorAdapter::new(
            max_response_bytes,
            rate_limit_seconds,
            inbound,
        )));
    }
    Err(OracleError::Config(format!(
        "unknown mesh protocol {protocol:?}; only the simulator ships in this build"
    )))
}
