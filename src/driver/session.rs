//! SCPI session over a [`Transport`] with an explicit fault policy
//!
//! Every driver query and write goes through [`ScpiSession`]. The session
//! turns transport errors into [`DaqError::TransportFailure`] and then
//! applies the configured [`FaultPolicy`]:
//!
//! - `Log`: the fault is logged; a query yields an empty reply and a write
//!   is a no-op. This keeps the polling loop alive across transient I/O
//!   faults.
//! - `Propagate`: the error is returned to the caller.

use crate::error::{AppResult, DaqError};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{trace, warn};

/// What the session does with a failed transport call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Log the fault and substitute an empty reply / skip the write
    #[default]
    Log,
    /// Return `TransportFailure` to the caller
    Propagate,
}

/// Serialized access to one instrument link
pub struct ScpiSession {
    transport: Mutex<Box<dyn Transport>>,
    policy: FaultPolicy,
}

impl ScpiSession {
    /// Wrap a transport with the given fault policy
    pub fn new(transport: Box<dyn Transport>, policy: FaultPolicy) -> Self {
        Self {
            transport: Mutex::new(transport),
            policy,
        }
    }

    /// Resource identifier of the underlying transport
    pub async fn resource(&self) -> String {
        self.transport.lock().await.resource().to_string()
    }

    /// Query with the session's fault policy applied
    pub async fn query(&self, command: &str) -> AppResult<String> {
        match self.query_checked(command).await {
            Ok(reply) => Ok(reply),
            Err(e) => match self.policy {
                FaultPolicy::Log => {
                    warn!(command, error = %e, "query failed, using empty reply");
                    Ok(String::new())
                }
                FaultPolicy::Propagate => Err(e),
            },
        }
    }

    /// Write with the session's fault policy applied
    pub async fn write(&self, command: &str) -> AppResult<()> {
        match self.write_checked(command).await {
            Ok(()) => Ok(()),
            Err(e) => match self.policy {
                FaultPolicy::Log => {
                    warn!(command, error = %e, "write failed, ignoring");
                    Ok(())
                }
                FaultPolicy::Propagate => Err(e),
            },
        }
    }

    /// Query that always propagates transport faults
    pub async fn query_checked(&self, command: &str) -> AppResult<String> {
        let reply = self
            .transport
            .lock()
            .await
            .query(command)
            .await
            .map_err(|e| transport_failure(command, e))?;
        trace!(command, reply = %reply, "query");
        Ok(reply.trim().to_string())
    }

    /// Write that always propagates transport faults
    pub async fn write_checked(&self, command: &str) -> AppResult<()> {
        self.transport
            .lock()
            .await
            .write(command)
            .await
            .map_err(|e| transport_failure(command, e))?;
        trace!(command, "write");
        Ok(())
    }
}

fn transport_failure(command: &str, err: anyhow::Error) -> DaqError {
    DaqError::TransportFailure {
        command: command.to_string(),
        reason: format!("{:#}", err),
    }
}
