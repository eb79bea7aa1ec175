//! Launcher trait - the collaborator that transfers control to a payload

use crate::error::Result;
use crate::memory::Address;
use serde::Serialize;
use tracing::info;

/// What a launcher receives for a verified payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRequest {
    /// First byte of the payload
    pub entry: Address,
    pub len: usize,
    /// Hex SHA-256 of the payload bytes
    pub digest: String,
}

/// Transfers control into a staged payload
///
/// On the device this jumps to `entry` and does not return. Returning
/// `Ok(())` means the payload handed control back.
pub trait Launcher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<()>;
}

/// Host stand-in: records the launch instead of executing it
#[derive(Debug, Default)]
pub struct HostLauncher {
    launched: Vec<LaunchRequest>,
}

impl HostLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches seen so far
    pub fn launched(&self) -> &[LaunchRequest] {
        &self.launched
    }
}

impl Launcher for HostLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<()> {
        info!(
            entry = %request.entry,
            len = request.len,
            digest = %request.digest,
            "Transferring control to payload (host: recorded only)"
        );
        self.launched.push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_launcher_records() {
        let mut launcher = HostLauncher::new();
        let request = LaunchRequest {
            entry: Address(0x4000_0000),
            len: 1024,
            digest: "ab".repeat(32),
        };

        launcher.launch(&request).unwrap();
        assert_eq!(launcher.launched(), &[request]);
    }
}
