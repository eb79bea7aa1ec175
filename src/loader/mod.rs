//! Firmware loader - stages payloads into managed memory
//!
//! Loading and execution are separate steps:
//!
//! ```text
//! byte stream ──stage──→ StagedPayload ──verify(sha256)──→ VerifiedPayload ──launch──→ Launcher
//!                 │                         │
//!                 └─ failure: handle released, nothing executed
//! ```
//!
//! Staging reads the source in bounded chunks and yields to the scheduler
//! after every chunk so the watchdog heartbeat keeps firing.

pub mod launcher;

pub use launcher::{HostLauncher, LaunchRequest, Launcher};

use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::memory::{Address, Handle, MemoryManager, Region};
use crate::metrics;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Stages payloads through the memory manager
pub struct FirmwareLoader {
    manager: MemoryManager,
    config: LoaderConfig,
}

impl FirmwareLoader {
    pub fn new(manager: MemoryManager, config: LoaderConfig) -> Self {
        Self { manager, config }
    }

    /// Copy exactly `len` bytes from `source` into a fresh managed buffer
    pub async fn stage<R>(&self, source: &mut R, len: usize) -> Result<StagedPayload>
    where
        R: AsyncRead + Unpin,
    {
        if len == 0 {
            return Err(Error::InvalidArgument("payload is empty".to_string()));
        }
        if let Err(e) = self.manager.ensure_available(len) {
            metrics::record_payload_load("insufficient_memory");
            warn!(len, error = %e, "Not enough memory to stage payload");
            return Err(e);
        }

        let handle = self.manager.allocate_handle(len)?;
        let address = handle.address()?;
        info!(len, region = %handle.region(), %address, "Staging payload");

        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; self.config.chunk_size.min(len)];
        let mut filled = 0;

        while filled < len {
            let want = (len - filled).min(chunk.len());
            let read = source.read(&mut chunk[..want]).await?;
            if read == 0 {
                metrics::record_payload_load("truncated");
                warn!(filled, len, "Payload stream ended early, releasing buffer");
                return Err(Error::Loader(format!(
                    "payload truncated: received {} of {} bytes",
                    filled, len
                )));
            }

            handle.write(filled, &chunk[..read])?;
            hasher.update(&chunk[..read]);
            filled += read;
            debug!(filled, len, percent = filled * 100 / len, "Payload progress");

            tokio::task::yield_now().await;
        }

        metrics::record_payload_bytes(len);
        metrics::record_payload_load("staged");

        let digest = hex::encode(hasher.finalize());
        info!(len, digest = %digest, "Payload staged");
        Ok(StagedPayload { handle, digest })
    }

    /// Stage a payload file; its length comes from the file metadata
    pub async fn stage_file(&self, path: &Path) -> Result<StagedPayload> {
        let mut file = tokio::fs::File::open(path).await?;
        let len = payload_len(file.metadata().await?.len())?;
        debug!(path = %path.display(), len, "Opened payload file");
        self.stage(&mut file, len).await
    }

    /// Turn a staged payload into a launchable one.
    ///
    /// With an expected digest the bytes must match it. Without one the
    /// payload is only accepted when `require_digest` is off.
    pub fn authorize(
        &self,
        staged: StagedPayload,
        expected_sha256: Option<&str>,
    ) -> Result<VerifiedPayload> {
        match expected_sha256 {
            Some(expected) => staged.verify(expected),
            None if self.config.require_digest => {
                metrics::record_payload_load("verification_failed");
                Err(Error::Loader(
                    "a sha256 digest is required before launch".to_string(),
                ))
            }
            None => {
                warn!(digest = %staged.digest, "Launching payload without digest check");
                Ok(VerifiedPayload {
                    handle: staged.handle,
                    digest: staged.digest,
                })
            }
        }
    }
}

fn payload_len(file_len: u64) -> Result<usize> {
    usize::try_from(file_len).map_err(|_| {
        Error::Loader(format!(
            "payload of {} bytes does not fit in the address space",
            file_len
        ))
    })
}

/// Payload bytes in managed memory, not yet allowed to run
#[derive(Debug)]
pub struct StagedPayload {
    handle: Handle,
    digest: String,
}

impl StagedPayload {
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn address(&self) -> Result<Address> {
        self.handle.address()
    }

    pub fn region(&self) -> Region {
        self.handle.region()
    }

    /// Hex SHA-256 of the staged bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Check the bytes against an expected hex SHA-256. On mismatch the
    /// buffer is released.
    pub fn verify(self, expected_sha256: &str) -> Result<VerifiedPayload> {
        let expected = expected_sha256.trim().to_ascii_lowercase();
        if expected != self.digest {
            metrics::record_payload_load("verification_failed");
            warn!(expected = %expected, actual = %self.digest, "Payload digest mismatch");
            return Err(Error::VerificationFailed {
                expected,
                actual: self.digest,
            });
        }

        debug!(digest = %self.digest, "Payload digest verified");
        Ok(VerifiedPayload {
            handle: self.handle,
            digest: self.digest,
        })
    }

    /// Abandon the payload
    pub fn release(self) {}
}

/// A payload cleared for execution
#[derive(Debug)]
pub struct VerifiedPayload {
    handle: Handle,
    digest: String,
}

impl VerifiedPayload {
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Transfer control to the payload. The buffer is leaked and pinned for
    /// the rest of uptime; nothing reclaims or moves it even if the launcher
    /// returns.
    pub fn launch<L: Launcher + ?Sized>(self, launcher: &mut L) -> Result<()> {
        let len = self.handle.len();
        let entry = self.handle.leak()?;
        let request = LaunchRequest {
            entry,
            len,
            digest: self.digest,
        };

        metrics::record_payload_load("launched");
        info!(entry = %entry, len, "Launching payload");
        launcher.launch(&request)?;

        warn!(entry = %entry, "Payload returned control");
        Ok(())
    }
}
