#![forbid(unsafe_code)]
//! End-to-end fixtures: create, mount and re-mount containers on
//! in-memory or file-backed devices.

use anyhow::{Context, Result};
use std::sync::Arc;
use veil::{create_container, open_container, ByteDevice, Keyfile, MemByteDevice, MountedVolume};

/// PIM used by fixtures: keeps PBKDF2 at 16k iterations instead of 500k so
/// suites stay fast. Scenario tests that pin the default schedule pass 0
/// explicitly.
pub const FIXTURE_PIM: i32 = 1;

/// A container fixture holding the backing device so tests can re-mount.
pub struct ContainerFixture {
    pub device: Arc<MemByteDevice>,
    pub password: Vec<u8>,
    pub pim: i32,
}

impl ContainerFixture {
    /// Create and format an in-memory container.
    pub fn new(size: u64, password: &[u8]) -> Result<Self> {
        let device = Arc::new(MemByteDevice::new(size));
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            password,
            FIXTURE_PIM,
            &[],
            "veil",
        )
        .context("creating container")?;
        Ok(Self {
            device,
            password: password.to_vec(),
            pim: FIXTURE_PIM,
        })
    }

    /// Mount the container with the fixture credentials.
    pub fn mount(&self) -> Result<MountedVolume> {
        open_container(
            Arc::clone(&self.device) as Arc<dyn ByteDevice>,
            &self.password,
            self.pim,
            &[],
        )
        .context("mounting container")
    }

    /// Mount with explicit credentials (wrong-password tests, keyfiles).
    pub fn mount_with(
        &self,
        password: &[u8],
        pim: i32,
        keyfiles: &[Keyfile],
    ) -> veil::Result<MountedVolume> {
        open_container(
            Arc::clone(&self.device) as Arc<dyn ByteDevice>,
            password,
            pim,
            keyfiles,
        )
    }
}
