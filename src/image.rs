use std::path::Path;

use crate::Error;

/// Firmware payload and the flash address its first byte is written to
#[derive(Clone, PartialEq, Debug)]
pub struct Image {
    base_address: u32,
    bytes: Vec<u8>,
}

impl Image {
    pub fn new(base_address: u32, bytes: Vec<u8>) -> Self {
        Self {
            base_address,
            bytes,
        }
    }

    /// Load a raw binary to be written at `base_address`
    pub fn load_bin<P: AsRef<Path>>(path: P, base_address: u32) -> Result<Self, Error> {
        let bytes = std::fs::read(path.as_ref())?;

        debug!(
            "Loaded {} bytes from {}",
            bytes.len(),
            path.as_ref().display()
        );

        Ok(Self::new(base_address, bytes))
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
