//! Capabilities plugged into the packet layer once the key exchange is done.
//!
//! Algorithms are provided by the caller. One instance handles a single direction of the
//! connection, since both ciphers and compressors keep state across packets.

use std::io;

pub trait Cipher: Send {
    /// Encrypts `data` in place. The length is always a multiple of 8.
    fn encrypt(&mut self, data: &mut [u8]);

    /// Decrypts `data` in place. The length is always a multiple of 8.
    fn decrypt(&mut self, data: &mut [u8]);
}

pub trait Compressor: Send {
    fn compress(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;

    fn uncompress(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Optional transport features for one direction.
#[derive(Default)]
pub struct TransportCapabilities {
    pub cipher: Option<Box<dyn Cipher>>,
    pub compressor: Option<Box<dyn Compressor>>,
}

impl TransportCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Some(Box::new(cipher));
        self
    }

    #[must_use]
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Box::new(compressor));
        self
    }
}

impl core::fmt::Debug for TransportCapabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransportCapabilities")
            .field("cipher", &self.cipher.is_some())
            .field("compressor", &self.compressor.is_some())
            .finish()
    }
}
