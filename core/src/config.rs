use serde::{Deserialize, Serialize};

/// Size of one plaintext block of the compressed stream.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Tuning for the content pipeline.
///
/// Block size and compression level shape the ciphertext, so changing either
/// one makes previously stored objects unreachable for dedup (they are
/// re-uploaded once and the old ones pruned). The KDF parameters shape the
/// key itself and must stay fixed for the lifetime of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block_size: usize,
    pub compression_level: u32,
    #[serde(skip)]
    pub kdf: KdfParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression_level: 9,
            kdf: KdfParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size < 16 || self.block_size > 64 * 1024 * 1024 {
            return Err(crate::Error::InvalidInput(format!(
                "block size {} is outside 16 B ..= 64 MiB",
                self.block_size
            )));
        }
        if self.compression_level > 9 {
            return Err(crate::Error::InvalidInput(format!(
                "compression level {} is outside 0..=9",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Argon2id parameters. One lane keeps derivation on a single core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let tiny = EngineConfig {
            block_size: 4,
            ..Default::default()
        };
        assert!(tiny.validate().is_err());

        let level = EngineConfig {
            compression_level: 12,
            ..Default::default()
        };
        assert!(level.validate().is_err());
    }
}
