use super::{BackupError, CompressionAlgorithm, CompressionConfig, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress a serialized bundle before encryption. `None` passes bytes through.
pub fn compress(config: Option<&CompressionConfig>, data: &[u8]) -> Result<Vec<u8>> {
    let Some(config) = config else {
        return Ok(data.to_vec());
    };
    match config.algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(data, config.level).map_err(compression_error)
        }
        CompressionAlgorithm::Gzip => {
            // gzip levels stop at 9
            let level = config.level.clamp(0, 9) as u32;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(data).map_err(compression_error)?;
            encoder.finish().map_err(compression_error)
        }
    }
}

/// Inverse of [`compress`] for the same config.
pub fn decompress(config: Option<&CompressionConfig>, data: &[u8]) -> Result<Vec<u8>> {
    let Some(config) = config else {
        return Ok(data.to_vec());
    };
    match config.algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| BackupError::corrupt(format!("zstd decode failed: {e}"))),
        CompressionAlgorithm::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| BackupError::corrupt(format!("gzip decode failed: {e}")))?;
            Ok(out)
        }
    }
}

fn compression_error(e: std::io::Error) -> BackupError {
    BackupError::Component {
        component: "compression".to_string(),
        message: e.to_string(),
    }
}
