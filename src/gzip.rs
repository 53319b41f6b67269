use crate::error::{Error, Result};
use libdeflater::{CompressionLvl, Compressor, Decompressor};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compresses `data` into a gzip member.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut compressor = Compressor::new(CompressionLvl::default());
    let mut compressed = vec![0u8; compressor.gzip_compress_bound(data.len())];
    let size = compressor
        .gzip_compress(data, &mut compressed)
        .map_err(|e| Error::Compression(format!("{:?}", e)))?;
    compressed.truncate(size);
    Ok(compressed)
}

/// Decompresses a single gzip member.
///
/// The output buffer is sized from the ISIZE trailer, the uncompressed length modulo 2^32 that
/// every gzip member ends with.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 18 {
        return Err(Error::Compression("gzip member is truncated".to_string()));
    }
    if data[..2] != GZIP_MAGIC {
        return Err(Error::Compression("missing gzip header".to_string()));
    }
    let mut trailer = [0u8; 4];
    trailer.copy_from_slice(&data[data.len() - 4..]);
    let expected = u32::from_le_bytes(trailer) as usize;

    let mut decompressor = Decompressor::new();
    let mut decompressed = vec![0u8; expected];
    let size = decompressor
        .gzip_decompress(data, &mut decompressed)
        .map_err(|e| Error::Compression(format!("{:?}", e)))?;
    decompressed.truncate(size);
    Ok(decompressed)
}
