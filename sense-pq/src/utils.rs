//! Utility functions for sense-pq

use byteorder::{BigEndian, ByteOrder};
use ndarray::{Array1, ArrayView1};

use crate::error::{Error, Result};

/// Squared Euclidean distance between two vectors of equal length.
#[inline]
pub fn squared_l2(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Encode a vector as big-endian float4 bytes (the `bytea` storage layout).
pub fn encode_bytea(vector: &ArrayView1<f32>) -> Vec<u8> {
    let mut bytes = vec![0u8; vector.len() * 4];
    for (chunk, &value) in bytes.chunks_exact_mut(4).zip(vector.iter()) {
        BigEndian::write_f32(chunk, value);
    }
    bytes
}

/// Decode big-endian float4 bytes back into a vector.
pub fn decode_bytea(bytes: &[u8]) -> Result<Array1<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Store(format!(
            "bytea payload of {} bytes is not a whole number of float4 values",
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(4).map(BigEndian::read_f32).collect())
}
