//! Angular similarity between embedding vectors and the BLOB encoding used to
//! persist them.

use std::f32::consts::PI;

/// Norms below this are treated as zero vectors.
pub const MIN_NORM: f32 = 1e-8;

/// Angular similarity in `[0, 1]`: `1 - acos(cos) / pi`.
///
/// Returns 0.0 when the vectors differ in length or either norm is below
/// [`MIN_NORM`].
pub fn angular_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a < MIN_NORM || norm_b < MIN_NORM {
        return 0.0;
    }

    let cosine = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    (1.0 - cosine.acos() / PI).clamp(0.0, 1.0)
}

/// Encode a vector as little-endian f32 bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a little-endian f32 BLOB. `None` when the length is not a multiple of 4.
pub fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors() {
        let a = vec![0.3, -1.2, 4.0];
        assert!((angular_similarity(&a, &a) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_opposite_and_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let c = vec![0.0, 1.0];
        assert!(angular_similarity(&a, &b).abs() < 1e-6);
        assert!((angular_similarity(&a, &c) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tiny_norm_is_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let tiny = vec![1e-10, 0.0, 0.0];
        let a = vec![1.0, 2.0, 3.0];
        assert_eq!(angular_similarity(&zero, &a), 0.0);
        assert_eq!(angular_similarity(&a, &tiny), 0.0);
    }

    #[test]
    fn test_symmetric_and_bounded() {
        let a = vec![0.1, 0.7, -0.4, 2.0];
        let b = vec![-0.9, 0.2, 0.5, 1.1];
        let ab = angular_similarity(&a, &b);
        let ba = angular_similarity(&b, &a);
        assert_eq!(ab, ba);
        assert!((0.0..=1.0).contains(&ab));
    }

    #[test]
    fn test_length_mismatch() {
        assert_eq!(angular_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![1.5, -0.25, 3.0];
        let blob = encode_vector(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(decode_vector(&blob), Some(v));
        assert_eq!(decode_vector(&[0u8; 5]), None);
    }
}
