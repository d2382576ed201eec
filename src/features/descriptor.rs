//! Binary descriptors and the normalized Hamming distance used by matching.

use super::FeatureError;

/// Descriptor length the distance scale is normalized to.
pub const REFERENCE_DESCRIPTOR_BYTES: usize = 32;

/// Distance between two binary descriptors.
///
/// The raw Hamming distance is rescaled to a 32-byte reference so that
/// thresholds stay comparable across channels with different descriptor
/// lengths: `round(popcount(a ^ b) * 32 / len)`. For 32-byte descriptors this
/// equals the plain Hamming distance.
#[inline]
pub fn descriptor_distance(a: &[u8], b: &[u8]) -> u32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0;
    }

    let raw: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();

    (raw as f32 * REFERENCE_DESCRIPTOR_BYTES as f32 / len as f32 + 0.5) as u32
}

/// Row-major table of fixed-width descriptors, one row per keypoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorSet {
    width: usize,
    data: Vec<u8>,
}

impl DescriptorSet {
    /// Wrap a contiguous buffer of `data.len() / width` descriptors.
    pub fn new(width: usize, data: Vec<u8>) -> Result<Self, FeatureError> {
        if width == 0 && !data.is_empty() {
            return Err(FeatureError::Descriptor(
                "zero descriptor width with non-empty data".to_string(),
            ));
        }
        if width > 0 && data.len() % width != 0 {
            return Err(FeatureError::Descriptor(format!(
                "buffer of {} bytes is not a multiple of width {}",
                data.len(),
                width
            )));
        }
        Ok(Self { width, data })
    }

    /// Build from individual rows, which must all have the same length.
    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self, FeatureError> {
        let width = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(width * rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(FeatureError::Descriptor(format!(
                    "row {} has {} bytes, expected {}",
                    i,
                    row.len(),
                    width
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(width, data)
    }

    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor length in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[u8] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.width.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        let a: Vec<u8> = (0..32).map(|i| (i * 37) as u8).collect();
        assert_eq!(descriptor_distance(&a, &a), 0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a: Vec<u8> = (0..32).map(|i| (i * 37) as u8).collect();
        let b: Vec<u8> = (0..32).map(|i| (i * 11 + 5) as u8).collect();
        assert_eq!(descriptor_distance(&a, &b), descriptor_distance(&b, &a));
    }

    #[test]
    fn test_distance_normalized_to_reference_length() {
        // 64-byte descriptors differing in 20 bits read as 10 on the 32-byte scale.
        let a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        b[0] = 0xFF;
        b[1] = 0xFF;
        b[2] = 0x0F;
        assert_eq!(descriptor_distance(&a, &b), 10);

        // 32-byte descriptors: plain Hamming distance.
        let c = vec![0u8; 32];
        let mut d = vec![0u8; 32];
        d[5] = 0b1011_0000;
        assert_eq!(descriptor_distance(&c, &d), 3);
    }

    #[test]
    fn test_descriptor_set_rows() {
        let set = DescriptorSet::from_rows(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.width(), 3);
        assert_eq!(set.row(1), &[4, 5, 6]);
        assert_eq!(set.rows().count(), 2);
    }

    #[test]
    fn test_descriptor_set_rejects_ragged_rows() {
        assert!(DescriptorSet::from_rows(&[vec![1, 2], vec![3]]).is_err());
        assert!(DescriptorSet::new(4, vec![0; 6]).is_err());
        assert!(DescriptorSet::new(0, Vec::new()).unwrap().is_empty());
    }
}
