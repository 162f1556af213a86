//! Padding Normalizer
//!
//! Rounds every outbound frame up to one of a few bucket sizes so the
//! size of a datagram on the wire says nothing about what it carries.
//!
//! ## Padded Layout
//!
//! ```text
//! +---------+-----------------+--------------------+
//! | Length  | Payload         | Random fill        |
//! | u16 LE  | `length` bytes  | up to bucket size  |
//! +---------+-----------------+--------------------+
//! ```
//!
//! A bucket is the full wire size, so the padded region is the bucket
//! minus the secure channel's sealing overhead.

use rand::{Rng, RngCore};

use crate::constants::{LENGTH_PREFIX_LEN, MAX_DATAGRAM_SIZE};
use crate::errors::{ProtocolError, ProtocolResult};

/// A payload padded out to a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedFrame {
    /// Length prefix, payload and fill
    pub bytes: Vec<u8>,
    /// Payload length before padding
    pub true_len: usize,
    /// Bucket (wire size) this frame was padded for
    pub bucket: usize,
}

/// Bucket-based size normalizer
#[derive(Debug, Clone)]
pub struct PaddingNormalizer {
    buckets: Vec<usize>,
    overhead: usize,
}

impl PaddingNormalizer {
    /// Create a normalizer.
    ///
    /// `buckets` must be strictly increasing; `overhead` is what the secure
    /// channel adds when sealing.
    pub fn new(buckets: &[usize], overhead: usize) -> ProtocolResult<Self> {
        if buckets.is_empty() {
            return Err(ProtocolError::InvalidBuckets("bucket list is empty".into()));
        }
        if !buckets.windows(2).all(|w| w[0] < w[1]) {
            return Err(ProtocolError::InvalidBuckets(
                "buckets must be strictly increasing".into(),
            ));
        }
        let smallest = buckets[0];
        if smallest <= overhead + LENGTH_PREFIX_LEN {
            return Err(ProtocolError::InvalidBuckets(format!(
                "bucket {} leaves no room after {} bytes of overhead",
                smallest,
                overhead + LENGTH_PREFIX_LEN
            )));
        }
        let largest = buckets[buckets.len() - 1];
        if largest > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::InvalidBuckets(format!(
                "bucket {} exceeds the largest datagram ({})",
                largest, MAX_DATAGRAM_SIZE
            )));
        }

        Ok(Self {
            buckets: buckets.to_vec(),
            overhead,
        })
    }

    /// Get configured buckets
    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Get the sealing overhead accounted for
    pub fn overhead(&self) -> usize {
        self.overhead
    }

    /// Payload bytes a bucket can carry
    pub fn capacity(&self, bucket: usize) -> usize {
        bucket.saturating_sub(self.overhead + LENGTH_PREFIX_LEN)
    }

    /// Largest payload any bucket can carry
    pub fn max_payload(&self) -> usize {
        self.capacity(self.buckets[self.buckets.len() - 1])
    }

    /// Smallest bucket that fits `len` payload bytes
    pub fn bucket_for(&self, len: usize) -> ProtocolResult<usize> {
        self.buckets
            .iter()
            .copied()
            .find(|&b| self.capacity(b) >= len)
            .ok_or(ProtocolError::Oversize {
                len,
                max: self.max_payload(),
            })
    }

    /// With probability `probability`, move `bucket` up to a random larger
    /// bucket. Frames already in the largest bucket stay put.
    pub fn promote<R: Rng + ?Sized>(&self, bucket: usize, probability: f64, rng: &mut R) -> usize {
        if probability <= 0.0 || !rng.gen_bool(probability.min(1.0)) {
            return bucket;
        }
        let larger: Vec<usize> = self.buckets.iter().copied().filter(|&b| b > bucket).collect();
        if larger.is_empty() {
            return bucket;
        }
        larger[rng.gen_range(0..larger.len())]
    }

    /// Pad `payload` into the smallest bucket that fits it
    pub fn normalize(&self, payload: &[u8]) -> ProtocolResult<PaddedFrame> {
        let bucket = self.bucket_for(payload.len())?;
        self.normalize_into(payload, bucket)
    }

    /// Pad `payload` into a specific bucket
    pub fn normalize_into(&self, payload: &[u8], bucket: usize) -> ProtocolResult<PaddedFrame> {
        if !self.buckets.contains(&bucket) {
            return Err(ProtocolError::UnknownBucket(bucket));
        }
        if payload.len() > self.capacity(bucket) {
            return Err(ProtocolError::Oversize {
                len: payload.len(),
                max: self.capacity(bucket),
            });
        }

        let padded_len = bucket - self.overhead;
        let mut bytes = Vec::with_capacity(padded_len);
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(payload);

        let fill_start = bytes.len();
        bytes.resize(padded_len, 0);
        rand::thread_rng().fill_bytes(&mut bytes[fill_start..]);

        Ok(PaddedFrame {
            bytes,
            true_len: payload.len(),
            bucket,
        })
    }

    /// Strip padding; exact inverse of [`PaddingNormalizer::normalize`]
    pub fn denormalize(&self, padded: &[u8]) -> ProtocolResult<Vec<u8>> {
        if padded.len() < LENGTH_PREFIX_LEN {
            return Err(ProtocolError::PacketTooSmall {
                got: padded.len(),
                min: LENGTH_PREFIX_LEN,
            });
        }
        if !self.buckets.contains(&(padded.len() + self.overhead)) {
            return Err(ProtocolError::InvalidFrame(format!(
                "padded length {} matches no bucket",
                padded.len()
            )));
        }

        let len = u16::from_le_bytes([padded[0], padded[1]]) as usize;
        let end = LENGTH_PREFIX_LEN + len;
        if end > padded.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "length prefix {} overruns padded frame of {}",
                len,
                padded.len()
            )));
        }
        Ok(padded[LENGTH_PREFIX_LEN..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERHEAD: usize = 28;

    fn normalizer() -> PaddingNormalizer {
        PaddingNormalizer::new(&[256, 512, 1024], OVERHEAD).unwrap()
    }

    #[test]
    fn test_roundtrip_across_range() {
        let n = normalizer();
        for len in [0usize, 1, 17, 225, 226, 227, 481, 482, 994] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let padded = n.normalize(&payload).unwrap();
            assert_eq!(n.denormalize(&padded.bytes).unwrap(), payload, "len {}", len);
        }
    }

    #[test]
    fn test_wire_sizes_match_buckets() {
        let n = normalizer();
        let sizes: Vec<usize> = [10usize, 300, 900]
            .iter()
            .map(|&len| n.normalize(&vec![0xAB; len]).unwrap().bytes.len() + OVERHEAD)
            .collect();
        assert_eq!(sizes, vec![256, 512, 1024]);
    }

    #[test]
    fn test_same_bucket_same_size() {
        let n = normalizer();
        let a = n.normalize(&[1u8; 40]).unwrap();
        let b = n.normalize(&[2u8; 200]).unwrap();
        assert_eq!(a.bucket, b.bucket);
        assert_eq!(a.bytes.len(), b.bytes.len());
    }

    #[test]
    fn test_bucket_boundary() {
        let n = normalizer();
        // 256 - 28 - 2 = 226 bytes fit exactly
        assert_eq!(n.bucket_for(226).unwrap(), 256);
        assert_eq!(n.bucket_for(227).unwrap(), 512);
    }

    #[test]
    fn test_oversize() {
        let n = normalizer();
        let result = n.normalize(&vec![0u8; 995]);
        assert!(matches!(
            result,
            Err(ProtocolError::Oversize { len: 995, max: 994 })
        ));
    }

    #[test]
    fn test_fill_is_not_constant() {
        let n = normalizer();
        let padded = n.normalize(&[]).unwrap();
        let fill = &padded.bytes[LENGTH_PREFIX_LEN..];
        assert!(fill.iter().any(|&b| b != fill[0]));
    }

    #[test]
    fn test_normalize_into_smaller_bucket_rejected() {
        let n = normalizer();
        assert!(matches!(
            n.normalize_into(&[0u8; 300], 256),
            Err(ProtocolError::Oversize { .. })
        ));
        assert!(matches!(
            n.normalize_into(&[0u8; 3], 300),
            Err(ProtocolError::UnknownBucket(300))
        ));
    }

    #[test]
    fn test_denormalize_rejects_bad_frames() {
        let n = normalizer();
        assert!(n.denormalize(&[0u8; 100]).is_err());

        let mut padded = n.normalize(&[5u8; 10]).unwrap().bytes;
        padded[0] = 0xFF;
        padded[1] = 0xFF;
        assert!(n.denormalize(&padded).is_err());
    }

    #[test]
    fn test_invalid_bucket_sets() {
        assert!(PaddingNormalizer::new(&[], OVERHEAD).is_err());
        assert!(PaddingNormalizer::new(&[512, 256], OVERHEAD).is_err());
        assert!(PaddingNormalizer::new(&[30], OVERHEAD).is_err());
        assert!(PaddingNormalizer::new(&[70_000], OVERHEAD).is_err());
    }

    #[test]
    fn test_promote() {
        let n = normalizer();
        let mut rng = rand::thread_rng();
        assert_eq!(n.promote(256, 0.0, &mut rng), 256);
        assert_eq!(n.promote(1024, 1.0, &mut rng), 1024);
        for _ in 0..50 {
            let promoted = n.promote(256, 1.0, &mut rng);
            assert!(promoted == 512 || promoted == 1024);
        }
    }
}
