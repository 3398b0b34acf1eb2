use sha1::{Digest, Sha1};

pub fn sha1_digest(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data.as_ref());
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// The first 16 bytes of the SHA-1 digest of `data`, read as two little-endian
/// 64-bit integers.
pub fn sha1_u64_pair(data: impl AsRef<[u8]>) -> (u64, u64) {
    let digest = sha1_digest(data);
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}
