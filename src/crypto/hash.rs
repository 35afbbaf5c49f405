/// BLAKE2b-256 hashing for page validation and WAL record integrity.
use blake2b_simd::Params;

pub const HASH_SIZE: usize = 32;

pub fn hash_bytes(data: &[u8]) -> [u8; HASH_SIZE] {
    let hash = Params::new().hash_length(HASH_SIZE).hash(data);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(hash.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(hash_bytes(b"gavran"), hash_bytes(b"gavran"));
        assert_ne!(hash_bytes(b"gavran"), hash_bytes(b"gavrao"));
    }

    #[test]
    fn test_output_length() {
        assert_eq!(hash_bytes(&[]).len(), HASH_SIZE);
    }
}
