use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Serializes `value` with bincode and fingerprints the payload.
pub fn fingerprint_serializable<T: Serialize>(value: &T) -> Result<(Vec<u8>, u64), bincode::Error> {
    let payload = bincode::serialize(value)?;
    let fingerprint = fnv1a_hash(&payload);
    Ok((payload, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn chained_bytes_equal_single_pass() {
        let split = fnv1a_bytes(fnv1a_bytes(fnv1a_init(), b"grad"), b"ient");
        assert_eq!(split, fnv1a_hash(b"gradient"));
    }
}
