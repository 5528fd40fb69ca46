use sha3::{Digest, Keccak256};

pub fn keccak256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Keccak256 as a `0x`-prefixed hex string.
pub fn keccak256_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(keccak256(data)))
}

/// Digest stored next to each chain proof so a payload can be checked later
/// without re-fetching the transaction.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    keccak256_hex(payload.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak256_hex_matches_empty_string_vector() {
        let digest = keccak256_hex(b"");
        assert_eq!(
            digest,
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(digest.len(), 66);
    }

    #[test]
    fn payload_digest_tracks_content() {
        let a = serde_json::json!({"id": "A1", "amount": 5});
        let b = serde_json::json!({"id": "A1", "amount": 6});
        assert_eq!(payload_digest(&a), payload_digest(&a.clone()));
        assert_ne!(payload_digest(&a), payload_digest(&b));
    }
}
