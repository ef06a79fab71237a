use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// Body of `GET <tenant>/v1/bloomfilter`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BloomFilterPayload {
    /// Base64 encoded bit array
    pub b: String,
    /// Number of bits
    pub m: u64,
    /// Number of hash functions
    pub h: u32,
}

impl BloomFilterPayload {
    pub fn from_bytes(bytes: &[u8], bits: u64, hashes: u32) -> Self {
        Self {
            b: STANDARD.encode(bytes),
            m: bits,
            h: hashes,
        }
    }

    pub fn decode_bits(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.b.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_body() {
        let payload: BloomFilterPayload =
            serde_json::from_str(r#"{"b":"AAE=","m":16,"h":3}"#).unwrap();
        assert_eq!(payload.m, 16);
        assert_eq!(payload.h, 3);
        assert_eq!(payload.decode_bits().unwrap(), vec![0x00, 0x01]);
    }

    #[test]
    fn from_bytes_encodes_standard_base64() {
        let payload = BloomFilterPayload::from_bytes(&[0xfb, 0xff], 16, 1);
        assert_eq!(payload.b, "+/8=");
    }
}
