//! Binary envelope stored in the blob store.
//!
//! ```text
//! [nonce_len: u8][nonce: nonce_len bytes][iv_len: u8][iv: iv_len bytes][ciphertext: rest]
//! ```
//!
//! Both length prefixes are single bytes, so the nonce and IV are limited to
//! 255 bytes each. The ciphertext carries its own AEAD tag; the codec itself
//! does not interpret it.

use crate::error::{VaultError, VaultResult};

/// Upper bound of the nonce and IV fields.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Size of the two length prefixes.
pub const HEADER_LEN: usize = 2;

/// Decoded envelope fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session nonce the payload key was derived from.
    pub session_nonce: Vec<u8>,
    /// AEAD nonce.
    pub iv: Vec<u8>,
    /// Authenticated ciphertext.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Packs the envelope into its wire form.
    ///
    /// # Errors
    ///
    /// See [`encode`].
    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        encode(&self.session_nonce, &self.iv, &self.ciphertext)
    }
}

/// Packs `session_nonce`, `iv` and `ciphertext` into one buffer.
///
/// # Errors
///
/// Returns [`VaultError::InvalidInput`] if the nonce or IV is longer than
/// [`MAX_FIELD_LEN`].
pub fn encode(session_nonce: &[u8], iv: &[u8], ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
    let nonce_len = field_len(session_nonce, "session_nonce")?;
    let iv_len = field_len(iv, "iv")?;

    let mut out =
        Vec::with_capacity(HEADER_LEN + session_nonce.len() + iv.len() + ciphertext.len());
    out.push(nonce_len);
    out.extend_from_slice(session_nonce);
    out.push(iv_len);
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Unpacks an envelope.
///
/// Either every field is returned or none is: a buffer whose declared lengths
/// run past its end is rejected before anything is copied.
///
/// # Errors
///
/// Returns [`VaultError::MalformedEnvelope`] if the buffer is shorter than the
/// header plus the declared field lengths.
pub fn decode(bytes: &[u8]) -> VaultResult<Envelope> {
    let (&nonce_len, rest) = bytes
        .split_first()
        .ok_or_else(|| VaultError::MalformedEnvelope("empty buffer".to_string()))?;
    let nonce_len = usize::from(nonce_len);
    if rest.len() < nonce_len + 1 {
        return Err(VaultError::MalformedEnvelope(format!(
            "declared nonce length {nonce_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    let (session_nonce, rest) = rest.split_at(nonce_len);

    let (&iv_len, rest) = rest
        .split_first()
        .ok_or_else(|| VaultError::MalformedEnvelope("missing iv length".to_string()))?;
    let iv_len = usize::from(iv_len);
    if rest.len() < iv_len {
        return Err(VaultError::MalformedEnvelope(format!(
            "declared iv length {iv_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    let (iv, ciphertext) = rest.split_at(iv_len);

    Ok(Envelope {
        session_nonce: session_nonce.to_vec(),
        iv: iv.to_vec(),
        ciphertext: ciphertext.to_vec(),
    })
}

fn field_len(field: &[u8], name: &str) -> VaultResult<u8> {
    u8::try_from(field.len()).map_err(|_| {
        VaultError::invalid_input(
            name,
            format!("{} bytes exceeds the {MAX_FIELD_LEN}-byte limit", field.len()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_layout_is_bit_exact() {
        let bytes = encode(&[0xAA, 0xBB], &[0x01, 0x02, 0x03], &[0xFF]).unwrap();
        assert_eq!(bytes, vec![2, 0xAA, 0xBB, 3, 0x01, 0x02, 0x03, 0xFF]);
    }

    #[test_case(0, 0, 0)]
    #[test_case(32, 24, 48)]
    #[test_case(255, 0, 1)]
    #[test_case(0, 255, 0)]
    #[test_case(255, 255, 1024)]
    fn test_round_trip_field_lengths(nonce_len: usize, iv_len: usize, ct_len: usize) {
        let nonce: Vec<u8> = (0..nonce_len).map(|i| u8::try_from(i % 251).unwrap()).collect();
        let iv = vec![0x5A; iv_len];
        let ciphertext = vec![0xC3; ct_len];
        let decoded = decode(&encode(&nonce, &iv, &ciphertext).unwrap()).unwrap();
        assert_eq!(decoded.session_nonce, nonce);
        assert_eq!(decoded.iv, iv);
        assert_eq!(decoded.ciphertext, ciphertext);
    }

    #[test]
    fn test_encode_rejects_oversized_fields() {
        let big = vec![0u8; 256];
        assert!(matches!(
            encode(&big, &[], &[]),
            Err(VaultError::InvalidInput { .. })
        ));
        assert!(matches!(
            encode(&[], &big, &[]),
            Err(VaultError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert!(matches!(decode(&[]), Err(VaultError::MalformedEnvelope(_))));
    }

    #[test_case(&[5, 1, 2] ; "nonce runs past end")]
    #[test_case(&[2, 1, 2] ; "missing iv length")]
    #[test_case(&[0, 4, 1, 2, 3] ; "iv runs past end")]
    #[test_case(&[255] ; "header only with large nonce")]
    fn test_decode_truncated(bytes: &[u8]) {
        assert!(matches!(decode(bytes), Err(VaultError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_every_truncation_of_valid_envelope_fails_or_shortens_ciphertext() {
        let bytes = encode(&[7; 10], &[9; 12], &[1, 2, 3]).unwrap();
        let header_end = HEADER_LEN + 10 + 12;
        for cut in 0..bytes.len() {
            let result = decode(&bytes[..cut]);
            if cut < header_end {
                assert!(matches!(result, Err(VaultError::MalformedEnvelope(_))));
            } else {
                assert_eq!(result.unwrap().ciphertext.len(), cut - header_end);
            }
        }
    }

    #[test]
    fn test_minimal_envelope() {
        let decoded = decode(&[0, 0]).unwrap();
        assert!(decoded.session_nonce.is_empty());
        assert!(decoded.iv.is_empty());
        assert!(decoded.ciphertext.is_empty());
    }
}
