//! `CredentialCodec` — derives a per-token credential from a shared secret.
//!
//! Neither side ever transmits `secret`. `credential(secret, instanceName, token)`
//! stretches `secret` with PBKDF2-HMAC-SHA256 (salted with `instanceName`) into
//! a 48-byte key+IV, AES-256-CBC-encrypts `token`, and encodes the ciphertext
//! with a fixed base62 alphabet. Both sides recompute and compare in constant
//! time; nothing here is reversed in normal operation.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PBKDF2_ROUNDS: u32 = 10_000;
const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Derive the 32-byte AES key and 16-byte IV from `secret` salted with `instance_name`.
fn derive_key_iv(secret: &[u8], instance_name: &str) -> ([u8; 32], [u8; 16]) {
    let mut material = [0u8; 48];
    pbkdf2_hmac::<Sha256>(secret, instance_name.as_bytes(), PBKDF2_ROUNDS, &mut material);
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..]);
    (key, iv)
}

/// Compute `credential(secret, instanceName, token)`.
pub fn credential(secret: &[u8], instance_name: &str, token: &str) -> String {
    let (key, iv) = derive_key_iv(secret, instance_name);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(token.as_bytes());
    base62_encode(&ciphertext)
}

/// Validate `presented` against the credential the Controller would have
/// computed itself, in constant time. Returns `false` on any malformed input
/// rather than propagating a decode error — a forged credential should look
/// exactly as rejected as a garbled one.
pub fn validate(secret: &[u8], instance_name: &str, token: &str, presented: &str) -> bool {
    let expected = credential(secret, instance_name, token);
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

/// Recover the token a credential was computed for, if `secret`/`instance_name`
/// are correct and `presented` decodes and unpads cleanly. Not used by the
/// Controller's validation path (which only ever recomputes and compares),
/// but kept as the inverse operation for tests and potential diagnostics.
#[allow(dead_code)]
fn decrypt(secret: &[u8], instance_name: &str, presented: &str) -> Option<String> {
    let (key, iv) = derive_key_iv(secret, instance_name);
    let ciphertext = base62_decode(presented)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .ok()?;
    String::from_utf8(plaintext).ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Encode arbitrary bytes as base62 (big-endian big-integer encoding, no
/// leading-zero compaction surprises: each leading zero byte becomes a
/// leading '0' digit).
fn base62_encode(bytes: &[u8]) -> String {
    let leading_zeros = bytes.iter().take_while(|&&b| b == 0).count();
    let mut digits: Vec<u8> = Vec::new();
    let mut num = bytes.to_vec();

    while num.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for byte in num.iter_mut() {
            let acc = (remainder << 8) | *byte as u32;
            *byte = (acc / 62) as u8;
            remainder = acc % 62;
        }
        digits.push(BASE62_ALPHABET[remainder as usize]);
    }

    let mut out: Vec<u8> = std::iter::repeat(BASE62_ALPHABET[0])
        .take(leading_zeros)
        .collect();
    out.extend(digits.iter().rev());
    if out.is_empty() {
        out.push(BASE62_ALPHABET[0]);
    }
    String::from_utf8(out).expect("base62 alphabet is ASCII")
}

fn base62_decode(s: &str) -> Option<Vec<u8>> {
    fn digit_value(c: u8) -> Option<u32> {
        BASE62_ALPHABET.iter().position(|&a| a == c).map(|p| p as u32)
    }

    let leading_zeros = s.bytes().take_while(|&b| b == BASE62_ALPHABET[0]).count();
    let mut num: Vec<u8> = vec![0];

    for c in s.bytes() {
        let value = digit_value(c)?;
        let mut carry = value;
        for byte in num.iter_mut().rev() {
            let acc = *byte as u32 * 62 + carry;
            *byte = (acc & 0xFF) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, (carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    // Strip the accumulator's own leading zero padding, then restore the
    // original input's leading-zero-byte count.
    while num.len() > 1 && num[0] == 0 {
        num.remove(0);
    }
    if num == [0] {
        num.clear();
    }
    let mut out = vec![0u8; leading_zeros];
    out.extend(num);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_is_deterministic() {
        let a = credential(b"sharedsecret1234", "agent-one", "token-abc");
        let b = credential(b"sharedsecret1234", "agent-one", "token-abc");
        assert_eq!(a, b);
    }

    #[test]
    fn validate_accepts_matching_recomputation() {
        let cred = credential(b"sharedsecret1234", "agent-one", "tok");
        assert!(validate(b"sharedsecret1234", "agent-one", "tok", &cred));
    }

    #[test]
    fn validate_rejects_wrong_secret() {
        let cred = credential(b"sharedsecret1234", "agent-one", "tok");
        assert!(!validate(b"wrongsecret12345", "agent-one", "tok", &cred));
    }

    #[test]
    fn validate_rejects_single_bit_mutation() {
        let cred = credential(b"sharedsecret1234", "agent-one", "tok");
        let mut bytes = cred.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        let mutated = String::from_utf8(bytes).unwrap();
        assert!(!validate(b"sharedsecret1234", "agent-one", "tok", &mutated));
    }

    #[test]
    fn validate_rejects_wrong_instance_name() {
        let cred = credential(b"sharedsecret1234", "agent-one", "tok");
        assert!(!validate(b"sharedsecret1234", "agent-two", "tok", &cred));
    }

    #[test]
    fn base62_round_trip() {
        for input in [&b""[..], b"\x00", b"\x00\x01", b"hello world", &[0xFF; 32]] {
            let encoded = base62_encode(input);
            let decoded = base62_decode(&encoded).unwrap();
            assert_eq!(decoded, input, "round trip failed for {:?}", input);
        }
    }

    #[test]
    fn decrypt_recovers_original_token() {
        let cred = credential(b"sharedsecret1234", "agent-one", "the-token");
        let recovered = decrypt(b"sharedsecret1234", "agent-one", &cred).unwrap();
        assert_eq!(recovered, "the-token");
    }
}
