//! Password scrambles and the RSA password-encryption step.
//!
//! ```text
//! mysql_native_password:  SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))
//! caching_sha2_password:  SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)
//! RSA path:               RSA_OAEP_SHA1(key, (pw + NUL) XOR repeat(seed))
//! ```

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::Result;
use sqlwire_core::error::{AuthenticationError, AuthenticationErrorKind};

/// Length of the scramble the server sends.
pub const SEED_LENGTH: usize = 20;

/// Strip the NUL the server appends to the 20-byte scramble.
pub fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == SEED_LENGTH => head,
        _ => seed,
    }
}

/// `mysql_native_password` response. Empty password yields an empty response.
pub fn native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(SEED_LENGTH)];

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `caching_sha2_password` fast-path response. Empty password yields an empty response.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let hash = Sha256::digest(password.as_bytes());
    let hash_hash = Sha256::digest(hash);
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed);
    let scramble = hasher.finalize();

    hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// `(password + NUL) XOR seed`, repeating the seed cyclically.
///
/// This is the buffer handed to RSA; it carries no randomness of its own.
pub fn xor_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(password.len() + 1);
    buf.extend_from_slice(password.as_bytes());
    buf.push(0);
    if !seed.is_empty() {
        for (b, s) in buf.iter_mut().zip(seed.iter().cycle()) {
            *b ^= s;
        }
    }
    buf
}

/// Parse a PEM RSA public key (SubjectPublicKeyInfo or PKCS#1).
pub fn parse_public_key(pem: &[u8]) -> Result<RsaPublicKey> {
    let pem = std::str::from_utf8(pem).map_err(|e| {
        malformed_key(format!("public key is not valid UTF-8 PEM: {e}"))
    })?;
    let pem = pem.trim_matches(char::from(0)).trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| malformed_key(format!("failed to parse RSA public key: {e}")).into())
}

/// Encrypt the password for transmission over a plaintext channel.
pub fn encrypt_password(password: &str, seed: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>> {
    let buf = xor_with_seed(password, trim_seed(seed));
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &buf)
        .map_err(|e| {
            AuthenticationError::new(
                AuthenticationErrorKind::PluginFailure,
                format!("RSA encryption failed: {e}"),
            )
            .into()
        })
}

fn malformed_key(message: String) -> AuthenticationError {
    AuthenticationError::new(AuthenticationErrorKind::MalformedKey, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_password_shape() {
        let seed = [0x3Au8; 20];
        let a = native_password("secret", &seed);
        assert_eq!(a.len(), 20);
        assert_eq!(a, native_password("secret", &seed));
        assert_ne!(a, native_password("secret", &[0x3B; 20]));
        assert!(native_password("", &seed).is_empty());
    }

    #[test]
    fn test_native_password_ignores_trailing_nul() {
        let mut seed = vec![7u8; 20];
        let plain = native_password("pw", &seed);
        seed.push(0);
        assert_eq!(plain, native_password("pw", &seed));
    }

    #[test]
    fn test_caching_sha2_shape() {
        let seed = [1u8; 20];
        assert_eq!(caching_sha2_password("secret", &seed).len(), 32);
        assert!(caching_sha2_password("", &seed).is_empty());
    }

    #[test]
    fn test_xor_with_seed_repeats_seed() {
        let buf = xor_with_seed("abcde", &[0x01, 0x02]);
        assert_eq!(
            buf,
            vec![b'a' ^ 1, b'b' ^ 2, b'c' ^ 1, b'd' ^ 2, b'e' ^ 1, 2]
        );
        assert_eq!(buf, xor_with_seed("abcde", &[0x01, 0x02]));
    }

    #[test]
    fn test_xor_with_seed_is_self_inverse() {
        let seed = b"0123456789abcdefghij";
        let buf = xor_with_seed("hunter2", seed);
        let back: Vec<u8> = buf
            .iter()
            .zip(seed.iter().cycle())
            .map(|(b, s)| b ^ s)
            .collect();
        assert_eq!(back, b"hunter2\0");
    }

    #[test]
    fn test_parse_public_key_rejects_garbage() {
        let err = parse_public_key(b"-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----")
            .unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthenticationErrorKind::MalformedKey));
    }
}
