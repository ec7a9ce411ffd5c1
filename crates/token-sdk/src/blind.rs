//! RSA blind-signature primitives (RSABSSA, SHA-384 PSS randomized).
//!
//! The client hashes and PSS-encodes the token, multiplies it by `r^e mod n`
//! so the signer sees only an opaque value, and after the signer applies its
//! private exponent the client strips the factor with `r^-1` to recover a
//! regular RSA-PSS signature over the original token. The signer never
//! learns which token it signed; the verifier cannot link a signature back
//! to a signing request.

use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha384};

use crate::error::{Result, TokenError};

/// SHA-384 digest length; RSABSSA uses a salt of the same size.
const HASH_LEN: usize = 48;
const SALT_LEN: usize = 48;

/// Ephemeral state for one mint attempt: the original token bytes and the
/// inverse of the blinding factor. Owns its data, is not `Clone`, and is
/// consumed by [`finalize`], so one blinding factor can never be applied to
/// a different attempt's signature.
pub struct BlindingContext {
    token: Vec<u8>,
    r_inv: BigUint,
}

impl BlindingContext {
    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

/// Blinds `token` against the signer's public key. Returns the blinded
/// message (fixed-width, ready for transport) and the context required to
/// finalize the signer's response.
pub fn blind(pubkey: &RsaPublicKey, token: &[u8]) -> Result<(Vec<u8>, BlindingContext)> {
    let n = pubkey.n();
    let e = pubkey.e();
    let mod_bits = n.bits();

    let em = emsa_pss_encode(token, mod_bits - 1)?;
    let m = BigUint::from_bytes_be(&em);
    if gcd(&m, n) != BigUint::from(1u32) {
        // Astronomically unlikely for a well-formed modulus; would reveal a
        // factor of n.
        return Err(TokenError::Crypto("encoded message not coprime with modulus".into()));
    }

    let r = fresh_blinding_factor(n)?;
    let r_inv = mod_inverse(&r, n)
        .ok_or_else(|| TokenError::Crypto("blinding factor not invertible".into()))?;

    // z = m * r^e mod n
    let blinded = (&m * r.modpow(e, n)) % n;

    Ok((
        i2osp(&blinded, (mod_bits + 7) / 8)?,
        BlindingContext {
            token: token.to_vec(),
            r_inv,
        },
    ))
}

/// Unblinds the signer's response and verifies the resulting signature
/// against the original token. Consumes the context; after this call the
/// blinding inverse is gone, success or failure.
pub fn finalize(
    pubkey: &RsaPublicKey,
    ctx: BlindingContext,
    blind_sig: &[u8],
) -> Result<Vec<u8>> {
    let n = pubkey.n();
    let z = BigUint::from_bytes_be(blind_sig);
    if &z >= n {
        return Err(TokenError::InvalidSignature);
    }

    // s = z * r^-1 mod n
    let s = (&z * &ctx.r_inv) % n;
    let signature = i2osp(&s, (n.bits() + 7) / 8)?;

    verify(pubkey, &ctx.token, &signature)?;
    Ok(signature)
}

/// Verifies a finalized signature over `token`.
pub fn verify(pubkey: &RsaPublicKey, token: &[u8], signature: &[u8]) -> Result<()> {
    let n = pubkey.n();
    let e = pubkey.e();

    let s = BigUint::from_bytes_be(signature);
    if &s >= n {
        return Err(TokenError::InvalidSignature);
    }

    let m = s.modpow(e, n);
    let em_bits = n.bits() - 1;
    let em = i2osp(&m, (em_bits + 7) / 8).map_err(|_| TokenError::InvalidSignature)?;

    emsa_pss_verify(token, &em, em_bits)
}

/// Raw signing operation over an already-blinded message: `z^d mod n`.
/// This is the signing server's half of the protocol, exposed here for
/// local development signers and tests.
pub fn sign_blinded(private_key: &RsaPrivateKey, blinded: &[u8]) -> Result<Vec<u8>> {
    let n = private_key.n();
    let d = private_key.d();

    let z = BigUint::from_bytes_be(blinded);
    if &z >= n {
        return Err(TokenError::Crypto("blinded message out of range".into()));
    }

    let s = z.modpow(d, n);
    i2osp(&s, (n.bits() + 7) / 8)
}

/// EMSA-PSS encoding (RFC 8017 §9.1.1) with SHA-384 and a fresh random
/// 48-byte salt.
fn emsa_pss_encode(msg: &[u8], em_bits: usize) -> Result<Vec<u8>> {
    let em_len = (em_bits + 7) / 8;
    if em_len < HASH_LEN + SALT_LEN + 2 {
        return Err(TokenError::Crypto("modulus too small for PSS encoding".into()));
    }

    let m_hash = Sha384::digest(msg);
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    // M' = (0x00 x 8) || mHash || salt
    let mut m_prime = Vec::with_capacity(8 + HASH_LEN + SALT_LEN);
    m_prime.extend_from_slice(&[0u8; 8]);
    m_prime.extend_from_slice(&m_hash);
    m_prime.extend_from_slice(&salt);
    let h = Sha384::digest(&m_prime);

    // DB = PS || 0x01 || salt, masked with MGF1(H)
    let ps_len = em_len - SALT_LEN - HASH_LEN - 2;
    let mut db = vec![0u8; ps_len + 1 + SALT_LEN];
    db[ps_len] = 0x01;
    db[ps_len + 1..].copy_from_slice(&salt);
    mgf1_xor(&mut db, &h);

    // Clear the leftmost 8*emLen - emBits bits so EM < 2^emBits
    db[0] &= 0xff >> (8 * em_len - em_bits);

    let mut em = db;
    em.extend_from_slice(&h);
    em.push(0xbc);
    Ok(em)
}

/// EMSA-PSS verification (RFC 8017 §9.1.2). Any structural mismatch is an
/// invalid signature.
fn emsa_pss_verify(msg: &[u8], em: &[u8], em_bits: usize) -> Result<()> {
    let em_len = (em_bits + 7) / 8;
    if em.len() != em_len || em_len < HASH_LEN + SALT_LEN + 2 {
        return Err(TokenError::InvalidSignature);
    }
    if em[em_len - 1] != 0xbc {
        return Err(TokenError::InvalidSignature);
    }

    let (masked_db, tail) = em.split_at(em_len - HASH_LEN - 1);
    let h = &tail[..HASH_LEN];

    let top_mask: u8 = !(0xff >> (8 * em_len - em_bits));
    if masked_db[0] & top_mask != 0 {
        return Err(TokenError::InvalidSignature);
    }

    let mut db = masked_db.to_vec();
    mgf1_xor(&mut db, h);
    db[0] &= 0xff >> (8 * em_len - em_bits);

    let ps_len = em_len - HASH_LEN - SALT_LEN - 2;
    if db[..ps_len].iter().any(|&b| b != 0) || db[ps_len] != 0x01 {
        return Err(TokenError::InvalidSignature);
    }
    let salt = &db[ps_len + 1..];

    let m_hash = Sha384::digest(msg);
    let mut m_prime = Vec::with_capacity(8 + HASH_LEN + SALT_LEN);
    m_prime.extend_from_slice(&[0u8; 8]);
    m_prime.extend_from_slice(&m_hash);
    m_prime.extend_from_slice(salt);
    let h_prime = Sha384::digest(&m_prime);

    if h_prime.as_slice() != h {
        return Err(TokenError::InvalidSignature);
    }
    Ok(())
}

/// MGF1 with SHA-384: XORs the generated mask into `out` in place.
fn mgf1_xor(out: &mut [u8], seed: &[u8]) {
    let mut counter: u32 = 0;
    let mut offset = 0;
    while offset < out.len() {
        let mut hasher = Sha384::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();
        for byte in block.iter() {
            if offset == out.len() {
                break;
            }
            out[offset] ^= byte;
            offset += 1;
        }
        counter += 1;
    }
}

/// Samples a random r in [2, n) with gcd(r, n) = 1. A fresh factor per
/// call is what makes two mints unlinkable.
fn fresh_blinding_factor(n: &BigUint) -> Result<BigUint> {
    let n_bytes = (n.bits() + 7) / 8;
    let mut bytes = vec![0u8; n_bytes];

    for _ in 0..100 {
        rand::thread_rng().fill_bytes(&mut bytes);
        let r = BigUint::from_bytes_be(&bytes) % n;

        if r > BigUint::from(1u32) && gcd(&r, n) == BigUint::from(1u32) {
            return Ok(r);
        }
    }

    Err(TokenError::Crypto("failed to generate blinding factor".into()))
}

fn gcd(a: &BigUint, b: &BigUint) -> BigUint {
    let zero = BigUint::from(0u32);
    let mut a = a.clone();
    let mut b = b.clone();
    while b > zero {
        let rem = &a % &b;
        a = b;
        b = rem;
    }
    a
}

/// Modular inverse via the extended Euclidean algorithm. Coefficients are
/// tracked modulo n, which keeps every intermediate value unsigned.
fn mod_inverse(a: &BigUint, n: &BigUint) -> Option<BigUint> {
    let zero = BigUint::from(0u32);
    let one = BigUint::from(1u32);

    let mut r0 = n.clone();
    let mut r1 = a % n;
    let mut t0 = zero.clone();
    let mut t1 = one.clone();

    while r1 > zero {
        let q = &r0 / &r1;

        let r2 = &r0 - &q * &r1;
        r0 = r1;
        r1 = r2;

        // t2 = t0 - q*t1 (mod n)
        let qt = (&q * &t1) % n;
        let t2 = ((n + &t0) - qt) % n;
        t0 = t1;
        t1 = t2;
    }

    if r0 == one {
        Some(t0)
    } else {
        None
    }
}

/// Fixed-width big-endian encoding (I2OSP).
fn i2osp(x: &BigUint, len: usize) -> Result<Vec<u8>> {
    let bytes = x.to_bytes_be();
    if bytes.len() > len {
        return Err(TokenError::Crypto("integer too large for target width".into()));
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_keypair;

    #[test]
    fn blind_sign_unblind_verify_roundtrip() {
        let private_key = test_keypair();
        let public_key = RsaPublicKey::from(private_key);

        let token = b"anonymous usage token";
        let (blinded, ctx) = blind(&public_key, token).unwrap();
        let blind_sig = sign_blinded(private_key, &blinded).unwrap();
        let signature = finalize(&public_key, ctx, &blind_sig).unwrap();

        verify(&public_key, token, &signature).unwrap();
    }

    #[test]
    fn tampered_blind_signature_is_rejected() {
        let private_key = test_keypair();
        let public_key = RsaPublicKey::from(private_key);

        let token = b"anonymous usage token";
        let (blinded, ctx) = blind(&public_key, token).unwrap();
        let mut blind_sig = sign_blinded(private_key, &blinded).unwrap();
        blind_sig[10] ^= 0x01;

        match finalize(&public_key, ctx, &blind_sig) {
            Err(TokenError::InvalidSignature) => {}
            other => panic!("expected InvalidSignature, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn signature_does_not_verify_for_other_token() {
        let private_key = test_keypair();
        let public_key = RsaPublicKey::from(private_key);

        let (blinded, ctx) = blind(&public_key, b"token one").unwrap();
        let blind_sig = sign_blinded(private_key, &blinded).unwrap();
        let signature = finalize(&public_key, ctx, &blind_sig).unwrap();

        assert!(matches!(
            verify(&public_key, b"token two", &signature),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn blinding_factors_are_independent_across_calls() {
        let private_key = test_keypair();
        let public_key = RsaPublicKey::from(private_key);

        // Same token bytes, two blind calls: the blinded messages must
        // differ, otherwise the signer could correlate the two requests.
        let token = b"same token bytes";
        let (blinded_a, _ctx_a) = blind(&public_key, token).unwrap();
        let (blinded_b, _ctx_b) = blind(&public_key, token).unwrap();
        assert_ne!(blinded_a, blinded_b);
    }

    #[test]
    fn blinded_message_is_modulus_width() {
        let private_key = test_keypair();
        let public_key = RsaPublicKey::from(private_key);

        let (blinded, _ctx) = blind(&public_key, b"t").unwrap();
        assert_eq!(blinded.len(), (public_key.n().bits() + 7) / 8);
    }

    #[test]
    fn mod_inverse_matches_definition() {
        let n = BigUint::from(101u32);
        let a = BigUint::from(37u32);
        let inv = mod_inverse(&a, &n).unwrap();
        assert_eq!((a * inv) % n, BigUint::from(1u32));
    }

    #[test]
    fn mod_inverse_rejects_non_coprime() {
        let n = BigUint::from(100u32);
        let a = BigUint::from(10u32);
        assert!(mod_inverse(&a, &n).is_none());
    }
}
