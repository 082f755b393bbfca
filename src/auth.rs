// ============================================================================
// AUTH - Wallet Signatures + Session Tokens
// ============================================================================
//
// Two narrow boundaries consumed by the rest of the crate:
//
// 1. Signature verifier: Ed25519 over a challenge string. The wallet
//    address is derived from the public key (0x + first 40 hex chars of
//    SHA-256(pubkey)), so a valid signature "recovers" the address.
// 2. Token issuer: JWT with a typed claims struct, validated once at the
//    request boundary and passed on as plain values. No map lookups.
//
// The signature proves key ownership; the challenge comes from the
// single-use nonce store, so a captured request cannot be replayed.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Session token lifetime.
pub const TOKEN_TTL_HOURS: i64 = 100;

// ============================================================================
// ADDRESSES
// ============================================================================

/// Derive the wallet address for an Ed25519 public key:
/// `0x` + first 40 hex chars of SHA-256 over the raw key bytes.
pub fn derive_address(public_key_hex: &str) -> Result<String, String> {
    let key_bytes = hex::decode(public_key_hex).map_err(|_| "invalid public key hex".to_string())?;
    if key_bytes.len() != 32 {
        return Err(format!("invalid public key length: {}", key_bytes.len()));
    }

    let digest = Sha256::digest(&key_bytes);
    Ok(format!("0x{}", &hex::encode(digest)[..40]))
}

/// Syntactic address check: `0x` followed by 40 hex chars.
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

// ============================================================================
// SIGNATURE VERIFICATION
// ============================================================================

/// Verify `signature_hex` over `message` with `public_key_hex`.
/// Returns the derived wallet address when the signature is valid.
pub fn verify_signature(
    public_key_hex: &str,
    signature_hex: &str,
    message: &str,
) -> Result<String, String> {
    let key_bytes = hex::decode(public_key_hex).map_err(|_| "invalid public key hex".to_string())?;
    if key_bytes.len() != 32 {
        return Err(format!("invalid public key length: {}", key_bytes.len()));
    }
    let verifying_key = VerifyingKey::from_bytes(key_bytes.as_slice().try_into().unwrap())
        .map_err(|e| format!("invalid ed25519 key: {}", e))?;

    let sig_bytes = hex::decode(signature_hex).map_err(|_| "invalid signature hex".to_string())?;
    if sig_bytes.len() != 64 {
        return Err(format!("invalid signature length: {}", sig_bytes.len()));
    }
    let signature = Signature::from_bytes(sig_bytes.as_slice().try_into().unwrap());

    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| "signature verification failed".to_string())?;

    derive_address(public_key_hex)
}

/// Sign `message` with a hex private key. Client-side helper, used by tests.
pub fn sign_message(private_key_hex: &str, message: &str) -> Result<String, String> {
    let key_bytes = hex::decode(private_key_hex).map_err(|_| "invalid private key hex".to_string())?;
    let signing_key = SigningKey::from_bytes(
        key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid private key length".to_string())?,
    );
    let signature = signing_key.sign(message.as_bytes());
    Ok(hex::encode(signature.to_bytes()))
}

/// Generate a fresh (private, public) hex keypair.
pub fn generate_keypair() -> (String, String) {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);

    let signing_key = SigningKey::from_bytes(&secret);
    let verifying_key = signing_key.verifying_key();
    (hex::encode(signing_key.to_bytes()), hex::encode(verifying_key.to_bytes()))
}

// ============================================================================
// SESSION TOKENS
// ============================================================================

/// Token claims. Decoded once per request; handlers receive the struct,
/// never the raw token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: u64,
    pub role: String,
    pub exp: usize,
}

/// Issue a session token for `user_id`.
pub fn issue_token(user_id: u64, role: &str, secret: &[u8]) -> Result<String, String> {
    let exp = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(TOKEN_TTL_HOURS))
        .ok_or_else(|| "clock overflow".to_string())?
        .timestamp() as usize;

    let claims = Claims { user_id, role: role.to_string(), exp };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| format!("token encoding failed: {}", e))
}

/// Verify a session token and return its claims.
pub fn verify_token(token: &str, secret: &[u8]) -> Result<Claims, String> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret), &Validation::default())
        .map(|data| data.claims)
        .map_err(|_| "invalid token".to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip_recovers_address() {
        let (private, public) = generate_keypair();
        let challenge = "1723111111";

        let sig = sign_message(&private, challenge).unwrap();
        let recovered = verify_signature(&public, &sig, challenge).unwrap();

        assert_eq!(recovered, derive_address(&public).unwrap());
        assert!(is_valid_address(&recovered));
    }

    #[test]
    fn wrong_message_fails() {
        let (private, public) = generate_keypair();
        let sig = sign_message(&private, "challenge-a").unwrap();
        assert!(verify_signature(&public, &sig, "challenge-b").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (private, _) = generate_keypair();
        let (_, other_public) = generate_keypair();
        let sig = sign_message(&private, "challenge").unwrap();
        assert!(verify_signature(&other_public, &sig, "challenge").is_err());
    }

    #[test]
    fn malformed_inputs_rejected() {
        assert!(verify_signature("zz", "00", "m").is_err());
        assert!(verify_signature(&"00".repeat(16), "zz", "m").is_err());
        assert!(derive_address("abcd").is_err());
    }

    #[test]
    fn address_syntax() {
        assert!(is_valid_address("0x0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_valid_address("0x012345"));
        assert!(!is_valid_address("1x0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_valid_address("0x0123456789abcdef0123456789abcdef0123456g"));
    }

    #[test]
    fn token_roundtrip() {
        let secret = b"test-secret";
        let token = issue_token(42, "user", secret).unwrap();
        let claims = verify_token(&token, secret).unwrap();

        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.role, "user");
        assert!(verify_token(&token, b"other-secret").is_err());
    }
}
