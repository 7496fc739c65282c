use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const DIGITS: u32 = 6;
const STEP_SECONDS: u64 = 30;

/// RFC 6238 over HMAC-SHA256, 6 digits, 30 second steps. Verification
/// accepts one step of clock skew either side.
pub fn verify_code(secret: &[u8], code: &str, unix_time: u64) -> bool {
    if code.len() != DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let counter = unix_time / STEP_SECONDS;
    for candidate in counter.saturating_sub(1)..=counter + 1 {
        if format_code(hotp(secret, candidate), DIGITS) == code {
            return true;
        }
    }
    false
}

pub fn generate_secret() -> Vec<u8> {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    bytes.to_vec()
}

/// otpauth:// URI for authenticator-app enrollment.
pub fn otpauth_uri(secret: &[u8], account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={}&issuer={issuer}&algorithm=SHA256&digits={DIGITS}&period={STEP_SECONDS}",
        base32_encode(secret)
    )
}

fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

fn format_code(truncated: u32, digits: u32) -> String {
    format!("{:0width$}", truncated % 10u32.pow(digits), width = digits as usize)
}

// RFC 4648 base32 without padding. Only needed for otpauth URIs, so
// encode-only.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::new();
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 Appendix B, SHA-256 row at T = 59s (8-digit reference value).
    #[test]
    fn rfc6238_sha256_vector() {
        let secret = b"12345678901234567890123456789012";
        let counter = 59 / STEP_SECONDS;
        assert_eq!(format_code(hotp(secret, counter), 8), "46119246");
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let secret = generate_secret();
        let now = 1_700_000_000u64;
        let code = format_code(hotp(&secret, now / STEP_SECONDS), DIGITS);
        assert!(verify_code(&secret, &code, now));
        assert!(verify_code(&secret, &code, now + STEP_SECONDS));
        assert!(verify_code(&secret, &code, now - STEP_SECONDS));
        assert!(!verify_code(&secret, &code, now + 3 * STEP_SECONDS));
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        let secret = generate_secret();
        assert!(!verify_code(&secret, "12345", 0));
        assert!(!verify_code(&secret, "1234567", 0));
        assert!(!verify_code(&secret, "12a456", 0));
    }

    #[test]
    fn base32_known_values() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "MY");
        assert_eq!(base32_encode(b"fo"), "MZXQ");
        assert_eq!(base32_encode(b"foo"), "MZXW6");
        assert_eq!(base32_encode(b"foobar"), "MZXW6YTBOI");
    }

    #[test]
    fn otpauth_uri_shape() {
        let uri = otpauth_uri(b"foobar", "pt@clinic.test", "PTMS");
        assert!(uri.starts_with("otpauth://totp/PTMS:pt@clinic.test?secret=MZXW6YTBOI&"));
        assert!(uri.contains("algorithm=SHA256"));
    }
}
