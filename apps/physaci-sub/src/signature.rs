//! Signing-key material and the signed-request headers for the node server
//! status probe.
//!
//! The node server verifies probes with a shared-secret HMAC over the `Host`
//! and `Date` header values. The `Authorization` value rendered here has to
//! match the verifier byte for byte, so every piece of the assembly is pinned
//! by tests.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<sha2::Sha256>;

/// Host value pinned into the signing string. The probe only ever talks to
/// loopback, and the verifier expects this literal without a port.
pub const SIGNED_HOST: &str = "127.0.0.1";

/// Lowercased header names covered by the signature, in signing order.
const SIGNED_HEADERS: [&str; 2] = ["host", "date"];

/// Entropy drawn per signing key, before encoding.
const KEY_ENTROPY_BYTES: usize = 64;

/// Mints a fresh signing key: 64 random bytes, URL-safe base64 without
/// padding.
pub fn generate_node_key() -> String {
    let mut bytes = [0u8; KEY_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time key comparison, including the length check. Both inputs are
/// padded to a common length with distinct fill bytes so unequal lengths can
/// never compare equal.
pub fn keys_match(a: &str, b: &str) -> bool {
    let longest = a.len().max(b.len());
    let mut a_padded = vec![0x00u8; longest];
    let mut b_padded = vec![0xffu8; longest];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());
    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}

/// Renders `now` as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`), the
/// form carried in the `Date` header and covered by the signature.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Builds the `Authorization` value for a status probe signed with
/// `signing_key`.
///
/// The signing string is `"{host}\n{date}"`, exactly those two values in that
/// order, and the `headers` field is the plain textual list rendering the
/// verifier expects rather than any escaped structure.
pub fn authorization_header(signing_key: &str, hostname: &str, date: &str) -> String {
    let signing_string = format!("{SIGNED_HOST}\n{date}");
    let mut mac =
        HmacSha256::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_string.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    format!(
        "Signature keyID=\"{hostname}\",algorithm=\"hmac-sha256\",headers=\"{}\",signature={signature}",
        rendered_header_list()
    )
}

fn rendered_header_list() -> String {
    let quoted: Vec<String> = SIGNED_HEADERS
        .iter()
        .map(|name| format!("'{name}'"))
        .collect();
    format!("[{}]", quoted.join(", "))
}
