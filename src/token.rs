//! Opaque identifier minting for peer ids and delete tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

/// Entropy per token. 16 bytes keeps identifiers unguessable.
pub const TOKEN_BYTES: usize = 16;

/// Mint a fresh opaque token from the OS CSPRNG, URL-safe base64 encoded.
///
/// Every peer identifier and every room delete token is drawn
/// independently; tokens are never reused across sessions.
pub fn mint() -> String {
  let mut buf = [0u8; TOKEN_BYTES];
  OsRng.fill_bytes(&mut buf);
  URL_SAFE_NO_PAD.encode(buf)
}
