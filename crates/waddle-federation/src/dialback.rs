//! Server Dialback (XEP-0220) key generation.
//!
//! Streams use the key generator during the dialback handshake: outbound
//! streams send the key in `db:result`, inbound streams answer `db:verify`
//! requests by recomputing it.
//!
//! ```text
//! key = HEX(HMAC-SHA256(secret, stream_id || local_domain || remote_domain))
//! ```
//!
//! # References
//!
//! - [XEP-0220: Server Dialback](https://xmpp.org/extensions/xep-0220.html)

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Dialback key generator bound to the server's shared secret.
///
/// Holds no mutable state, so a single instance can be cloned into every
/// stream and used concurrently.
#[derive(Clone)]
pub struct DialbackKey {
    secret: Vec<u8>,
}

impl DialbackKey {
    /// Create a key generator with the given secret.
    ///
    /// The secret must stay constant for the lifetime of the server so that
    /// keys handed out earlier still verify.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Create a key generator with a random 32 byte secret.
    pub fn random() -> Self {
        Self::new(random_secret())
    }

    /// Generate the dialback key for a stream.
    pub fn generate(&self, stream_id: &str, local_domain: &str, remote_domain: &str) -> String {
        hex::encode(self.mac(stream_id, local_domain, remote_domain).finalize().into_bytes())
    }

    /// Verify a hex-encoded dialback key in constant time.
    pub fn verify(
        &self,
        key: &str,
        stream_id: &str,
        local_domain: &str,
        remote_domain: &str,
    ) -> bool {
        let Ok(raw) = hex::decode(key) else {
            return false;
        };
        self.mac(stream_id, local_domain, remote_domain)
            .verify_slice(&raw)
            .is_ok()
    }

    fn mac(&self, stream_id: &str, local_domain: &str, remote_domain: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(stream_id.as_bytes());
        mac.update(local_domain.as_bytes());
        mac.update(remote_domain.as_bytes());
        mac
    }
}

impl fmt::Debug for DialbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialbackKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Random hex secret suitable for `S2sConfig::dialback_secret`.
pub fn random_secret() -> String {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rng().fill_bytes(&mut secret);
    hex::encode(secret)
}
