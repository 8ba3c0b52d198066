//! HMAC request signing and callback URL allowlisting.

use std::fmt;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const SIGNATURE_PREFIX: &str = "sha256=";
pub const WEBHOOK_CONTENT_TYPE: &str = "application/json";

const DIGEST_HEX_LEN: usize = 64;

/// Signs and verifies `"<payload>|<timestamp>"` with a shared secret.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
    max_timestamp_skew: Option<Duration>,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret", &"***REDACTED***")
            .field("max_timestamp_skew", &self.max_timestamp_skew)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub signature: String,
    pub timestamp: String,
}

impl WebhookHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (SIGNATURE_HEADER, self.signature.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            ("Content-Type", WEBHOOK_CONTENT_TYPE),
        ]
    }
}

impl RequestSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            max_timestamp_skew: None,
        }
    }

    /// Rejects signatures whose timestamp is further than `skew` from the verifier's clock.
    /// `None` (the default) accepts any timestamp.
    pub fn with_max_timestamp_skew(mut self, skew: Option<Duration>) -> Self {
        self.max_timestamp_skew = skew;
        self
    }

    /// Lowercase hex HMAC-SHA256 of `"<payload>|<timestamp>"`.
    pub fn sign(&self, payload: &str, timestamp: &str) -> String {
        let mac = self.mac_for(payload, timestamp);
        format!("{:x}", mac.finalize().into_bytes())
    }

    pub fn signature_header(&self, payload: &str, timestamp: &str) -> String {
        format!("{SIGNATURE_PREFIX}{}", self.sign(payload, timestamp))
    }

    pub fn verify(&self, payload: &str, timestamp: &str, header_value: &str) -> bool {
        self.verify_at(payload, timestamp, header_value, unix_now())
    }

    pub fn verify_at(&self, payload: &str, timestamp: &str, header_value: &str, now: i64) -> bool {
        let Some(received_hex) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        let Some(received) = decode_lower_hex(received_hex) else {
            return false;
        };

        if let Some(skew) = self.max_timestamp_skew {
            let Ok(sent_at) = timestamp.trim().parse::<i64>() else {
                return false;
            };
            if now.abs_diff(sent_at) > skew.as_secs() {
                return false;
            }
        }

        self.mac_for(payload, timestamp)
            .verify_slice(&received)
            .is_ok()
    }

    pub fn webhook_headers(&self, payload: &str) -> WebhookHeaders {
        self.webhook_headers_at(payload, unix_now())
    }

    pub fn webhook_headers_at(&self, payload: &str, timestamp: i64) -> WebhookHeaders {
        let timestamp = timestamp.to_string();
        WebhookHeaders {
            signature: self.signature_header(payload, &timestamp),
            timestamp,
        }
    }

    fn mac_for(&self, payload: &str, timestamp: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(payload.as_bytes());
        mac.update(b"|");
        mac.update(timestamp.as_bytes());
        mac
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn decode_lower_hex(raw: &str) -> Option<Vec<u8>> {
    let bytes = raw.as_bytes();
    if bytes.len() != DIGEST_HEX_LEN {
        return None;
    }

    bytes
        .chunks_exact(2)
        .map(|pair| Some((lower_hex_digit(pair[0])? << 4) | lower_hex_digit(pair[1])?))
        .collect()
}

fn lower_hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// The set of URL prefixes a callback may point at.
#[derive(Debug, Clone, Default)]
pub struct CallbackAllowlist {
    entries: Vec<Url>,
}

impl CallbackAllowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for entry in entries {
            let raw = entry.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            match Url::parse(raw) {
                Ok(url) if url.host_str().is_some_and(|host| !host.is_empty()) => parsed.push(url),
                Ok(_) => warn!(entry = %raw, "Ignoring allowlist entry without a host"),
                Err(error) => warn!(entry = %raw, error = %error, "Ignoring unparsable allowlist entry"),
            }
        }
        Self { entries: parsed }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Same scheme, same authority, and an entry path that prefixes the candidate path.
    pub fn is_allowed(&self, candidate: &str) -> bool {
        let Ok(url) = Url::parse(candidate) else {
            return false;
        };
        if url.scheme().is_empty() || url.host_str().map_or(true, str::is_empty) {
            return false;
        }

        self.entries.iter().any(|entry| {
            entry.scheme() == url.scheme()
                && entry.host_str() == url.host_str()
                && entry.port_or_known_default() == url.port_or_known_default()
                && entry.username() == url.username()
                && entry.password() == url.password()
                && url.path().starts_with(entry.path())
        })
    }
}
