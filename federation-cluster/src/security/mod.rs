//! # Cluster Seal
//!
//! Keyed message authentication for heartbeat and handover traffic.
//!
//! Every federation message is authenticated with HMAC-SHA256 keyed by the cluster seal,
//! a secret distributed out-of-band. The MAC covers
//!
//! ```text
//! u32_be(len(payload)) || payload || u64_be(epoch) || u64_be(sent_at)
//! ```
//!
//! where `sent_at` is whole Unix seconds. Length-prefixing the payload keeps field
//! boundaries fixed, so `("node-1", 23)` and `("node-12", 3)` can never collide.
//!
//! Verification fails closed: malformed input, a timestamp outside the freshness window,
//! or a MAC mismatch all yield `false` from [`ClusterSeal::verify`]. The comparison is
//! constant time.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    time::unix_seconds,
    types::{Epoch, NodeId},
};

type HmacSha256 = Hmac<Sha256>;

/// Size of an HMAC-SHA256 tag in bytes
pub const SIGNATURE_LEN: usize = 32;

/// Domain separator for lease tokens so they can never be replayed as message signatures
const LEASE_DOMAIN: &[u8] = b"federation-lease-v1";

/// Why a signed message failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    /// Signature was not valid hex or had the wrong length
    #[error("malformed signature: {0}")]
    Malformed(String),

    /// `sent_at` lies outside the freshness window around the receiver's clock
    #[error("sent_at outside freshness window (skew {skew_secs}s)")]
    OutsideFreshnessWindow {
        /// Receiver time minus sender time, in seconds
        skew_secs: i64,
    },

    /// The MAC did not match
    #[error("signature mismatch")]
    BadSignature,
}

/// An HMAC-SHA256 tag
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    /// Lowercase hex rendering used on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw tag bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", &self.to_hex()[..8])
    }
}

impl FromStr for Signature {
    type Err = VerificationFailure;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| VerificationFailure::Malformed(format!("invalid hex: {e}")))?;
        let tag: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            VerificationFailure::Malformed(format!(
                "expected {SIGNATURE_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(tag))
    }
}

/// Cluster-wide shared secret used to sign and verify federation traffic
pub struct ClusterSeal {
    key: Zeroizing<Vec<u8>>,
    freshness_window: Duration,
}

impl ClusterSeal {
    /// Create a seal from raw key material
    ///
    /// # Errors
    /// Returns an error if the key material is empty.
    pub fn new(secret: impl AsRef<[u8]>, freshness_window: Duration) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Authentication("cluster seal cannot be empty".to_string()));
        }
        Ok(Self { key: Zeroizing::new(secret.to_vec()), freshness_window })
    }

    /// Configured freshness window
    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Sign `payload` at `epoch`, stamped with `sent_at` (Unix seconds)
    pub fn sign(&self, payload: &[u8], epoch: Epoch, sent_at: u64) -> Signature {
        let mut mac = self.keyed();
        mac.update(&signing_input(payload, epoch, sent_at));
        Signature(mac.finalize().into_bytes().into())
    }

    /// Verify a signed message, reporting why it was rejected
    ///
    /// The freshness window is checked before the MAC, so a replayed message is rejected
    /// even when its signature is genuine.
    pub fn check(
        &self,
        payload: &[u8],
        epoch: Epoch,
        sent_at: u64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), VerificationFailure> {
        let tag: Signature = signature.parse()?;

        let skew_secs = now.timestamp().saturating_sub(i64::try_from(sent_at).unwrap_or(i64::MAX));
        let window = i64::try_from(self.freshness_window.as_secs()).unwrap_or(i64::MAX);
        if skew_secs.unsigned_abs() > window.unsigned_abs() {
            return Err(VerificationFailure::OutsideFreshnessWindow { skew_secs });
        }

        let mut mac = self.keyed();
        mac.update(&signing_input(payload, epoch, sent_at));
        mac.verify_slice(tag.as_bytes()).map_err(|_| VerificationFailure::BadSignature)
    }

    /// Fail-closed boolean verification
    pub fn verify(
        &self,
        payload: &[u8],
        epoch: Epoch,
        sent_at: u64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.check(payload, epoch, sent_at, signature, now).is_ok()
    }

    /// Mint the lease token identifying one leadership tenure of `node_id` at `epoch`
    pub fn mint_lease_token(&self, node_id: &NodeId, epoch: Epoch, issued_at: DateTime<Utc>) -> String {
        let mut mac = self.keyed();
        mac.update(LEASE_DOMAIN);
        mac.update(&signing_input(node_id.as_bytes(), epoch, unix_seconds(issued_at)));
        hex::encode(mac.finalize().into_bytes())
    }

    fn keyed(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts keys of any length")
    }
}

impl fmt::Debug for ClusterSeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSeal")
            .field("key", &"<redacted>")
            .field("freshness_window", &self.freshness_window)
            .finish()
    }
}

fn signing_input(payload: &[u8], epoch: Epoch, sent_at: u64) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut input = Vec::with_capacity(4 + payload.len() + 16);
    input.extend_from_slice(&len.to_be_bytes());
    input.extend_from_slice(payload);
    input.extend_from_slice(&epoch.to_be_bytes());
    input.extend_from_slice(&sent_at.to_be_bytes());
    input
}
