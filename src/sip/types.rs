//! Protocol constants and small shared types for the OCS/LCS SIP client.
//!
//! # Design Goals
//!
//! 1. **Single source of truth** — retry budgets, timer intervals and
//!    presence code points live here. Other modules must not hardcode them.
//!
//! 2. **Bounded buffering** — the wire reader enforces an upper limit on the
//!    bytes it will accumulate for a single message, so a server that
//!    advertises an absurd `Content-Length` cannot exhaust memory.

use serde::{Deserialize, Serialize};

// =============================================================================
// PORTS AND WIRE LIMITS
// =============================================================================

/// Default SIP port for TCP and UDP.
pub const DEFAULT_PORT: u16 = 5060;

/// Default SIP port for TLS.
pub const DEFAULT_TLS_PORT: u16 = 5061;

/// Maximum bytes buffered for one incoming message (headers + body).
/// Roaming contact lists for large deployments run to a few hundred KB;
/// 4 MB leaves ample headroom while bounding per-connection memory.
pub const MESSAGE_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Maximum size of a single UDP datagram we will process.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

// =============================================================================
// RETRY BUDGETS AND TIMERS
// =============================================================================

/// 401 challenges tolerated on REGISTER before "Wrong Password".
pub const REGISTER_AUTH_RETRIES: u32 = 3;

/// 407 challenges tolerated for proxy authentication before giving up.
pub const PROXY_AUTH_RETRIES: u32 = 30;

/// Seconds between retransmit sweeps over open transactions.
pub const RESEND_SWEEP_INTERVAL_SECS: u64 = 4;

/// A transaction older than this with no retries is retransmitted once.
pub const RESEND_AFTER_SECS: u64 = 2;

/// A retransmitted transaction older than this is surfaced as timed out.
pub const REQUEST_TIMEOUT_SECS: u64 = 32;

/// Seconds subtracted from credential expiry when scheduling re-auth.
pub const REAUTH_LEAD_SECS: u64 = 300;

/// NTLM security tokens are good for roughly eight hours.
pub const NTLM_TOKEN_LIFETIME_SECS: u64 = 8 * 3600;

/// Subscription refreshes fire this many seconds before expiry.
pub const SUBSCRIBE_REFRESH_LEAD_SECS: u64 = 60;

/// Per-buddy presence subscriptions are spread so that at most this many
/// SUBSCRIBE requests go out per second after the roster first loads.
pub const SUBSCRIBE_RATE_PER_SEC: usize = 25;

// =============================================================================
// SCHEDULED ACTION NAMES
// =============================================================================
// Action names follow the `<event>[<data>...]` convention so a reschedule
// replaces the previous instance (see sched::Scheduler).

pub const ACTION_REGISTER: &str = "<registration>";
pub const ACTION_REAUTH: &str = "<+reauthentication>";
pub const ACTION_KEEPALIVE: &str = "<keepalive>";
pub const ACTION_RESEND: &str = "<resend>";
pub const ACTION_WPENDING: &str = "<presence.wpending>";
pub const ACTION_PRESENCE_BATCHED: &str = "<presence><batched>";

/// Action name for a single contact's presence refresh.
pub fn presence_action_name(uri: &str) -> String {
    format!("<presence><{}>", uri)
}

// =============================================================================
// PRESENCE ACTIVITY
// =============================================================================

/// Aggregated presence state of a contact or of ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Unknown,
    Available,
    BeRightBack,
    Busy,
    DoNotDisturb,
    OnThePhone,
    Away,
    OutToLunch,
    Invisible,
    Offline,
}

impl Activity {
    /// Map an OCS 2007 aggregate availability (RLMI `state/availability`)
    /// to an activity by threshold.
    pub fn from_avail(avail: i32) -> Self {
        if avail < 3000 {
            Activity::Unknown
        } else if avail < 4500 {
            Activity::Available
        } else if avail < 6000 {
            Activity::BeRightBack
        } else if avail < 7500 {
            Activity::OnThePhone
        } else if avail < 9000 {
            Activity::Busy
        } else if avail < 12000 {
            Activity::DoNotDisturb
        } else if avail < 18000 {
            Activity::Away
        } else {
            Activity::Offline
        }
    }

    /// Availability code published in an msrtc category publication.
    pub fn publish_code(self) -> i32 {
        match self {
            Activity::Available => 3000,
            Activity::BeRightBack => 4500,
            Activity::OnThePhone => 6000,
            Activity::Busy => 7500,
            Activity::DoNotDisturb => 9000,
            Activity::Away | Activity::OutToLunch => 12000,
            Activity::Offline | Activity::Invisible => 18000,
            Activity::Unknown => 0,
        }
    }

    /// (availability, activity) pair for the LCS 2005 `setPresence` SOAP.
    pub fn soap_codes(self) -> (i32, i32) {
        match self {
            Activity::Away => (300, 100),
            Activity::OutToLunch => (300, 150),
            Activity::BeRightBack => (300, 300),
            Activity::Available | Activity::Unknown => (300, 400),
            Activity::OnThePhone => (300, 500),
            Activity::Busy | Activity::DoNotDisturb => (300, 600),
            Activity::Invisible | Activity::Offline => (0, 100),
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Activity::Unknown => "unknown",
            Activity::Available => "available",
            Activity::BeRightBack => "be-right-back",
            Activity::Busy => "busy",
            Activity::DoNotDisturb => "do-not-disturb",
            Activity::OnThePhone => "on-the-phone",
            Activity::Away => "away",
            Activity::OutToLunch => "out-to-lunch",
            Activity::Invisible => "invisible",
            Activity::Offline => "offline",
        };
        f.write_str(s)
    }
}

// =============================================================================
// IDENTIFIER GENERATION
// =============================================================================

/// Generate a dialog tag: two 16-bit random values, zero padded.
pub fn gentag() -> String {
    format!(
        "{:04}{:04}",
        rand::random::<u16>() % 10000,
        rand::random::<u16>() % 10000
    )
}

/// Generate a Via branch with the RFC 3261 magic cookie.
pub fn genbranch() -> String {
    format!(
        "z9hG4bK{:04X}{:04X}{:04X}{:04X}{:04X}",
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>()
    )
}

/// Generate a Call-ID in the interleaved-letter shape OCS expects.
pub fn gencallid() -> String {
    format!(
        "{:04X}g{:04X}a{:04X}i{:04X}m{:04X}t{:04X}b{:04X}x{:04X}x",
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>(),
        rand::random::<u16>()
    )
}

/// Derive the GRUU device UUID from an endpoint id. Name-based (v5) so the
/// same EPID always yields the same UUID across reconnects.
pub fn uuid_from_epid(epid: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, epid.as_bytes()).to_string()
}

/// Lowercased canonical form used as a map key for URIs and Call-IDs.
/// Human-visible forms keep their original case.
pub fn canonical_key(s: &str) -> String {
    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avail_thresholds() {
        assert_eq!(Activity::from_avail(0), Activity::Unknown);
        assert_eq!(Activity::from_avail(2999), Activity::Unknown);
        assert_eq!(Activity::from_avail(3000), Activity::Available);
        assert_eq!(Activity::from_avail(4500), Activity::BeRightBack);
        assert_eq!(Activity::from_avail(6000), Activity::OnThePhone);
        assert_eq!(Activity::from_avail(7500), Activity::Busy);
        assert_eq!(Activity::from_avail(9000), Activity::DoNotDisturb);
        assert_eq!(Activity::from_avail(12000), Activity::Away);
        assert_eq!(Activity::from_avail(18000), Activity::Offline);
    }

    #[test]
    fn test_publish_codes_roundtrip_thresholds() {
        // Each published code must decode back to the same activity.
        for act in [
            Activity::Available,
            Activity::BeRightBack,
            Activity::OnThePhone,
            Activity::Busy,
            Activity::DoNotDisturb,
            Activity::Away,
            Activity::Offline,
        ] {
            assert_eq!(Activity::from_avail(act.publish_code()), act);
        }
    }

    #[test]
    fn test_uuid_stable_per_epid() {
        let a = uuid_from_epid("01010101");
        let b = uuid_from_epid("01010101");
        let c = uuid_from_epid("02020202");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_branch_magic_cookie() {
        assert!(genbranch().starts_with("z9hG4bK"));
    }

    #[test]
    fn test_callid_shape() {
        let id = gencallid();
        for marker in ["g", "a", "i", "m", "t", "b", "x"] {
            assert!(id.contains(marker));
        }
    }
}
