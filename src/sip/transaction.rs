//! In-flight request tracking.
//!
//! Requests are keyed by their CSeq token (`"number method"`), which is
//! unique per connection because the account-level CSeq counter only moves
//! forward. Responses are matched back by the same token. Provisional
//! responses leave the entry in place; final responses remove it, except for
//! 200-to-REGISTER which the registrar removes itself after it has read the
//! server capabilities out of the response.

use super::message::SipMessage;
use super::types::{REQUEST_TIMEOUT_SECS, RESEND_AFTER_SECS};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// What to do with the final response. Carried as data; the account
/// dispatches to the matching handler method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHandler {
    /// No interest in the response beyond re-credentialing.
    None,
    Register,
    Subscribe,
    Invite,
    Message,
    Options,
    /// SOAP SERVICE with no follow-up.
    Service,
    /// addGroup SOAP: the 200 carries the assigned groupID, after which the
    /// named buddy is put into it.
    AddGroup { group_name: String, buddy_uri: String },
    /// msrtc category publish: 409 triggers clear-and-retry.
    PresencePublish,
    /// Clear-presence SERVICE: 200 resets the publication version.
    ClearPresence,
    DirectorySearch,
}

#[derive(Debug)]
pub struct Transaction {
    pub cseq_token: String,
    /// The original request, kept for auth resends and retransmits.
    pub msg: SipMessage,
    pub created: Instant,
    pub retries: u32,
    pub handler: ResponseHandler,
}

#[derive(Debug, Default)]
pub struct TransactionStore {
    map: HashMap<String, Transaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, msg: SipMessage, handler: ResponseHandler) {
        let token = msg.cseq_token().unwrap_or("").to_string();
        debug!(cseq = %token, "transaction registered");
        self.map.insert(
            token.clone(),
            Transaction {
                cseq_token: token,
                msg,
                created: Instant::now(),
                retries: 0,
                handler,
            },
        );
    }

    /// Find the transaction a response belongs to.
    pub fn match_response(&self, response: &SipMessage) -> Option<&Transaction> {
        self.map.get(response.cseq_token()?)
    }

    pub fn get_mut(&mut self, cseq_token: &str) -> Option<&mut Transaction> {
        self.map.get_mut(cseq_token)
    }

    pub fn remove(&mut self, cseq_token: &str) -> Option<Transaction> {
        let t = self.map.remove(cseq_token);
        if t.is_some() {
            debug!(cseq = cseq_token, "transaction removed");
        }
        t
    }

    /// Drop everything (connection teardown). No transaction survives a
    /// reconnect.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sweep for retransmits: a transaction past the initial wait with no
    /// retries yet is serialized again and marked retried.
    pub fn retransmit_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let resend_after = Duration::from_secs(RESEND_AFTER_SECS);
        let mut out = Vec::new();
        for trans in self.map.values_mut() {
            if trans.retries == 0 && now.duration_since(trans.created) > resend_after {
                debug!(cseq = %trans.cseq_token, "retransmitting request");
                trans.retries += 1;
                out.push(trans.msg.to_bytes());
            }
        }
        out
    }

    /// Sweep for expiry: retried transactions past the timeout are removed
    /// and handed back so the caller can surface a 408-equivalent failure.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<Transaction> {
        let timeout = Duration::from_secs(REQUEST_TIMEOUT_SECS);
        let expired: Vec<String> = self
            .map
            .values()
            .filter(|t| t.retries >= 1 && now.duration_since(t.created) > timeout)
            .map(|t| t.cseq_token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.map.remove(&token))
            .collect()
    }
}
