//! SIP dialogs and the IM sessions composed of them.
//!
//! A 1:1 conversation is one session holding one dialog; an ad-hoc
//! multiparty chat is one session holding a dialog per remote participant,
//! all sharing the same Call-ID. The session also carries the outgoing
//! message queue and the fingerprints of messages whose delivery is not yet
//! confirmed by a final response.

use super::message::{find_epid, find_part, find_tag, parse_uri, SipMessage};
use super::types::canonical_key;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct Dialog {
    pub with: String,
    pub callid: String,
    pub ourtag: Option<String>,
    pub theirtag: Option<String>,
    pub theirepid: Option<String>,
    /// Local CSeq counter; strictly monotonic for our direction.
    pub cseq: u32,
    /// Route set, in the order routes should be emitted on requests.
    pub routes: Vec<String>,
    /// Request-URI override learned from Record-Route/Contact.
    pub request_uri: Option<String>,
    /// Tokens the peer advertised in `Supported` headers.
    pub supported: Vec<String>,
    pub established: bool,
    /// CSeq token of the in-flight outgoing INVITE, if any.
    pub outgoing_invite: Option<String>,
}

impl Dialog {
    pub fn new(callid: &str, with: &str) -> Self {
        Dialog {
            with: with.to_string(),
            callid: callid.to_string(),
            ..Default::default()
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    pub fn supports(&self, token: &str) -> bool {
        self.supported.iter().any(|s| s.eq_ignore_ascii_case(token))
    }

    /// Absorb dialog state from a message: tags, peer epid, route set and
    /// supported tokens. `outgoing` selects which of From/To is ours.
    pub fn update_from_message(&mut self, msg: &SipMessage, outgoing: bool) {
        let (us, them) = if outgoing { ("From", "To") } else { ("To", "From") };

        if let Some(hdr) = msg.header(us) {
            self.ourtag = find_tag(hdr);
        }
        if let Some(hdr) = msg.header(them) {
            self.theirtag = find_tag(hdr);
            if self.theirepid.is_none() {
                self.theirepid = find_epid(hdr);
            }
        }

        self.take_route_set(msg, outgoing);
        self.merge_supported(msg);
    }

    /// Record-Route headers become the route set; the first route becomes
    /// the request target and the peer Contact is appended as the final hop.
    fn take_route_set(&mut self, msg: &SipMessage, outgoing: bool) {
        let mut routes: Vec<String> = Vec::new();
        for value in msg.headers.all("Record-Route") {
            for part in value.split(',') {
                if let Some(route) = find_part(part, "<", Some(">")) {
                    routes.push(route);
                }
            }
        }
        if outgoing {
            routes.reverse();
        }
        if !routes.is_empty() {
            self.request_uri = Some(routes.remove(0));
        }
        if let Some(contact) = msg.header("Contact").and_then(parse_uri) {
            routes.push(contact);
        }
        if !routes.is_empty() {
            self.routes = routes;
        }
    }

    fn merge_supported(&mut self, msg: &SipMessage) {
        for value in msg.headers.all("Supported") {
            if !self.supports(value) {
                self.supported.push(value.to_string());
            }
        }
    }
}

/// Fingerprint of an unconfirmed MESSAGE within a dialog.
pub fn message_key(callid: &str, cseq: u32, with: &str) -> String {
    format!("<{}><{}><MESSAGE><{}>", callid, cseq, with)
}

/// Fingerprint of an unconfirmed first message riding an INVITE.
pub fn invite_key(callid: &str, cseq: u32) -> String {
    format!("<{}><{}><INVITE>", callid, cseq)
}

/// One conversation, 1:1 or multiparty.
#[derive(Debug, Default)]
pub struct ImSession {
    pub callid: Option<String>,
    pub multiparty: bool,
    /// Host-facing chat id for multiparty sessions.
    pub chat_id: u32,
    /// Peer URI for 1:1 sessions; `None` once upgraded to multiparty.
    pub with: Option<String>,
    pub dialogs: Vec<Dialog>,
    pub queue: VecDeque<String>,
    /// (call-id, cseq, method, peer) fingerprint → message text.
    pub unconfirmed: HashMap<String, String>,
    pub roster_manager: Option<String>,
    /// Whether the host has been told to open a chat window for this one.
    pub chat_opened: bool,
}

impl ImSession {
    pub fn new_im(with: &str) -> Self {
        ImSession {
            with: Some(with.to_string()),
            ..Default::default()
        }
    }

    pub fn new_chat(callid: &str) -> Self {
        ImSession {
            callid: Some(callid.to_string()),
            multiparty: true,
            chat_id: rand::random(),
            ..Default::default()
        }
    }

    pub fn dialog(&self, with: &str) -> Option<&Dialog> {
        self.dialogs.iter().find(|d| d.with == with)
    }

    pub fn dialog_mut(&mut self, with: &str) -> Option<&mut Dialog> {
        self.dialogs.iter_mut().find(|d| d.with == with)
    }

    pub fn remove_dialog(&mut self, with: &str) -> Option<Dialog> {
        let idx = self.dialogs.iter().position(|d| d.with == with)?;
        Some(self.dialogs.remove(idx))
    }

    /// Convert a 1:1 session into a multiparty chat (same Call-ID).
    pub fn upgrade_to_chat(&mut self) {
        self.with = None;
        self.multiparty = true;
        self.chat_id = rand::random();
    }
}

/// All live sessions of one account. Lookups hand out indexes so callers can
/// re-borrow mutably without aliasing the store.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<ImSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, idx: usize) -> Option<&ImSession> {
        self.sessions.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ImSession> {
        self.sessions.get_mut(idx)
    }

    pub fn find_chat(&self, callid: &str) -> Option<usize> {
        let key = canonical_key(callid);
        self.sessions.iter().position(|s| {
            s.callid
                .as_deref()
                .map(|c| canonical_key(c) == key)
                .unwrap_or(false)
        })
    }

    pub fn find_chat_by_id(&self, chat_id: u32) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.multiparty && s.chat_id == chat_id)
    }

    pub fn find_im(&self, with: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.with.as_deref() == Some(with))
    }

    /// Incoming requests resolve their session by Call-ID first (chat), then
    /// by peer URI (1:1).
    pub fn find_for_incoming(&self, callid: &str, from: &str) -> Option<usize> {
        self.find_chat(callid).or_else(|| self.find_im(from))
    }

    pub fn create_im(&mut self, with: &str) -> usize {
        self.sessions.push(ImSession::new_im(with));
        self.sessions.len() - 1
    }

    pub fn create_chat(&mut self, callid: &str) -> usize {
        self.sessions.push(ImSession::new_chat(callid));
        self.sessions.len() - 1
    }

    pub fn remove(&mut self, idx: usize) -> ImSession {
        self.sessions.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImSession> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn drain(&mut self) -> Vec<ImSession> {
        std::mem::take(&mut self.sessions)
    }
}
