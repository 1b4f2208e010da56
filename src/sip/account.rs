//! The account context: owner of every mutable protocol structure and the
//! single place where incoming messages, host commands and timer firings are
//! turned into outgoing SIP.
//!
//! Handlers are synchronous `&mut self` methods; outgoing bytes are appended
//! to a transmit queue that the async event loop flushes after each handler
//! (and buffers while no connection exists yet). That keeps the protocol
//! logic testable without sockets and preserves the strict ordering the
//! protocol needs: one input is fully processed before the next is taken.

use super::auth::{
    auth_header, gen_crand, parse_auth_info, signature_input, AuthKind, AuthState, Credentials,
    MessageSignature, SecurityProvider,
};
use super::dialog::{invite_key, message_key, Dialog, SessionStore};
use super::im;
use super::message::{find_tag, parse_uri, SipMessage};
use super::presence;
use super::registrar::{self, RegisterState, ServerCapabilities};
use super::resolve::{resolve_connection_target, SrvResolver};
use super::roster::{BuddyTable, Group, GroupList, OTHER_CONTACTS};
use super::soap;
use super::subscribe;
use super::transaction::{ResponseHandler, TransactionStore};
use super::transport::{self, TransportKind, Wire, WireEvent, WireError};
use super::types::{
    canonical_key, gencallid, genbranch, gentag, presence_action_name, uuid_from_epid, Activity,
    ACTION_KEEPALIVE, ACTION_PRESENCE_BATCHED, ACTION_REAUTH, ACTION_REGISTER, ACTION_RESEND,
    ACTION_WPENDING, NTLM_TOKEN_LIFETIME_SECS, PROXY_AUTH_RETRIES, REAUTH_LEAD_SECS,
    REGISTER_AUTH_RETRIES, RESEND_SWEEP_INTERVAL_SECS, SUBSCRIBE_RATE_PER_SEC,
    SUBSCRIBE_REFRESH_LEAD_SECS,
};
use crate::config::{AccountConfig, TransportSetting};
use crate::events::{ClientEvent, Command};
use crate::sched::{ScheduledKind, Scheduler};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Methods authenticated against the proxy role with `Proxy-Authorization`.
const PROXY_AUTH_METHODS: &[&str] = &[
    "SUBSCRIBE", "SERVICE", "MESSAGE", "INVITE", "ACK", "NOTIFY", "BYE", "INFO", "OPTIONS",
];

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn from_uri_of(msg: &SipMessage) -> Option<String> {
    msg.header("From").and_then(parse_uri)
}

fn to_uri_of(msg: &SipMessage) -> Option<String> {
    msg.header("To").and_then(parse_uri)
}

fn with_sip_prefix(uri: &str) -> String {
    if uri.starts_with("sip:") {
        uri.to_string()
    } else {
        format!("sip:{}", uri)
    }
}

#[derive(Clone, Copy)]
struct DialogRef<'a> {
    session: usize,
    with: &'a str,
}

struct DialogSnapshot {
    callid: String,
    ourtag: Option<String>,
    theirtag: Option<String>,
    theirepid: Option<String>,
    routes: Vec<String>,
    request_uri: Option<String>,
    cseq: u32,
}

/// One signed-in account. Owns the connection, the dialog/session store,
/// the buddy and group tables, the subscription timers and the auth state.
pub struct Account {
    cfg: AccountConfig,
    provider: Arc<dyn SecurityProvider>,

    kind: TransportKind,
    local_ip: String,
    local_port: u16,
    epid: String,
    device_uuid: String,
    contact: String,
    wire: Option<Wire>,
    txq: VecDeque<Vec<u8>>,
    last_sent: Instant,

    cseq: u32,
    regcallid: Option<String>,
    register_state: RegisterState,
    reregister_set: bool,
    reauthenticate_set: bool,
    subscribed: bool,
    subscribed_buddies: bool,
    quitting: bool,

    registrar: AuthState,
    proxy: AuthState,

    transactions: TransactionStore,
    sched: Scheduler,
    sessions: SessionStore,
    buddies: BuddyTable,
    groups: GroupList,

    caps: ServerCapabilities,
    contacts_delta: u32,
    acl_delta: u32,
    status: Activity,
    note: Option<String>,
    status_version: u32,

    pending_reconnect: Option<registrar::Redirect>,
    terminated: Option<(String, bool)>,

    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Account {
    /// Build an account with no connection. Outgoing requests accumulate in
    /// the transmit queue; `take_outgoing` drains them. This is both the
    /// pre-connect state of a live account and the harness used by tests
    /// and by hosts that drive their own I/O.
    pub fn new_detached(
        cfg: AccountConfig,
        provider: Arc<dyn SecurityProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let epid = hex::encode(rand::thread_rng().gen::<[u8; 4]>());
        let device_uuid = uuid_from_epid(&epid);
        let contact = format!("<sip:{};transport=tls>", cfg.username);
        let account = Account {
            cfg,
            provider,
            kind: TransportKind::Tls,
            local_ip: "127.0.0.1".into(),
            local_port: 5061,
            epid,
            device_uuid,
            contact,
            wire: None,
            txq: VecDeque::new(),
            last_sent: Instant::now(),
            cseq: 0,
            regcallid: None,
            register_state: RegisterState::default(),
            reregister_set: false,
            reauthenticate_set: false,
            subscribed: false,
            subscribed_buddies: false,
            quitting: false,
            registrar: AuthState::new(),
            proxy: AuthState::new(),
            transactions: TransactionStore::new(),
            sched: Scheduler::new(),
            sessions: SessionStore::new(),
            buddies: BuddyTable::new(),
            groups: GroupList::new(),
            caps: ServerCapabilities::default(),
            contacts_delta: 0,
            acl_delta: 0,
            status: Activity::Available,
            note: None,
            status_version: 0,
            pending_reconnect: None,
            terminated: None,
            events: events_tx,
        };
        (account, events_rx)
    }

    // -------------------------------------------------------------------------
    // READ ACCESSORS (used by the event loop and by tests)
    // -------------------------------------------------------------------------

    pub fn register_state(&self) -> RegisterState {
        self.register_state
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.caps
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn buddy_count(&self) -> usize {
        self.buddies.len()
    }

    pub fn has_scheduled(&self, name: &str) -> bool {
        self.sched.contains(name)
    }

    pub fn pending_reconnect(&self) -> Option<&registrar::Redirect> {
        self.pending_reconnect.as_ref()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn buddies(&self) -> &BuddyTable {
        &self.buddies
    }

    pub fn groups(&self) -> &GroupList {
        &self.groups
    }

    pub fn terminated(&self) -> Option<&(String, bool)> {
        self.terminated.as_ref()
    }

    /// Drain and parse everything queued for transmission. Keep-alive blobs
    /// that do not parse as SIP are skipped.
    pub fn take_outgoing(&mut self) -> Vec<SipMessage> {
        let mut out = Vec::new();
        while let Some(bytes) = self.txq.pop_front() {
            let mut buf = bytes::BytesMut::from(&bytes[..]);
            if let Ok(Some(msg)) = super::message::parse_message(&mut buf) {
                out.push(msg);
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // REQUEST / RESPONSE PLUMBING
    // -------------------------------------------------------------------------

    fn enqueue(&mut self, bytes: Vec<u8>) {
        self.last_sent = Instant::now();
        self.txq.push_back(bytes);
    }

    fn snapshot_dialog(&mut self, dialog: DialogRef<'_>) -> Option<DialogSnapshot> {
        let session = self.sessions.get_mut(dialog.session)?;
        let d = session.dialog_mut(dialog.with)?;
        Some(DialogSnapshot {
            callid: d.callid.clone(),
            ourtag: d.ourtag.clone(),
            theirtag: d.theirtag.clone(),
            theirepid: d.theirepid.clone(),
            routes: d.routes.clone(),
            request_uri: d.request_uri.clone(),
            cseq: d.next_cseq(),
        })
    }

    /// Build, sign, queue and track one request. Returns the CSeq token.
    fn send_request(
        &mut self,
        method: &str,
        url: &str,
        to: &str,
        extra_headers: Vec<(String, String)>,
        body: &str,
        dialog: Option<DialogRef<'_>>,
        handler: ResponseHandler,
    ) -> String {
        let snap = dialog.and_then(|d| self.snapshot_dialog(d));
        let in_dialog = snap.is_some();

        let (callid, ourtag, cseq) = match &snap {
            Some(s) => (s.callid.clone(), s.ourtag.clone(), s.cseq),
            None => {
                self.cseq += 1;
                let callid = if method == "REGISTER" {
                    match &self.regcallid {
                        Some(c) => c.clone(),
                        None => {
                            let c = gencallid();
                            self.regcallid = Some(c.clone());
                            c
                        }
                    }
                } else {
                    gencallid()
                };
                (callid, Some(gentag()), self.cseq)
            }
        };

        let mut msg = SipMessage {
            method: method.to_string(),
            target: snap
                .as_ref()
                .and_then(|s| s.request_uri.clone())
                .unwrap_or_else(|| url.to_string()),
            ..Default::default()
        };

        let via = if in_dialog {
            format!(
                "SIP/2.0/{} {}:{}",
                self.kind.descriptor().to_ascii_uppercase(),
                self.local_ip,
                self.local_port
            )
        } else {
            format!(
                "SIP/2.0/{} {}:{};branch={}",
                self.kind.descriptor().to_ascii_uppercase(),
                self.local_ip,
                self.local_port,
                genbranch()
            )
        };
        msg.headers.add("Via", &via);

        let mut from = format!("<sip:{}>", self.cfg.username);
        if let Some(tag) = &ourtag {
            from.push_str(&format!(";tag={}", tag));
        }
        from.push_str(&format!(";epid={}", self.epid));
        msg.headers.add("From", &from);

        let mut to_value = if to.starts_with('<') {
            to.to_string()
        } else {
            format!("<{}>", to)
        };
        if let Some(s) = &snap {
            if let Some(tag) = &s.theirtag {
                to_value.push_str(&format!(";tag={}", tag));
            }
            if let Some(epid) = &s.theirepid {
                to_value.push_str(&format!(";epid={}", epid));
            }
        }
        msg.headers.add("To", &to_value);

        msg.headers.add("Max-Forwards", "70");
        msg.headers.add("CSeq", &format!("{} {}", cseq, method));
        msg.headers.add("User-Agent", &self.cfg.useragent);
        msg.headers.add("Call-ID", &callid);
        if let Some(s) = &snap {
            for route in &s.routes {
                msg.headers.add("Route", &format!("<{}>", route));
            }
        }
        for (name, value) in &extra_headers {
            msg.headers.add(name, value);
        }
        msg.body = body.as_bytes().to_vec();

        self.sign_outgoing(&mut msg);

        let token = format!("{} {}", cseq, method);
        debug!(method, cseq = %token, "sending request");
        self.enqueue(msg.to_bytes());
        self.transactions.insert(msg, handler);
        token
    }

    /// Answer an incoming request, echoing its headers the way the server
    /// expects (Via/From/To/CSeq/Call-ID survive; Contact is ours).
    fn send_response(
        &mut self,
        incoming: &SipMessage,
        code: u16,
        reason: &str,
        remove_headers: &[&str],
        add_headers: Vec<(String, String)>,
        body: Option<&str>,
    ) {
        let mut msg = incoming.clone();
        msg.response = code;
        msg.reason = reason.to_string();
        msg.target = String::new();

        msg.headers.remove("ms-user-data");
        msg.headers.remove("Authentication-Info");
        msg.headers.replace("Contact", &self.contact.clone());
        for name in remove_headers {
            msg.headers.remove(name);
        }
        for (name, value) in &add_headers {
            msg.headers.add(name, value);
        }
        if body.is_none() {
            msg.headers.remove("Content-Type");
        }
        msg.body = body.map(|b| b.as_bytes().to_vec()).unwrap_or_default();

        self.sign_outgoing(&mut msg);
        debug!(code, method = %msg.method, "sending response");
        self.enqueue(msg.to_bytes());
    }

    /// Attach authorization to an outgoing message: a signature once a
    /// security context exists, plus the role-appropriate auth header.
    fn sign_outgoing(&mut self, msg: &mut SipMessage) {
        let mut signature = None;
        if self.registrar.has_context() {
            let realm = self.registrar.realm.clone().unwrap_or_default();
            let target = self.registrar.target.clone().unwrap_or_default();
            let crand = gen_crand();
            self.registrar.num += 1;
            let num = self.registrar.num.to_string();
            let input = signature_input(self.registrar.kind, &crand, &num, &realm, &target, msg);
            if let Some(ctx) = self.registrar.context.as_mut() {
                if let Ok(sig) = ctx.sign(&input) {
                    signature = Some(MessageSignature {
                        signature: sig,
                        rand: crand,
                        num,
                    });
                }
            }
        }

        let method = msg.method.clone();
        let target_uri = if msg.is_request() {
            msg.target.clone()
        } else {
            self.cfg.self_uri()
        };
        let creds = Credentials {
            authdomain: self.cfg.authdomain.as_deref().unwrap_or(""),
            authuser: match &self.cfg.authuser {
                Some(u) if !u.is_empty() => u,
                _ => &self.cfg.username,
            },
            password: &self.cfg.password,
        };

        if method == "REGISTER" {
            if self.registrar.kind != AuthKind::Unset {
                if let Ok(value) = auth_header(
                    &mut self.registrar,
                    &*self.provider,
                    &creds,
                    &method,
                    &target_uri,
                    signature.as_ref(),
                ) {
                    msg.headers.add("Authorization", &value);
                }
            }
        } else if PROXY_AUTH_METHODS.contains(&method.as_str()) {
            self.registrar.nc = 3;
            if self.registrar.kind == AuthKind::Unset {
                self.registrar.kind = AuthKind::Ntlm;
            }
            if let Ok(value) = auth_header(
                &mut self.registrar,
                &*self.provider,
                &creds,
                &method,
                &target_uri,
                signature.as_ref(),
            ) {
                msg.headers.insert(5, "Proxy-Authorization", &value);
            }
        }
    }

    fn send_service(&mut self, body: String, content_type: &str, handler: ResponseHandler) {
        let to = self.cfg.self_uri();
        let headers = vec![
            ("Contact".to_string(), self.contact.clone()),
            ("Content-Type".to_string(), content_type.to_string()),
        ];
        self.send_request("SERVICE", &to, &to, headers, &body, None, handler);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn terminate(&mut self, reason: &str, fatal: bool) {
        if self.terminated.is_none() {
            warn!(reason, fatal, "terminating account");
            self.terminated = Some((reason.to_string(), fatal));
            self.emit(ClientEvent::Terminated {
                reason: reason.to_string(),
                fatal,
            });
        }
    }

    // -------------------------------------------------------------------------
    // REGISTRATION
    // -------------------------------------------------------------------------

    /// Send a REGISTER. `expires` of 0 deregisters.
    pub fn do_register(&mut self, expires: Option<u32>) {
        let contact = registrar::device_contact(
            &self.local_ip,
            self.local_port,
            self.kind,
            &self.device_uuid,
        );
        let headers = registrar::register_headers(&contact, expires);
        let url = format!("sip:{}", self.cfg.sipdomain);
        let to = self.cfg.self_uri();
        if expires == Some(0) {
            self.register_state = RegisterState::Deregistering;
        } else {
            self.register_state = RegisterState::Registering;
        }
        self.send_request("REGISTER", &url, &to, headers, "", None, ResponseHandler::Register);
    }

    fn process_register_response(&mut self, msg: &SipMessage) {
        let expires = msg
            .header("Expires")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);

        match msg.response {
            200 => {
                if expires == 0 {
                    self.register_state = RegisterState::Unregistered;
                    if self.quitting {
                        self.terminate("Signed out", false);
                    }
                    return;
                }
                let newly_registered = self.register_state != RegisterState::Registered;
                self.register_state = RegisterState::Registered;
                self.registrar.retries = 0;

                if !self.reregister_set {
                    self.sched.schedule(
                        ACTION_REGISTER,
                        Duration::from_secs(expires),
                        ScheduledKind::Register,
                    );
                    self.reregister_set = true;
                }

                if let Some(challenge) = self.find_auth_challenge(msg, "WWW-Authenticate") {
                    self.registrar.fill_from_challenge(&challenge);
                }

                if !self.reauthenticate_set {
                    let lead = match (self.registrar.kind, self.registrar.expires) {
                        (AuthKind::Kerberos, Some(exp)) if exp > unix_now() + REAUTH_LEAD_SECS => {
                            exp - unix_now() - REAUTH_LEAD_SECS
                        }
                        _ => NTLM_TOKEN_LIFETIME_SECS - REAUTH_LEAD_SECS,
                    };
                    self.sched.schedule(
                        ACTION_REAUTH,
                        Duration::from_secs(lead),
                        ScheduledKind::Reauthenticate,
                    );
                    self.reauthenticate_set = true;
                }

                let caps = registrar::parse_register_ok(msg, &self.device_uuid);
                self.contact = match &caps.gruu {
                    Some(gruu) => format!("<{}>", gruu),
                    None => format!(
                        "<sip:{}:{};maddr={};transport={}>;proxy=replace",
                        self.cfg.username,
                        self.local_port,
                        self.local_ip,
                        self.kind.descriptor()
                    ),
                };
                if let Some(timeout) = caps.keepalive_timeout {
                    self.sched.schedule_repeating(
                        ACTION_KEEPALIVE,
                        Duration::from_secs(timeout),
                        ScheduledKind::KeepAlive,
                    );
                }
                info!(
                    expires,
                    msrtc = caps.msrtc_event_categories,
                    batched = caps.batched_support,
                    gruu = caps.gruu.is_some(),
                    "registered"
                );
                self.caps = caps;

                if newly_registered {
                    self.emit(ClientEvent::Registered);
                }

                if !self.subscribed {
                    self.subscribe_to_advertised_events();
                    self.send_presence_status();
                    self.subscribed = true;
                }
            }
            301 => {
                if let Some(redirect) = registrar::parse_redirect(msg) {
                    info!(host = %redirect.host, "registration redirected");
                    self.pending_reconnect = Some(redirect);
                } else {
                    self.terminate("Invalid redirect", true);
                }
            }
            401 => {
                debug!(retries = self.registrar.retries, "REGISTER challenged");
                if self.registrar.retries > REGISTER_AUTH_RETRIES {
                    self.terminate("Wrong Password", true);
                    return;
                }
                if let Some(challenge) = self.find_auth_challenge(msg, "WWW-Authenticate") {
                    self.registrar.fill_from_challenge(&challenge);
                }
                self.do_register(if self.quitting { Some(0) } else { None });
                if !self.quitting {
                    self.register_state = RegisterState::Authenticating;
                }
            }
            403 => {
                let reason = registrar::warning_reason(msg)
                    .map(|r| format!("You have been rejected by the server: {}", r))
                    .unwrap_or_else(|| "You have been rejected by the server".to_string());
                self.terminate(&reason, true);
            }
            404 => {
                let reason = registrar::diagnostics_reason(msg)
                    .map(|r| format!("Not Found: {}", r))
                    .unwrap_or_else(|| {
                        "Not Found: destination URI not enabled for SIP".to_string()
                    });
                self.terminate(&reason, true);
            }
            503 => {
                let reason = registrar::diagnostics_reason(msg)
                    .map(|r| format!("Service unavailable: {}", r))
                    .unwrap_or_else(|| "Service unavailable: no reason given".to_string());
                self.terminate(&reason, true);
            }
            _ => {
                debug!(code = msg.response, "unhandled REGISTER response");
            }
        }
    }

    /// Pick the challenge instance matching our scheme out of possibly
    /// several `WWW-Authenticate` / `Proxy-Authenticate` headers.
    fn find_auth_challenge(&self, msg: &SipMessage, header: &str) -> Option<String> {
        let preferred = match self.registrar.kind {
            AuthKind::Kerberos => "Kerberos",
            AuthKind::Digest => "Digest",
            _ => "NTLM",
        };
        msg.headers
            .all(header)
            .find(|v| v.len() >= preferred.len() && v[..preferred.len()].eq_ignore_ascii_case(preferred))
            .map(|v| v.to_string())
            .or_else(|| msg.headers.get(header).map(|v| v.to_string()))
    }

    fn subscribe_to_advertised_events(&mut self) {
        let events: Vec<String> = self.caps.allow_events.clone();
        let has = |name: &str| events.iter().any(|e| e.eq_ignore_ascii_case(name));

        if has("vnd-microsoft-roaming-contacts") {
            let parts = subscribe::roaming_contacts(&self.contact.clone());
            self.send_subscribe(parts, None);
        }
        if has("vnd-microsoft-roaming-ACL") {
            let parts = subscribe::roaming_acl(&self.contact.clone());
            self.send_subscribe(parts, None);
        }
        if has("vnd-microsoft-roaming-self") {
            let parts = subscribe::roaming_self(&self.contact.clone());
            self.send_subscribe(parts, None);
        }
        if has("vnd-microsoft-provisioning-v2") {
            let parts = subscribe::provisioning(&self.contact.clone(), true);
            self.send_subscribe(parts, None);
        } else if has("vnd-microsoft-provisioning") {
            let parts = subscribe::provisioning(&self.contact.clone(), false);
            self.send_subscribe(parts, None);
        }
        if has("presence.wpending") {
            let parts = subscribe::wpending(&self.contact.clone());
            self.send_subscribe(parts, None);
        }
    }

    /// SUBSCRIBE to self (the default) or to an explicit target such as a
    /// pool host or a single contact.
    fn send_subscribe(&mut self, parts: subscribe::SubscribeParts, to: Option<String>) {
        let to = to.unwrap_or_else(|| self.cfg.self_uri());
        self.send_request(
            "SUBSCRIBE",
            &to,
            &to,
            parts.headers,
            &parts.body,
            None,
            ResponseHandler::Subscribe,
        );
    }

    // -------------------------------------------------------------------------
    // INCOMING DISPATCH
    // -------------------------------------------------------------------------

    /// Process one incoming message. This is the single entry point for the
    /// wire reader, piggybacked bodies and tests alike.
    pub fn handle_message(&mut self, msg: SipMessage) {
        if self.terminated.is_some() {
            return;
        }

        // Once signing is established every incoming message must carry a
        // valid server signature; a mismatch means the stream cannot be
        // trusted anymore.
        if self.registrar.has_context() {
            if let Some(info) = msg.header("Authentication-Info").and_then(parse_auth_info) {
                let realm = self.registrar.realm.clone().unwrap_or_default();
                let target = self.registrar.target.clone().unwrap_or_default();
                let input = signature_input(
                    self.registrar.kind,
                    &info.srand,
                    &info.snum,
                    &realm,
                    &target,
                    &msg,
                );
                let valid = self
                    .registrar
                    .context
                    .as_ref()
                    .map(|ctx| ctx.verify(&input, &info.rspauth).unwrap_or(false))
                    .unwrap_or(false);
                if !valid {
                    self.terminate("Invalid message signature received", true);
                    self.wire = None;
                    return;
                }
            } else if msg.response == 401 {
                self.terminate("Wrong Password", true);
                return;
            }
        }

        if msg.is_request() {
            self.dispatch_request(msg);
        } else {
            self.dispatch_response(msg);
        }
    }

    fn dispatch_request(&mut self, msg: SipMessage) {
        match msg.method.as_str() {
            "MESSAGE" => self.process_incoming_message(&msg),
            "NOTIFY" => self.process_incoming_notify(&msg, true, false),
            "BENOTIFY" => self.process_incoming_notify(&msg, true, true),
            "INVITE" => self.process_incoming_invite(&msg),
            "OPTIONS" => self.process_incoming_options(&msg),
            "INFO" => self.process_incoming_info(&msg),
            "BYE" => self.process_incoming_bye(&msg),
            "ACK" => {}
            "SUBSCRIBE" => {
                // LCS 2005 subscribes back to us; acknowledge and move on.
                self.send_response(&msg, 200, "OK", &[], Vec::new(), None);
            }
            other => {
                debug!(method = other, "unsupported request method");
                self.send_response(&msg, 501, "Not implemented", &[], Vec::new(), None);
            }
        }
    }

    fn dispatch_response(&mut self, msg: SipMessage) {
        let Some(trans) = self.transactions.match_response(&msg) else {
            debug!(cseq = ?msg.cseq_token(), "response to unknown transaction");
            return;
        };
        let token = trans.cseq_token.clone();
        let handler = trans.handler.clone();
        let is_register = trans.msg.method == "REGISTER";

        if msg.response == 407 {
            self.proxy.retries += 1;
            if self.proxy.retries > PROXY_AUTH_RETRIES {
                self.terminate("Authentication with the proxy failed", true);
                return;
            }
            if let Some(challenge) = msg.header("Proxy-Authenticate").map(|v| v.to_string()) {
                self.proxy.fill_from_challenge(&challenge);
            }
            self.resend_with_proxy_auth(&token, false);
            return;
        }

        if msg.response / 100 == 1 {
            debug!(code = msg.response, "provisional response");
            return;
        }
        self.proxy.retries = 0;

        if is_register {
            if msg.response == 401 {
                self.registrar.retries += 1;
            } else {
                self.registrar.retries = 0;
            }
        } else if msg.response == 401 {
            // Re-credential against the registrar state and resend with the
            // original CSeq.
            if self.registrar.retries > REGISTER_AUTH_RETRIES {
                return;
            }
            self.registrar.retries += 1;
            if let Some(challenge) = self.find_auth_challenge(&msg, "WWW-Authenticate") {
                self.registrar.fill_from_challenge(&challenge);
            }
            self.resend_with_proxy_auth(&token, true);
            return;
        }

        match handler {
            ResponseHandler::Register => self.process_register_response(&msg),
            ResponseHandler::Subscribe => {
                if msg.header("ms-piggyback-cseq").is_some() {
                    self.process_incoming_notify(&msg, false, false);
                }
            }
            ResponseHandler::Invite => self.process_invite_response(&msg),
            ResponseHandler::Message => self.process_message_response(&msg),
            ResponseHandler::Options | ResponseHandler::Service | ResponseHandler::None => {}
            ResponseHandler::AddGroup {
                group_name,
                buddy_uri,
            } => self.process_add_group_response(&msg, &group_name, &buddy_uri),
            ResponseHandler::PresencePublish => {
                if msg.response == 409 {
                    // Server holds newer publication versions; wipe and retry.
                    let body = presence::clear_presence_body(&self.cfg.self_uri());
                    self.send_service(
                        body,
                        "application/msrtc-category-publish+xml",
                        ResponseHandler::ClearPresence,
                    );
                }
            }
            ResponseHandler::ClearPresence => {
                if msg.response == 200 {
                    self.status_version = 0;
                    self.send_presence_status();
                }
            }
            ResponseHandler::DirectorySearch => {
                if msg.response == 200 {
                    let rows = subscribe::parse_search_results(msg.body_str());
                    self.emit(ClientEvent::SearchResults { rows });
                }
            }
        }

        self.transactions.remove(&token);
    }

    /// Resend a stored request with a fresh `Proxy-Authorization`. The CSeq
    /// is untouched: this is a resend, not a new request.
    fn resend_with_proxy_auth(&mut self, token: &str, use_registrar: bool) {
        let creds_user = match &self.cfg.authuser {
            Some(u) if !u.is_empty() => u.clone(),
            _ => self.cfg.username.clone(),
        };
        let authdomain = self.cfg.authdomain.clone().unwrap_or_default();
        let password = self.cfg.password.clone();

        let Some(trans) = self.transactions.get_mut(token) else {
            return;
        };
        let method = trans.msg.method.clone();
        let target = trans.msg.target.clone();

        let creds = Credentials {
            authdomain: &authdomain,
            authuser: &creds_user,
            password: &password,
        };
        let state = if use_registrar {
            &mut self.registrar
        } else {
            &mut self.proxy
        };
        let value = match auth_header(state, &*self.provider, &creds, &method, &target, None) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot build authorization for resend");
                return;
            }
        };
        trans.msg.headers.remove("Proxy-Authorization");
        trans.msg.headers.insert(5, "Proxy-Authorization", &value);
        let bytes = trans.msg.to_bytes();
        debug!(cseq = token, "re-credentialed resend");
        self.enqueue(bytes);
    }

    // -------------------------------------------------------------------------
    // NOTIFY / BENOTIFY DISPATCH
    // -------------------------------------------------------------------------

    /// Route subscription payloads, whether they arrived as NOTIFY/BENOTIFY
    /// requests or piggybacked in a SUBSCRIBE 200 OK (`request == false`).
    pub fn process_incoming_notify(&mut self, msg: &SipMessage, request: bool, benotify: bool) {
        let event = msg.header("Event").unwrap_or("").to_string();
        let subscription_state = msg.header("subscription-state").map(|v| v.to_string());

        // Refresh interval comes from the SUBSCRIBE response carrying the
        // (piggybacked) first notify.
        let mut timeout: u64 = 0;
        if !request {
            let expires = msg
                .header("Expires")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0);
            timeout = if expires > 2 * SUBSCRIBE_REFRESH_LEAD_SECS {
                expires - SUBSCRIBE_REFRESH_LEAD_SECS
            } else {
                expires
            };
        }

        let active = subscription_state
            .as_deref()
            .map(|s| s.contains("active"))
            .unwrap_or(true);
        if active {
            if event.eq_ignore_ascii_case("presence") {
                self.process_presence_notify(msg);
            } else if event.eq_ignore_ascii_case("vnd-microsoft-roaming-contacts") {
                self.process_roaming_contacts(msg);
            } else if event.eq_ignore_ascii_case("vnd-microsoft-roaming-self") {
                self.process_roaming_self(msg);
            } else if event.eq_ignore_ascii_case("vnd-microsoft-roaming-ACL") {
                if let Some(delta) = subscribe::parse_acl_delta(msg.body_str()) {
                    self.acl_delta = delta;
                }
            } else if event.eq_ignore_ascii_case("presence.wpending") {
                self.process_wpending(msg);
            } else if !event.eq_ignore_ascii_case("registration-notify") {
                debug!(event = %event, "notify for unsupported event");
            }
        }

        if timeout > 0 && !event.is_empty() {
            self.schedule_subscription_refresh(msg, &event, timeout, request);
        }

        if event.eq_ignore_ascii_case("registration-notify") {
            self.process_registration_notify(msg);
        }

        if request && !benotify {
            self.send_response(
                msg,
                200,
                "OK",
                &["Expires", "subscription-state", "Event", "Require"],
                Vec::new(),
                None,
            );
        }
    }

    fn schedule_subscription_refresh(
        &mut self,
        msg: &SipMessage,
        event: &str,
        timeout: u64,
        request: bool,
    ) {
        if event.eq_ignore_ascii_case("presence.wpending") && self.caps.allows_event("presence.wpending")
        {
            self.sched.schedule(
                ACTION_WPENDING,
                Duration::from_secs(timeout),
                ScheduledKind::SubscribeWpending,
            );
        } else if event.eq_ignore_ascii_case("presence") && self.caps.allows_event("presence") {
            let who = if request {
                from_uri_of(msg)
            } else {
                to_uri_of(msg)
            }
            .unwrap_or_default();
            if who.is_empty() {
                return;
            }

            if self.caps.batched_support {
                if canonical_key(&who) == canonical_key(&self.cfg.self_uri()) {
                    self.sched.schedule(
                        ACTION_PRESENCE_BATCHED,
                        Duration::from_secs(timeout),
                        ScheduledKind::SubscribePresenceBatched,
                    );
                } else {
                    self.schedule_presence_refresh_routed(msg, who, timeout);
                }
            } else {
                self.sched.schedule(
                    &presence_action_name(&who),
                    Duration::from_secs(timeout),
                    ScheduledKind::SubscribePresenceSingle { uri: who },
                );
            }
        }
    }

    /// A batched routed subscription refreshes as one request to the pool
    /// host listing every contact from the multipart body.
    fn schedule_presence_refresh_routed(&mut self, msg: &SipMessage, who: String, timeout: u64) {
        let ctype = msg.header("Content-Type").unwrap_or("").to_string();
        if ctype.contains("multipart") {
            let mut buddies = Vec::new();
            for (_, part_body) in presence::split_multipart(&ctype, msg.body_str()) {
                if let Some(uri) = presence::root_uri(&part_body) {
                    buddies.push(with_sip_prefix(&uri));
                }
            }
            if !buddies.is_empty() {
                self.sched.schedule(
                    &presence_action_name(&who),
                    Duration::from_secs(timeout),
                    ScheduledKind::SubscribePresenceRouted { host: who, buddies },
                );
                return;
            }
        }
        self.sched.schedule(
            &presence_action_name(&who),
            Duration::from_secs(timeout),
            ScheduledKind::SubscribePresenceSingle { uri: who },
        );
    }

    fn process_presence_notify(&mut self, msg: &SipMessage) {
        let ctype = msg.header("Content-Type").unwrap_or("").to_string();
        let doc = presence::process_presence_document(
            &ctype,
            msg.body_str(),
            self.caps.msrtc_event_categories,
        );

        for update in doc.updates {
            self.apply_presence_update(update);
        }

        if !doc.resubscribe.is_empty() {
            // Group resubscriptions sharing a pool into one routed request.
            let mut pools: HashMap<String, Vec<String>> = HashMap::new();
            for entry in doc.resubscribe {
                if let Some(buddy) = self.buddies.get_mut(&entry.uri) {
                    buddy.resubscribed = true;
                }
                match entry.pool_fqdn {
                    Some(pool) => pools.entry(pool).or_default().push(entry.uri),
                    None => self.subscribe_presence_single(entry.uri),
                }
            }
            for (host, buddies) in pools {
                self.subscribe_presence_routed(host, buddies);
            }
        }
    }

    fn apply_presence_update(&mut self, update: presence::PresenceUpdate) {
        let uri = update.uri.clone();
        if let Some(buddy) = self.buddies.get_mut(&uri) {
            buddy.annotation = update.note.clone();
            if update.device_name.is_some() {
                buddy.device_name = update.device_name.clone();
            }
        }
        if let Some(name) = &update.display_name {
            let needs_alias = self
                .buddies
                .get(&uri)
                .map(|b| b.display_name.is_none())
                .unwrap_or(false);
            if needs_alias {
                if let Some(buddy) = self.buddies.get_mut(&uri) {
                    buddy.display_name = Some(name.clone());
                }
                self.emit(ClientEvent::AliasUpdate {
                    uri: uri.clone(),
                    display_name: name.clone(),
                });
            }
        }
        if let Some(activity) = update.activity {
            self.emit(ClientEvent::BuddyStatus {
                uri,
                activity,
                note: update.note,
                device_name: update.device_name,
            });
        }
    }

    fn process_roaming_contacts(&mut self, msg: &SipMessage) {
        let Some(list) = subscribe::parse_roaming_contacts(msg.body_str()) else {
            return;
        };
        if let Some(delta) = list.delta {
            self.contacts_delta = delta;
        }

        for (id, name) in &list.groups {
            let name = if name.starts_with('~') {
                OTHER_CONTACTS.to_string()
            } else {
                name.clone()
            };
            if self.groups.find_by_id(*id).is_none() {
                self.groups.add(Group {
                    id: *id,
                    name: name.clone(),
                });
                self.emit(ClientEvent::GroupAdded { id: *id, name });
            }
        }
        if self.groups.is_empty() {
            self.groups.add(Group {
                id: 1,
                name: OTHER_CONTACTS.to_string(),
            });
            self.emit(ClientEvent::GroupAdded {
                id: 1,
                name: OTHER_CONTACTS.to_string(),
            });
        }

        let mut server_keys = HashSet::new();
        for contact in &list.contacts {
            let uri = with_sip_prefix(&contact.uri);
            server_keys.insert(canonical_key(&uri));

            let group_ids = if contact.group_ids.is_empty() {
                let fallback = self
                    .groups
                    .find_by_name(OTHER_CONTACTS)
                    .or_else(|| self.groups.first())
                    .map(|g| g.id)
                    .unwrap_or(1);
                vec![fallback]
            } else {
                contact
                    .group_ids
                    .iter()
                    .map(|id| {
                        self.groups
                            .find_by_id(*id)
                            .or_else(|| self.groups.first())
                            .map(|g| g.id)
                            .unwrap_or(1)
                    })
                    .collect()
            };

            let buddy = self.buddies.entry(&uri);
            for id in group_ids {
                buddy.add_group(id);
            }
            if let Some(name) = &contact.name {
                if buddy.display_name.is_none() {
                    buddy.display_name = Some(name.clone());
                    self.emit(ClientEvent::AliasUpdate {
                        uri: uri.clone(),
                        display_name: name.clone(),
                    });
                }
            }
        }

        // Reconcile: local entries absent from the server list are stale.
        for uri in self.buddies.retain_keys(&server_keys) {
            self.sched.cancel(&presence_action_name(&uri));
            self.emit(ClientEvent::BuddyRemoved { uri });
        }
        self.emit(ClientEvent::RosterUpdated);

        if !self.subscribed_buddies {
            self.subscribed_buddies = true;
            if self.caps.batched_support {
                self.subscribe_presence_batched();
            } else {
                // Spread single subscriptions so large rosters do not burst.
                let count = self.buddies.len().max(1);
                let range_ms = (count * 1000 / SUBSCRIBE_RATE_PER_SEC).max(1) as u64;
                let uris = self.buddies.uris();
                for uri in uris {
                    let delay = rand::thread_rng().gen_range(0..range_ms);
                    self.sched.schedule(
                        &presence_action_name(&uri),
                        Duration::from_millis(delay),
                        ScheduledKind::SubscribePresenceSingle { uri },
                    );
                }
            }
        }
    }

    fn process_roaming_self(&mut self, msg: &SipMessage) {
        for subscriber in subscribe::parse_roaming_self(msg.body_str()) {
            let uri = with_sip_prefix(&subscriber.user);
            if let Some(name) = &subscriber.display_name {
                if let Some(buddy) = self.buddies.get_mut(&uri) {
                    if buddy.display_name.is_none() {
                        buddy.display_name = Some(name.clone());
                        self.emit(ClientEvent::AliasUpdate {
                            uri: uri.clone(),
                            display_name: name.clone(),
                        });
                    }
                }
            }
            if !subscriber.acknowledged {
                debug!(user = %subscriber.user, "acknowledging new subscriber");
                let body = soap::set_subscribers(&subscriber.user);
                self.send_service(
                    body,
                    "application/msrtc-presence-setsubscriber+xml",
                    ResponseHandler::Service,
                );
            }
        }
    }

    fn process_wpending(&mut self, msg: &SipMessage) {
        if msg.response != 0 && msg.response != 200 {
            return;
        }
        if msg.body.is_empty() {
            return;
        }
        for watcher in subscribe::parse_wpending(msg.body_str()) {
            let on_list = self.buddies.contains(&watcher.uri);
            self.emit(ClientEvent::AuthorizationRequested {
                uri: watcher.uri,
                display_name: watcher.display_name,
                on_list,
            });
        }
    }

    fn process_registration_notify(&mut self, msg: &SipMessage) {
        let ctype = msg.header("Content-Type").unwrap_or("");
        if !ctype
            .to_ascii_lowercase()
            .starts_with("text/registration-event")
        {
            return;
        }
        let reason = registrar::diagnostics_reason(msg).unwrap_or_else(|| {
            let event = subscribe::parse_dereg_event(msg.body_str()).unwrap_or_default();
            subscribe::dereg_reason_for_event(&event).to_string()
        });
        self.terminate(&format!("Unregistered by server: {}", reason), true);
    }

    // -------------------------------------------------------------------------
    // PRESENCE SUBSCRIPTIONS AND PUBLICATION
    // -------------------------------------------------------------------------

    fn subscribe_presence_batched(&mut self) {
        let resources: Vec<subscribe::Resource> = self
            .buddies
            .iter()
            .filter(|b| !(self.caps.msrtc_event_categories && b.resubscribed))
            .map(|b| subscribe::Resource {
                uri: b.uri.clone(),
                with_context: self.caps.msrtc_event_categories,
            })
            .collect();
        let parts = subscribe::presence_batched(
            &self.contact.clone(),
            &self.cfg.self_uri(),
            &resources,
            self.caps.msrtc_event_categories,
        );
        self.send_subscribe(parts, None);
    }

    fn subscribe_presence_routed(&mut self, host: String, buddies: Vec<String>) {
        let resources: Vec<subscribe::Resource> = buddies
            .into_iter()
            .map(|uri| subscribe::Resource {
                uri,
                with_context: false,
            })
            .collect();
        let parts = subscribe::presence_batched(
            &self.contact.clone(),
            &self.cfg.self_uri(),
            &resources,
            self.caps.msrtc_event_categories,
        );
        self.send_subscribe(parts, Some(with_sip_prefix(&host)));
    }

    fn subscribe_presence_single(&mut self, uri: String) {
        let to = with_sip_prefix(&uri);
        let parts = subscribe::presence_single(
            &self.contact.clone(),
            &self.cfg.self_uri(),
            &to,
            self.caps.msrtc_event_categories,
        );
        self.send_subscribe(parts, Some(to));
    }

    fn send_presence_status(&mut self) {
        if self.caps.msrtc_event_categories {
            let body = presence::category_publish_body(
                &self.cfg.self_uri(),
                self.status_version,
                self.status.publish_code(),
                self.note.as_deref().unwrap_or(""),
            );
            self.status_version += 1;
            self.send_service(
                body,
                "application/msrtc-category-publish+xml",
                ResponseHandler::PresencePublish,
            );
        } else {
            let (availability, activity) = self.status.soap_codes();
            let name = format!("sip: {}", self.cfg.self_uri());
            let body = soap::set_presence(
                &name,
                availability,
                activity,
                self.note.as_deref().unwrap_or(""),
            );
            self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
        }
    }

    // -------------------------------------------------------------------------
    // INSTANT MESSAGING
    // -------------------------------------------------------------------------

    /// Queue a 1:1 message, opening a dialog with an INVITE when none exists.
    pub fn send_im(&mut self, who: &str, text: &str) {
        let who = with_sip_prefix(who);
        let idx = self
            .sessions
            .find_im(&who)
            .unwrap_or_else(|| self.sessions.create_im(&who));

        let (has_dialog, invite_pending) = {
            let session = self.sessions.get_mut(idx).expect("session just created");
            session.queue.push_back(text.to_string());
            match session.dialog(&who) {
                Some(d) => (d.established, d.outgoing_invite.is_some()),
                None => (false, false),
            }
        };

        if has_dialog {
            self.im_process_queue(idx);
        } else if !invite_pending {
            self.send_invite(idx, &who, Some(text), false);
        }
    }

    pub fn send_chat(&mut self, chat_id: u32, text: &str) {
        if let Some(idx) = self.sessions.find_chat_by_id(chat_id) {
            if let Some(session) = self.sessions.get_mut(idx) {
                session.queue.push_back(text.to_string());
            }
            self.im_process_queue(idx);
        }
    }

    fn send_invite(&mut self, idx: usize, who: &str, first_message: Option<&str>, triggered: bool) {
        let mut headers: Vec<(String, String)> = Vec::new();

        {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            if session.dialog(who).map(|d| d.established).unwrap_or(false) {
                debug!(%who, "dialog already established");
                return;
            }
            if session.dialog(who).is_none() {
                let callid = session
                    .callid
                    .clone()
                    .unwrap_or_else(gencallid);
                session.callid = Some(callid.clone());
                session.dialogs.push(Dialog::new(&callid, who));
            }
            let d = session
                .dialog_mut(who)
                .expect("dialog just ensured");
            if d.ourtag.is_none() {
                d.ourtag = Some(gentag());
            }
            if let Some(text) = first_message {
                let key = invite_key(&d.callid, d.cseq + 1);
                session.unconfirmed.insert(key, text.to_string());
            }
        }

        if triggered {
            headers.push(("TriggeredInvite".into(), "TRUE".into()));
            headers.push(("Require".into(), "com.microsoft.rtc-multiparty".into()));
        }
        headers.push(("Contact".into(), self.contact.clone()));
        if let Some(text) = first_message {
            headers.push(("ms-text-format".into(), im::ms_text_format_value(text)));
        }
        headers.push(("Content-Type".into(), "application/sdp".into()));

        let body = im::invite_sdp(&self.local_ip, self.local_port);
        let to = who.to_string();
        let token = self.send_request(
            "INVITE",
            &to,
            &to,
            headers,
            &body,
            Some(DialogRef {
                session: idx,
                with: who,
            }),
            ResponseHandler::Invite,
        );
        if let Some(session) = self.sessions.get_mut(idx) {
            if let Some(d) = session.dialog_mut(who) {
                d.outgoing_invite = Some(token);
            }
        }
    }

    fn process_invite_response(&mut self, msg: &SipMessage) {
        let Some(with) = to_uri_of(msg) else {
            return;
        };
        let callid = msg.header("Call-ID").unwrap_or("").to_string();
        let Some(idx) = self.sessions.find_for_incoming(&callid, &with) else {
            debug!(%with, "INVITE response without session");
            return;
        };

        let cseq = msg.cseq_number().unwrap_or(0);

        if msg.response != 200 {
            let text = self.sessions.get(idx).and_then(|session| {
                let key = invite_key(
                    session
                        .dialog(&with)
                        .map(|d| d.callid.as_str())
                        .unwrap_or(callid.as_str()),
                    cseq,
                );
                session.unconfirmed.get(&key).cloned()
            });
            warn!(code = msg.response, %with, "INVITE failed");
            self.emit(ClientEvent::ImUndelivered {
                with: with.clone(),
                text: text.unwrap_or_default(),
            });
            self.destroy_session(idx);
            return;
        }

        let chat_event = {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            let multiparty = session.multiparty;
            let chat_id = session.chat_id;
            let Some(d) = session.dialog_mut(&with) else {
                return;
            };
            d.update_from_message(msg, true);
            // ACK reuses the INVITE's dialog numbering from zero.
            d.cseq = 0;
            d.outgoing_invite = None;
            d.established = true;
            let key = invite_key(&d.callid, cseq);
            if d.supports("ms-text-format") {
                // The first message rode the INVITE; no MESSAGE needed.
                session.queue.pop_front();
            }
            session.unconfirmed.remove(&key);
            multiparty.then_some(ClientEvent::ChatUserJoined {
                chat_id,
                uri: with.clone(),
            })
        };
        if let Some(event) = chat_event {
            self.emit(event);
        }

        self.send_request(
            "ACK",
            &with,
            &with,
            Vec::new(),
            "",
            Some(DialogRef {
                session: idx,
                with: &with,
            }),
            ResponseHandler::None,
        );
        self.im_process_queue(idx);
    }

    /// Drain the queue into MESSAGEs, one per established dialog.
    fn im_process_queue(&mut self, idx: usize) {
        loop {
            let Some(text) = self
                .sessions
                .get_mut(idx)
                .and_then(|s| s.queue.pop_front())
            else {
                break;
            };

            let withs: Vec<String> = match self.sessions.get(idx) {
                Some(session) => session
                    .dialogs
                    .iter()
                    .filter(|d| d.outgoing_invite.is_none())
                    .map(|d| d.with.clone())
                    .collect(),
                None => break,
            };

            for with in withs {
                {
                    let Some(session) = self.sessions.get_mut(idx) else {
                        return;
                    };
                    let Some(d) = session.dialog(&with) else {
                        continue;
                    };
                    let key = message_key(&d.callid, d.cseq + 1, &with);
                    session.unconfirmed.insert(key, text.clone());
                }
                let headers = vec![
                    ("Contact".to_string(), self.contact.clone()),
                    (
                        "Content-Type".to_string(),
                        "text/plain; charset=UTF-8".to_string(),
                    ),
                ];
                self.send_request(
                    "MESSAGE",
                    &with,
                    &with,
                    headers,
                    &text,
                    Some(DialogRef {
                        session: idx,
                        with: &with,
                    }),
                    ResponseHandler::Message,
                );
            }
        }
    }

    fn process_message_response(&mut self, msg: &SipMessage) {
        let Some(with) = to_uri_of(msg) else {
            return;
        };
        let callid = msg.header("Call-ID").unwrap_or("").to_string();
        let Some(idx) = self.sessions.find_for_incoming(&callid, &with) else {
            return;
        };
        let cseq = msg.cseq_number().unwrap_or(0);
        let key = message_key(&callid, cseq, &with);

        if msg.response == 200 {
            if let Some(session) = self.sessions.get_mut(idx) {
                session.unconfirmed.remove(&key);
            }
            self.im_process_queue(idx);
        } else {
            let text = self
                .sessions
                .get(idx)
                .and_then(|s| s.unconfirmed.get(&key).cloned())
                .unwrap_or_default();
            warn!(code = msg.response, %with, "MESSAGE undelivered");
            self.emit(ClientEvent::ImUndelivered { with, text });
            self.destroy_session(idx);
        }
    }

    fn process_incoming_invite(&mut self, msg: &SipMessage) {
        // Only text invitations are served.
        if !msg.body.is_empty() && !im::offers_message_medium(msg.body_str()) {
            self.send_response(msg, 501, "Not implemented", &[], Vec::new(), None);
            return;
        }

        let Some(from) = from_uri_of(msg) else {
            return;
        };
        let to = to_uri_of(msg).unwrap_or_default();
        let callid = msg.header("Call-ID").unwrap_or("").to_string();

        // The response (and our dialog) needs a local tag on To.
        let newtag = gentag();
        let mut tagged = msg.clone();
        if let Some(to_hdr) = msg.header("To") {
            if find_tag(to_hdr).is_none() {
                let tagged_to = format!("{};tag={}", to_hdr, newtag);
                tagged.headers.replace("To", &tagged_to);
            }
        }

        let endpoints = msg
            .header("EndPoints")
            .map(im::parse_endpoints)
            .unwrap_or_default();
        let triggered = msg
            .header("TriggeredInvite")
            .map(|v| v.eq_ignore_ascii_case("TRUE"))
            .unwrap_or(false);
        let is_multiparty = endpoints.len() >= 3 || triggered;

        let mut idx = self.sessions.find_chat(&callid);
        let mut was_multiparty = true;
        if let Some(i) = idx {
            if is_multiparty {
                if let Some(session) = self.sessions.get_mut(i) {
                    if !session.multiparty {
                        was_multiparty = false;
                        session.upgrade_to_chat();
                    }
                }
            }
        }
        if idx.is_none() {
            idx = self.sessions.find_im(&from);
            if let Some(i) = idx {
                if is_multiparty {
                    was_multiparty = false;
                    if let Some(session) = self.sessions.get_mut(i) {
                        session.upgrade_to_chat();
                    }
                }
            }
        }
        let idx = match idx {
            Some(i) => i,
            None => {
                if is_multiparty {
                    was_multiparty = false;
                    self.sessions.create_chat(&callid)
                } else {
                    self.sessions.create_im(&from)
                }
            }
        };

        let roster_manager = msg.header("Roster-Manager").map(|v| v.to_string());
        {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            if session.callid.is_none() {
                session.callid = Some(callid.clone());
            }
            if let Some(rm) = roster_manager {
                session.roster_manager = Some(rm);
            }
        }

        // Fan out triggered INVITEs to endpoints that are neither us nor the
        // inviter.
        if is_multiparty {
            let mut to_invite = Vec::new();
            {
                let Some(session) = self.sessions.get_mut(idx) else {
                    return;
                };
                for (endpoint, epid) in &endpoints {
                    if canonical_key(endpoint) == canonical_key(&from)
                        || canonical_key(endpoint) == canonical_key(&to)
                    {
                        continue;
                    }
                    match session.dialog_mut(endpoint) {
                        Some(d) => d.theirepid = epid.clone(),
                        None => {
                            let mut d = Dialog::new(&callid, endpoint);
                            d.theirepid = epid.clone();
                            session.dialogs.push(d);
                            to_invite.push(endpoint.clone());
                        }
                    }
                }
            }
            for endpoint in to_invite {
                self.send_invite(idx, &endpoint, None, true);
            }
        }

        // Dialog with the inviter.
        {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            if session.dialog(&from).is_none() {
                let mut d = Dialog::new(&callid, &from);
                d.update_from_message(&tagged, false);
                if d.ourtag.is_none() {
                    d.ourtag = Some(newtag.clone());
                }
                d.established = true;
                session.dialogs.push(d);
            }
        }

        // Host-side chat bookkeeping.
        let mut events = Vec::new();
        {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            if session.multiparty && !session.chat_opened {
                session.chat_opened = true;
                events.push(ClientEvent::ChatOpened {
                    chat_id: session.chat_id,
                });
            }
            if session.multiparty && !was_multiparty {
                for d in &session.dialogs {
                    if canonical_key(&d.with) != canonical_key(&from) {
                        events.push(ClientEvent::ChatUserJoined {
                            chat_id: session.chat_id,
                            uri: d.with.clone(),
                        });
                    }
                }
            }
            if session.multiparty {
                events.push(ClientEvent::ChatUserJoined {
                    chat_id: session.chat_id,
                    uri: from.clone(),
                });
            }
        }
        for event in events {
            self.emit(event);
        }

        // First message riding the INVITE itself.
        let mut accepts_text_format = false;
        if let Some(value) = msg.header("ms-text-format") {
            if let Some(text) = im::parse_ms_text_format(value) {
                accepts_text_format = true;
                let chat_id = self
                    .sessions
                    .get(idx)
                    .filter(|s| s.multiparty)
                    .map(|s| s.chat_id);
                self.emit(ClientEvent::ImReceived {
                    from: from.clone(),
                    text,
                    chat_id,
                });
            }
        }

        let mut add = vec![
            ("User-Agent".to_string(), self.cfg.useragent.clone()),
            (
                "Supported".to_string(),
                "com.microsoft.rtc-multiparty".to_string(),
            ),
        ];
        if accepts_text_format {
            add.push(("Supported".to_string(), "ms-text-format".to_string()));
        }
        let body = im::answer_sdp(&self.local_ip, self.local_port, &self.cfg.username);
        self.send_response(
            &tagged,
            200,
            "OK",
            &[
                "Ms-Conversation-ID",
                "Ms-Text-Format",
                "EndPoints",
                "User-Agent",
                "Roster-Manager",
                "P-Asserted-Identity",
                "Require",
            ],
            add,
            Some(&body),
        );
    }

    fn process_incoming_message(&mut self, msg: &SipMessage) {
        let Some(from) = from_uri_of(msg) else {
            return;
        };
        let ctype = msg.header("Content-Type").unwrap_or("").to_ascii_lowercase();
        let callid = msg.header("Call-ID").unwrap_or("").to_string();

        if ctype.starts_with("text/plain") || ctype.starts_with("text/html") {
            let idx = self
                .sessions
                .find_for_incoming(&callid, &from)
                .unwrap_or_else(|| {
                    let i = self.sessions.create_im(&from);
                    if let Some(s) = self.sessions.get_mut(i) {
                        s.callid = Some(callid.clone());
                    }
                    i
                });
            let chat_id = self
                .sessions
                .get(idx)
                .filter(|s| s.multiparty)
                .map(|s| s.chat_id);
            self.emit(ClientEvent::ImReceived {
                from,
                text: msg.body_str().to_string(),
                chat_id,
            });
            self.send_response(msg, 200, "OK", &[], Vec::new(), None);
        } else if ctype.starts_with("application/im-iscomposing+xml") {
            match im::parse_iscomposing_active(msg.body_str()) {
                Some(true) => self.emit(ClientEvent::Typing { from }),
                Some(false) => self.emit(ClientEvent::TypingStopped { from }),
                None => {}
            }
            self.send_response(msg, 200, "OK", &[], Vec::new(), None);
        } else {
            self.send_response(msg, 415, "Unsupported media type", &[], Vec::new(), None);
        }
    }

    fn process_incoming_info(&mut self, msg: &SipMessage) {
        let Some(from) = from_uri_of(msg) else {
            return;
        };
        let callid = msg.header("Call-ID").unwrap_or("").to_string();
        let ctype = msg.header("Content-Type").unwrap_or("").to_string();
        let idx = self.sessions.find_for_incoming(&callid, &from);

        if ctype.starts_with(im::MIM_CONTENT_TYPE) {
            match im::parse_mim(msg.body_str()) {
                Some(im::MimAction::RequestRm { uri, bid }) => {
                    debug!(%uri, ?bid, "roster manager requested");
                    let body = im::request_rm_response(&self.cfg.username, true);
                    self.send_response(msg, 200, "OK", &[], Vec::new(), Some(&body));
                }
                Some(im::MimAction::SetRm { uri }) => {
                    if let Some(i) = idx {
                        if let Some(session) = self.sessions.get_mut(i) {
                            session.roster_manager = Some(uri);
                        }
                    }
                    let body = im::set_rm_response(&self.cfg.username);
                    self.send_response(msg, 200, "OK", &[], Vec::new(), Some(&body));
                }
                _ => {
                    self.send_response(msg, 200, "OK", &[], Vec::new(), None);
                }
            }
        } else {
            // Keyboard activity; chats have no per-user typing surface.
            let one_to_one = idx
                .and_then(|i| self.sessions.get(i))
                .map(|s| !s.multiparty)
                .unwrap_or(false);
            if one_to_one {
                self.emit(ClientEvent::Typing { from });
            }
            self.send_response(msg, 200, "OK", &[], Vec::new(), None);
        }
    }

    fn process_incoming_bye(&mut self, msg: &SipMessage) {
        self.send_response(msg, 200, "OK", &[], Vec::new(), None);

        let Some(from) = from_uri_of(msg) else {
            return;
        };
        let callid = msg.header("Call-ID").unwrap_or("").to_string();
        let Some(idx) = self.sessions.find_for_incoming(&callid, &from) else {
            return;
        };

        let (multiparty, chat_id) = {
            let Some(session) = self.sessions.get_mut(idx) else {
                return;
            };
            let was_rm = session
                .roster_manager
                .as_deref()
                .map(|rm| canonical_key(rm) == canonical_key(&from))
                .unwrap_or(false);
            if was_rm {
                session.roster_manager = None;
            }
            (session.multiparty, session.chat_id)
        };

        if !multiparty {
            self.sessions.remove(idx);
        } else {
            let empty = {
                let Some(session) = self.sessions.get_mut(idx) else {
                    return;
                };
                session.remove_dialog(&from);
                session.dialogs.is_empty()
            };
            self.emit(ClientEvent::ChatUserLeft {
                chat_id,
                uri: from,
            });
            if empty {
                self.sessions.remove(idx);
            }
        }
    }

    fn process_incoming_options(&mut self, msg: &SipMessage) {
        let body = im::answer_sdp(&self.local_ip, self.local_port, &self.cfg.username);
        self.send_response(
            msg,
            200,
            "OK",
            &["Ms-Conversation-ID", "EndPoints", "User-Agent"],
            vec![
                (
                    "Allow".to_string(),
                    "INVITE, MESSAGE, INFO, SUBSCRIBE, OPTIONS, BYE, CANCEL, NOTIFY, ACK, BENOTIFY"
                        .to_string(),
                ),
                ("User-Agent".to_string(), self.cfg.useragent.clone()),
            ],
            Some(&body),
        );
    }

    fn send_typing(&mut self, who: &str) {
        let who = with_sip_prefix(who);
        let Some(idx) = self.sessions.find_im(&who) else {
            return;
        };
        let established = self
            .sessions
            .get(idx)
            .and_then(|s| s.dialog(&who))
            .map(|d| d.established)
            .unwrap_or(false);
        if !established {
            return;
        }
        let headers = vec![("Content-Type".to_string(), "application/xml".to_string())];
        self.send_request(
            "INFO",
            &who,
            &who,
            headers,
            im::TYPING_BODY,
            Some(DialogRef {
                session: idx,
                with: &who,
            }),
            ResponseHandler::None,
        );
    }

    /// BYE every dialog, then drop the session.
    fn close_session(&mut self, idx: usize) {
        let withs: Vec<String> = match self.sessions.get(idx) {
            Some(s) => s.dialogs.iter().map(|d| d.with.clone()).collect(),
            None => return,
        };
        for with in withs {
            self.send_request(
                "BYE",
                &with,
                &with,
                Vec::new(),
                "",
                Some(DialogRef {
                    session: idx,
                    with: &with,
                }),
                ResponseHandler::None,
            );
        }
        self.destroy_session(idx);
    }

    fn destroy_session(&mut self, idx: usize) {
        let session = self.sessions.remove(idx);
        debug!(
            callid = ?session.callid,
            multiparty = session.multiparty,
            "session destroyed"
        );
    }

    fn close_all_sessions(&mut self) {
        while !self.sessions.is_empty() {
            self.close_session(0);
        }
    }

    // -------------------------------------------------------------------------
    // ROSTER MANAGEMENT
    // -------------------------------------------------------------------------

    fn add_buddy(&mut self, uri: &str, group: &str) {
        let uri = with_sip_prefix(uri);
        if !self.buddies.contains(&uri) {
            self.buddies.entry(&uri);
            self.move_buddy(&uri, None, group);
            self.subscribe_presence_single(uri);
        }
    }

    fn remove_buddy(&mut self, uri: &str, group: Option<&str>) {
        let uri = with_sip_prefix(uri);
        let group_id = group
            .and_then(|name| self.groups.find_by_name(name))
            .map(|g| g.id);

        let now_empty = {
            let Some(buddy) = self.buddies.get_mut(&uri) else {
                return;
            };
            if let Some(id) = group_id {
                buddy.remove_group(id);
            }
            buddy.group_ids.is_empty() || group.is_none()
        };

        if now_empty {
            self.sched.cancel(&presence_action_name(&uri));
            self.buddies.remove(&uri);
            let delta = self.next_contacts_delta();
            let body = soap::delete_contact(&uri, delta);
            self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
        } else {
            self.update_buddy_groups(&uri);
        }
    }

    fn move_buddy(&mut self, uri: &str, old_group: Option<&str>, new_group: &str) {
        let uri = with_sip_prefix(uri);
        if !self.buddies.contains(&uri) {
            return;
        }
        if let Some(old) = old_group.and_then(|n| self.groups.find_by_name(n)).map(|g| g.id) {
            if let Some(buddy) = self.buddies.get_mut(&uri) {
                buddy.remove_group(old);
            }
        }
        match self.groups.find_by_name(new_group).map(|g| g.id) {
            Some(id) => {
                if let Some(buddy) = self.buddies.get_mut(&uri) {
                    buddy.add_group(id);
                }
                self.update_buddy_groups(&uri);
            }
            None => {
                let delta = self.next_contacts_delta();
                let body = soap::add_group(new_group, delta);
                self.send_service(
                    body,
                    "application/SOAP+xml",
                    ResponseHandler::AddGroup {
                        group_name: new_group.to_string(),
                        buddy_uri: uri,
                    },
                );
            }
        }
    }

    fn update_buddy_groups(&mut self, uri: &str) {
        let Some(buddy) = self.buddies.get(uri) else {
            return;
        };
        let display_name = buddy
            .display_name
            .clone()
            .unwrap_or_else(|| uri.to_string());
        let groups = buddy.groups_string();
        let delta = self.next_contacts_delta();
        let body = soap::set_contact(&display_name, &groups, true, uri, delta);
        self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
    }

    fn process_add_group_response(&mut self, msg: &SipMessage, group_name: &str, buddy_uri: &str) {
        if msg.response != 200 {
            return;
        }
        let Some(id) = soap::parse_add_group_response(msg.body_str()) else {
            return;
        };
        self.groups.add(Group {
            id,
            name: group_name.to_string(),
        });
        self.emit(ClientEvent::GroupAdded {
            id,
            name: group_name.to_string(),
        });
        if let Some(buddy) = self.buddies.get_mut(buddy_uri) {
            buddy.add_group(id);
        }
        self.update_buddy_groups(buddy_uri);
    }

    fn rename_group(&mut self, old_name: &str, new_name: &str) {
        let Some(id) = self.groups.find_by_name(old_name).map(|g| g.id) else {
            return;
        };
        let delta = self.next_contacts_delta();
        let body = soap::modify_group(id, new_name, delta);
        self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
        self.groups.rename(id, new_name);
    }

    fn remove_group(&mut self, name: &str) {
        let Some(id) = self.groups.find_by_name(name).map(|g| g.id) else {
            return;
        };
        let delta = self.next_contacts_delta();
        let body = soap::delete_group(id, delta);
        self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
        self.groups.remove(id);
    }

    fn next_contacts_delta(&mut self) -> u32 {
        let delta = self.contacts_delta;
        self.contacts_delta += 1;
        delta
    }

    fn authorize_watcher(&mut self, uri: &str, allow: bool) {
        let rights = if allow { "AA" } else { "BD" };
        info!(%uri, rights, "ACL decision");
        let delta = self.acl_delta;
        self.acl_delta += 1;
        let body = soap::set_ace(uri, rights, delta);
        self.send_service(body, "application/SOAP+xml", ResponseHandler::Service);
    }

    fn directory_search(&mut self, rows: &[(String, String)]) {
        let mut xml_rows = String::new();
        for (attrib, value) in rows {
            if !value.is_empty() {
                xml_rows.push_str(&soap::search_row(attrib, value));
            }
        }
        let body = soap::directory_search(100, &xml_rows);
        self.send_service(body, "application/SOAP+xml", ResponseHandler::DirectorySearch);
    }

    // -------------------------------------------------------------------------
    // COMMANDS AND TIMERS
    // -------------------------------------------------------------------------

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendIm { to, text } => self.send_im(&to, &text),
            Command::SendChat { chat_id, text } => self.send_chat(chat_id, &text),
            Command::SendTyping { to } => self.send_typing(&to),
            Command::CloseIm { with } => {
                let with = with_sip_prefix(&with);
                if let Some(idx) = self.sessions.find_im(&with) {
                    self.close_session(idx);
                }
            }
            Command::LeaveChat { chat_id } => {
                if let Some(idx) = self.sessions.find_chat_by_id(chat_id) {
                    self.close_session(idx);
                }
            }
            Command::SetStatus { activity, note } => {
                self.status = activity;
                self.note = note;
                if self.register_state == RegisterState::Registered {
                    self.send_presence_status();
                }
            }
            Command::AddBuddy { uri, group } => self.add_buddy(&uri, &group),
            Command::RemoveBuddy { uri, group } => self.remove_buddy(&uri, group.as_deref()),
            Command::MoveBuddy {
                uri,
                old_group,
                new_group,
            } => self.move_buddy(&uri, old_group.as_deref(), &new_group),
            Command::RenameGroup { old_name, new_name } => self.rename_group(&old_name, &new_name),
            Command::RemoveGroup { name } => self.remove_group(&name),
            Command::AuthorizeWatcher { uri, allow } => self.authorize_watcher(&uri, allow),
            Command::Search { rows } => self.directory_search(&rows),
            Command::Quit => self.begin_quit(),
        }
    }

    fn begin_quit(&mut self) {
        info!("signing out");
        self.quitting = true;
        self.close_all_sessions();
        self.do_register(Some(0));
    }

    /// Fire every scheduled action that is due; returns how many ran.
    pub fn run_due_actions(&mut self) -> usize {
        let due = self.sched.take_due(Instant::now());
        let count = due.len();
        for (_, kind) in due {
            self.handle_scheduled(kind);
        }
        count
    }

    /// Run one scheduled action. The scheduler has already removed it.
    pub fn handle_scheduled(&mut self, kind: ScheduledKind) {
        match kind {
            ScheduledKind::Register => {
                self.reregister_set = false;
                self.do_register(None);
            }
            ScheduledKind::Reauthenticate => {
                info!("credentials near expiry; full re-authentication");
                self.registrar.clear();
                self.proxy.clear();
                self.reauthenticate_set = false;
                self.register_state = RegisterState::Unregistered;
                self.do_register(None);
            }
            ScheduledKind::ResendSweep => {
                let now = Instant::now();
                for bytes in self.transactions.retransmit_due(now) {
                    self.enqueue(bytes);
                }
                for trans in self.transactions.take_timed_out(now) {
                    warn!(cseq = %trans.cseq_token, "request timed out");
                    if trans.handler == ResponseHandler::Register {
                        self.terminate("Request timed out", false);
                    }
                }
            }
            ScheduledKind::KeepAlive => {
                // Only when the link sat idle for the advertised interval.
                let idle = self.last_sent.elapsed().as_secs();
                let due = self
                    .caps
                    .keepalive_timeout
                    .map(|t| idle >= t)
                    .unwrap_or(false);
                if due {
                    // Raw CRLF pair between messages; a bare zero byte on
                    // UDP (just enough to hold the NAT binding open).
                    let payload = match self.kind {
                        TransportKind::Udp => vec![0u8],
                        _ => b"\r\n\r\n".to_vec(),
                    };
                    self.enqueue(payload);
                }
            }
            ScheduledKind::SubscribePresenceBatched => self.subscribe_presence_batched(),
            ScheduledKind::SubscribePresenceSingle { uri } => self.subscribe_presence_single(uri),
            ScheduledKind::SubscribePresenceRouted { host, buddies } => {
                self.subscribe_presence_routed(host, buddies)
            }
            ScheduledKind::SubscribeWpending => {
                let parts = subscribe::wpending(&self.contact.clone());
                self.send_subscribe(parts, None);
            }
        }
    }

    // -------------------------------------------------------------------------
    // CONNECTION LIFECYCLE
    // -------------------------------------------------------------------------

    fn adopt_wire(&mut self, wire: Wire) {
        self.kind = wire.kind();
        self.local_ip = wire.local_addr().ip().to_string();
        self.local_port = wire.local_addr().port();
        // Endpoint id: derived from the local interface, regenerated on
        // each (re)connect.
        let seed = uuid_from_epid(&wire.local_addr().to_string());
        self.epid = seed[..8].to_string();
        self.device_uuid = uuid_from_epid(&self.epid);
        self.wire = Some(wire);
        self.sched.schedule_repeating(
            ACTION_RESEND,
            Duration::from_secs(RESEND_SWEEP_INTERVAL_SECS),
            ScheduledKind::ResendSweep,
        );
    }

    /// Tear down all connection-scoped state: timers, transactions, auth,
    /// transmit queue. Dialogs and the roster survive a redirect.
    fn teardown_connection(&mut self) {
        self.wire = None;
        self.txq.clear();
        self.sched.clear();
        self.transactions.clear();
        self.registrar.clear();
        self.proxy.clear();
        self.regcallid = None;
        self.register_state = RegisterState::Unregistered;
        self.reregister_set = false;
        self.reauthenticate_set = false;
        self.subscribed = false;
        self.subscribed_buddies = false;
    }

    async fn flush(&mut self) -> Result<(), WireError> {
        if self.wire.is_none() {
            // Pre-connect: keep accumulating, flushed after connect.
            return Ok(());
        }
        while let Some(bytes) = self.txq.pop_front() {
            if let Some(wire) = self.wire.as_mut() {
                wire.send(&bytes).await?;
            }
        }
        Ok(())
    }

    /// Open a fresh connection and its private event channel. Events from a
    /// previous connection's reader die with the old channel.
    async fn establish(
        &mut self,
        kind: TransportKind,
        host: &str,
        port: u16,
    ) -> Result<mpsc::Receiver<WireEvent>, WireError> {
        let (wire_tx, wire_rx) = mpsc::channel::<WireEvent>(64);
        let wire = transport::connect(kind, host, port, wire_tx).await?;
        self.adopt_wire(wire);
        Ok(wire_rx)
    }

    /// Connect, register and process events until the account terminates.
    pub async fn run(
        mut self,
        resolver: Arc<dyn SrvResolver + 'static>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let target = match &self.cfg.server {
            Some(host) => super::resolve::ConnectionTarget {
                host: host.clone(),
                port: self.cfg.port.unwrap_or_else(|| {
                    match self.cfg.transport {
                        TransportSetting::Tcp => TransportKind::Tcp.default_port(),
                        TransportSetting::Udp => TransportKind::Udp.default_port(),
                        _ => TransportKind::Tls.default_port(),
                    }
                }),
                kind: match self.cfg.transport {
                    TransportSetting::Tcp => TransportKind::Tcp,
                    TransportSetting::Udp => TransportKind::Udp,
                    _ => TransportKind::Tls,
                },
            },
            None => {
                resolve_connection_target(self.cfg.transport, &self.cfg.sipdomain, resolver.clone())
                    .await
            }
        };

        let mut wire_rx = match self.establish(target.kind, &target.host, target.port).await {
            Ok(rx) => rx,
            Err(e) => {
                self.terminate(&format!("Could not connect: {}", e), false);
                return;
            }
        };

        self.emit(ClientEvent::Connecting);
        self.do_register(None);
        if let Err(e) = self.flush().await {
            self.terminate(&format!("{}", e), false);
            return;
        }

        loop {
            if self.terminated.is_some() {
                break;
            }

            // Redirect: reconnect to the new home server and start over.
            if let Some(redirect) = self.pending_reconnect.take() {
                self.teardown_connection();
                let port = redirect.port.unwrap_or_else(|| redirect.kind.default_port());
                match self.establish(redirect.kind, &redirect.host, port).await {
                    Ok(rx) => {
                        wire_rx = rx;
                        self.do_register(None);
                    }
                    Err(e) => {
                        self.terminate(&format!("Could not connect: {}", e), false);
                        break;
                    }
                }
            }

            let deadline = self.sched.next_deadline();
            tokio::select! {
                event = wire_rx.recv() => match event {
                    Some(WireEvent::Message(msg)) => self.handle_message(msg),
                    Some(WireEvent::Closed(err)) => {
                        if self.quitting {
                            self.terminate("Signed out", false);
                        } else if self.pending_reconnect.is_none() {
                            self.terminate(&format!("{}", err), false);
                        }
                    }
                    None => {
                        self.terminate("Connection lost", false);
                    }
                },
                command = commands.recv() => match command {
                    Some(cmd) => self.handle_command(cmd),
                    None => self.begin_quit(),
                },
                _ = sleep_until_deadline(deadline) => {
                    self.run_due_actions();
                }
            }

            if let Err(e) = self.flush().await {
                self.terminate(&format!("{}", e), false);
            }
        }
        info!("account event loop finished");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

/// Running account: commands in, events out. Dropping the command sender
/// signs the account out gracefully.
pub struct AccountHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Spawn an account onto the current tokio runtime.
pub fn spawn(
    cfg: AccountConfig,
    provider: Arc<dyn SecurityProvider>,
    resolver: Arc<dyn SrvResolver + 'static>,
) -> AccountHandle {
    let (account, events) = Account::new_detached(cfg, provider);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(account.run(resolver, commands_rx));
    AccountHandle {
        commands: commands_tx,
        events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::auth::InitializedContext;
    use bytes::BytesMut;

    struct TestContext;

    impl super::super::auth::SecurityContext for TestContext {
        fn step(&mut self, _inbound: &str) -> Result<String, super::super::auth::AuthError> {
            Ok("U1RFUDI=".into())
        }
        fn sign(&mut self, canonical: &str) -> Result<String, super::super::auth::AuthError> {
            Ok(format!("sig-{}", canonical.len()))
        }
        fn verify(
            &self,
            canonical: &str,
            signature: &str,
        ) -> Result<bool, super::super::auth::AuthError> {
            Ok(signature == format!("sig-{}", canonical.len()))
        }
    }

    struct TestProvider;

    impl SecurityProvider for TestProvider {
        fn init_context(
            &self,
            _setup: &super::super::auth::SecuritySetup<'_>,
        ) -> Result<InitializedContext, super::super::auth::AuthError> {
            Ok(InitializedContext {
                context: Box::new(TestContext),
                token: "VE9LRU4x".into(),
                expires: Some(4_000_000_000),
            })
        }
    }

    fn parse(raw: &str) -> SipMessage {
        let mut buf = BytesMut::from(raw);
        super::super::message::parse_message(&mut buf)
            .expect("test message must parse")
            .expect("test message must be complete")
    }

    fn detached() -> (Account, mpsc::UnboundedReceiver<ClientEvent>) {
        let cfg =
            AccountConfig::from_signin_name("alice@ocs.example.com,CORP\\alice", "secret")
                .expect("valid test sign-in");
        Account::new_detached(cfg, Arc::new(TestProvider))
    }

    fn challenge_401(cseq: &str) -> String {
        format!(
            "SIP/2.0 401 Unauthorized\r\nCSeq: {}\r\n\
             WWW-Authenticate: NTLM realm=\"SIP Communications Service\", targetname=\"sip/ocs.example.com\", gssapi-data=\"\", opaque=\"A\"\r\n\
             Content-Length: 0\r\n\r\n",
            cseq
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_initial_register_is_unsigned() {
        let (mut acc, _rx) = detached();
        acc.do_register(None);
        let out = acc.take_outgoing();
        assert_eq!(out.len(), 1);
        let reg = &out[0];
        assert_eq!(reg.method, "REGISTER");
        assert_eq!(reg.target, "sip:ocs.example.com");
        assert!(reg.header("Authorization").is_none());
        assert!(reg.header("ms-keep-alive").is_some());
        assert_eq!(acc.register_state(), RegisterState::Registering);
    }

    #[test]
    fn test_register_401_answered_with_token() {
        let (mut acc, _rx) = detached();
        acc.do_register(None);
        let first = acc.take_outgoing().remove(0);

        acc.handle_message(parse(&challenge_401(first.cseq_token().unwrap())));
        let second = acc.take_outgoing().remove(0);
        assert_eq!(second.method, "REGISTER");
        // New request, not a resend.
        assert_ne!(second.cseq_token(), first.cseq_token());
        let auth = second.header("Authorization").expect("credentialed");
        assert!(auth.starts_with("NTLM"));
        assert!(auth.contains("gssapi-data=\"VE9LRU4x\""));
        assert_eq!(acc.register_state(), RegisterState::Authenticating);
    }

    #[test]
    fn test_register_retry_budget_exhausted() {
        let (mut acc, mut rx) = detached();
        acc.do_register(None);
        for _ in 0..5 {
            let Some(reg) = acc.take_outgoing().into_iter().find(|m| m.method == "REGISTER")
            else {
                break;
            };
            acc.handle_message(parse(&challenge_401(reg.cseq_token().unwrap())));
            if acc.terminated().is_some() {
                break;
            }
        }
        let (reason, fatal) = acc.terminated().expect("terminated").clone();
        assert_eq!(reason, "Wrong Password");
        assert!(fatal);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ClientEvent::Terminated { fatal: true, .. })));
    }

    #[test]
    fn test_redirect_sets_pending_reconnect() {
        let (mut acc, _rx) = detached();
        acc.do_register(None);
        let reg = acc.take_outgoing().remove(0);
        let raw = format!(
            "SIP/2.0 301 Redirect\r\nCSeq: {}\r\nContact: <sip:pool.example.com:5061;transport=tls>\r\nContent-Length: 0\r\n\r\n",
            reg.cseq_token().unwrap()
        );
        acc.handle_message(parse(&raw));
        let redirect = acc.pending_reconnect().expect("redirect recorded");
        assert_eq!(redirect.host, "pool.example.com");
        assert_eq!(redirect.port, Some(5061));
        assert_eq!(redirect.kind, TransportKind::Tls);
    }

    #[test]
    fn test_non_register_401_resends_same_cseq() {
        let (mut acc, _rx) = detached();
        acc.send_im("sip:bob@ocs.example.com", "hello");
        let invite = acc.take_outgoing().remove(0);
        assert_eq!(invite.method, "INVITE");

        let raw = challenge_401(invite.cseq_token().unwrap());
        acc.handle_message(parse(&raw));
        let resend = acc.take_outgoing().remove(0);
        assert_eq!(resend.method, "INVITE");
        // Auth resend keeps the original CSeq.
        assert_eq!(resend.cseq_token(), invite.cseq_token());
        assert!(resend.header("Proxy-Authorization").is_some());
    }

    #[test]
    fn test_407_resends_with_proxy_credentials() {
        let (mut acc, _rx) = detached();
        acc.send_im("sip:bob@ocs.example.com", "hello");
        let invite = acc.take_outgoing().remove(0);

        let raw = format!(
            "SIP/2.0 407 Proxy Authentication Required\r\nCSeq: {}\r\n\
             Proxy-Authenticate: NTLM realm=\"R\", targetname=\"sip/proxy\", gssapi-data=\"\"\r\n\
             Content-Length: 0\r\n\r\n",
            invite.cseq_token().unwrap()
        );
        acc.handle_message(parse(&raw));
        let resend = acc.take_outgoing().remove(0);
        assert_eq!(resend.cseq_token(), invite.cseq_token());
        let auth = resend.header("Proxy-Authorization").expect("proxy auth");
        assert!(auth.contains("targetname=\"sip/proxy\""));
    }

    #[test]
    fn test_notify_gets_200_benotify_does_not() {
        let (mut acc, _rx) = detached();
        let pidf = "<presence entity=\"sip:bob@x\"><tuple id=\"0\"><status><basic>open</basic></status></tuple></presence>";
        let notify = format!(
            "NOTIFY sip:alice@ocs.example.com SIP/2.0\r\n\
             From: <sip:bob@x>;tag=1\r\nTo: <sip:alice@ocs.example.com>;tag=2\r\n\
             Call-ID: n1\r\nCSeq: 1 NOTIFY\r\nEvent: presence\r\n\
             Content-Type: application/pidf+xml\r\nContent-Length: {}\r\n\r\n{}",
            pidf.len(),
            pidf
        );
        acc.handle_message(parse(&notify));
        let out = acc.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].response, 200);

        let benotify = notify.replacen("NOTIFY", "BENOTIFY", 1).replace("1 NOTIFY", "2 BENOTIFY");
        acc.handle_message(parse(&benotify));
        assert!(acc.take_outgoing().is_empty());
    }

    #[test]
    fn test_presence_notify_emits_status() {
        let (mut acc, mut rx) = detached();
        let pidf = "<presence entity=\"sip:bob@x\"><tuple id=\"0\"><status><basic>open</basic></status></tuple></presence>";
        let notify = format!(
            "BENOTIFY sip:alice@ocs.example.com SIP/2.0\r\n\
             From: <sip:bob@x>;tag=1\r\nTo: <sip:alice@ocs.example.com>;tag=2\r\n\
             Call-ID: n1\r\nCSeq: 1 BENOTIFY\r\nEvent: presence\r\n\
             Content-Type: application/pidf+xml\r\nContent-Length: {}\r\n\r\n{}",
            pidf.len(),
            pidf
        );
        acc.handle_message(parse(&notify));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ClientEvent::BuddyStatus { uri, activity: Activity::Available, .. } if uri == "sip:bob@x"
        )));
    }

    #[test]
    fn test_invalid_signature_terminates() {
        let (mut acc, _rx) = detached();
        // Establish a security context via the 401 handshake.
        acc.do_register(None);
        let reg = acc.take_outgoing().remove(0);
        acc.handle_message(parse(&challenge_401(reg.cseq_token().unwrap())));
        let _ = acc.take_outgoing();

        let raw = "BENOTIFY sip:alice@ocs.example.com SIP/2.0\r\n\
             From: <sip:srv@x>;tag=1\r\nTo: <sip:alice@ocs.example.com>\r\n\
             Call-ID: x\r\nCSeq: 9 BENOTIFY\r\nEvent: presence\r\n\
             Authentication-Info: NTLM rspauth=\"bogus\", srand=\"AABB\", snum=\"1\"\r\n\
             Content-Length: 0\r\n\r\n";
        acc.handle_message(parse(raw));
        let (reason, fatal) = acc.terminated().expect("terminated").clone();
        assert!(reason.contains("signature"));
        assert!(fatal);
    }

    #[test]
    fn test_incoming_message_is_delivered_and_acked() {
        let (mut acc, mut rx) = detached();
        let raw = "MESSAGE sip:alice@ocs.example.com SIP/2.0\r\n\
             From: <sip:bob@x>;tag=1\r\nTo: <sip:alice@ocs.example.com>\r\n\
             Call-ID: m1\r\nCSeq: 1 MESSAGE\r\nContent-Type: text/plain; charset=UTF-8\r\n\
             Content-Length: 5\r\n\r\nhello";
        acc.handle_message(parse(raw));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ClientEvent::ImReceived { from, text, chat_id: None } if from == "sip:bob@x" && text == "hello"
        )));
        let out = acc.take_outgoing();
        assert_eq!(out[0].response, 200);
        // A 1:1 session now exists for the sender.
        assert_eq!(acc.session_count(), 1);
    }

    #[test]
    fn test_unknown_method_gets_501() {
        let (mut acc, _rx) = detached();
        let raw = "PUBLISH sip:alice@ocs.example.com SIP/2.0\r\n\
             From: <sip:bob@x>;tag=1\r\nTo: <sip:alice@ocs.example.com>\r\n\
             Call-ID: p1\r\nCSeq: 1 PUBLISH\r\nContent-Length: 0\r\n\r\n";
        acc.handle_message(parse(raw));
        let out = acc.take_outgoing();
        assert_eq!(out[0].response, 501);
    }

    #[test]
    fn test_quit_deregisters() {
        let (mut acc, _rx) = detached();
        acc.handle_command(Command::Quit);
        let out = acc.take_outgoing();
        let reg = out.iter().find(|m| m.method == "REGISTER").expect("deregister");
        assert_eq!(reg.header("Expires"), Some("0"));
        assert_eq!(acc.register_state(), RegisterState::Deregistering);
    }
}
