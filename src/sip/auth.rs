//! Microsoft-flavored SIP authentication.
//!
//! Three schemes are recognized by case-insensitive prefix of the challenge
//! header: NTLM, Kerberos and Digest. Digest is computed in-process; NTLM and
//! Kerberos delegate token generation and message signing to a pluggable
//! [`SecurityProvider`] (SSPI, GSSAPI, or a test double), keeping OS security
//! packages out of the protocol engine.

use super::message::{find_part, SipMessage};
use base64::Engine as _;
use md5::{Digest as _, Md5};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no security provider available for {0}")]
    ProviderUnavailable(&'static str),
    #[error("security context failure: {0}")]
    Context(String),
    #[error("challenge incomplete: missing {0}")]
    MissingAttribute(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    Unset,
    Ntlm,
    Kerberos,
    Digest,
}

impl AuthKind {
    pub fn scheme_name(self) -> &'static str {
        match self {
            AuthKind::Ntlm => "NTLM",
            AuthKind::Kerberos => "Kerberos",
            AuthKind::Digest => "Digest",
            AuthKind::Unset => "",
        }
    }
}

/// Hands the engine fresh security tokens for NTLM/Kerberos.
pub trait SecurityProvider: Send + Sync {
    fn init_context(&self, setup: &SecuritySetup<'_>) -> Result<InitializedContext, AuthError>;
}

/// An established security context: continues the token exchange and signs
/// or verifies canonicalized messages.
pub trait SecurityContext: Send {
    fn step(&mut self, inbound: &str) -> Result<String, AuthError>;
    fn sign(&mut self, canonical: &str) -> Result<String, AuthError>;
    fn verify(&self, canonical: &str, signature: &str) -> Result<bool, AuthError>;
}

pub struct SecuritySetup<'a> {
    pub kind: AuthKind,
    pub authdomain: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    /// Service principal from the challenge's `targetname`.
    pub target: &'a str,
    /// Inbound token from the challenge's `gssapi-data`, base64.
    pub gssapi_data: &'a str,
}

pub struct InitializedContext {
    pub context: Box<dyn SecurityContext>,
    /// Outbound token, base64, for the `gssapi-data` attribute.
    pub token: String,
    /// Credential expiry as unix seconds, when the package reports one.
    pub expires: Option<u64>,
}

/// Provider used when no OS security package is wired up; Digest still works.
pub struct NullProvider;

impl SecurityProvider for NullProvider {
    fn init_context(&self, setup: &SecuritySetup<'_>) -> Result<InitializedContext, AuthError> {
        Err(AuthError::ProviderUnavailable(setup.kind.scheme_name()))
    }
}

/// Credentials handed to `auth_header`; borrowed from the account config.
pub struct Credentials<'a> {
    pub authdomain: &'a str,
    pub authuser: &'a str,
    pub password: &'a str,
}

/// Per-role (registrar/proxy) authentication state.
#[derive(Default)]
pub struct AuthState {
    pub kind: AuthKind,
    pub realm: Option<String>,
    pub target: Option<String>,
    /// NTLM opaque, or the Digest session key once computed.
    pub opaque: Option<String>,
    /// NTLM/Kerberos challenge blob, or the Digest nonce.
    pub gssapi_data: Option<String>,
    pub nc: u32,
    pub retries: u32,
    pub context: Option<Box<dyn SecurityContext>>,
    /// Credential expiry (unix seconds) reported by the provider.
    pub expires: Option<u64>,
    /// Monotonic signing counter (`cnum`).
    pub num: u32,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("kind", &self.kind)
            .field("realm", &self.realm)
            .field("target", &self.target)
            .field("nc", &self.nc)
            .field("retries", &self.retries)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero everything; used on connection teardown and full re-auth.
    pub fn clear(&mut self) {
        *self = AuthState::default();
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Absorb a `WWW-Authenticate` / `Proxy-Authenticate` challenge.
    pub fn fill_from_challenge(&mut self, hdr: &str) {
        let lower = hdr.to_ascii_lowercase();
        if lower.starts_with("ntlm") {
            self.kind = AuthKind::Ntlm;
            self.nc = 1;
        } else if lower.starts_with("kerberos") {
            self.kind = AuthKind::Kerberos;
            self.nc = 3;
        } else {
            self.kind = AuthKind::Digest;
        }
        debug!(scheme = self.kind.scheme_name(), "absorbing auth challenge");

        if let Some(data) = find_part(hdr, "gssapi-data=\"", Some("\"")) {
            self.gssapi_data = Some(data);
            if self.kind == AuthKind::Ntlm {
                // The NTLM package extracts its server challenge from
                // gssapi-data; its presence means we can build the final
                // token now.
                self.nc = 3;
            }
        }
        if let Some(nonce) = find_part(hdr, "nonce=\"", Some("\"")) {
            self.gssapi_data = Some(nonce);
        }
        if let Some(opaque) = find_part(hdr, "opaque=\"", Some("\"")) {
            self.opaque = Some(opaque);
        }
        if let Some(realm) = find_part(hdr, "realm=\"", Some("\"")) {
            if self.kind == AuthKind::Digest && self.realm.as_deref() != Some(realm.as_str()) {
                // Realm change invalidates the Digest session key.
                self.opaque = None;
                self.nc = 1;
            }
            self.realm = Some(realm);
        }
        if let Some(target) = find_part(hdr, "targetname=\"", Some("\"")) {
            self.target = Some(target);
        }
    }
}

/// Signed-message parameters carried on an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSignature {
    pub signature: String,
    pub rand: String,
    pub num: String,
}

/// Build the `Authorization` / `Proxy-Authorization` value for a request.
///
/// `signature` is present once a security context exists and the message has
/// been signed; the header then carries `crand`/`cnum`/`response` instead of
/// a token.
pub fn auth_header(
    state: &mut AuthState,
    provider: &dyn SecurityProvider,
    creds: &Credentials<'_>,
    method: &str,
    target_uri: &str,
    signature: Option<&MessageSignature>,
) -> Result<String, AuthError> {
    match state.kind {
        AuthKind::Ntlm | AuthKind::Kerberos => {
            let proto = state.kind.scheme_name();
            let realm = state.realm.clone().unwrap_or_default();
            let target = state.target.clone().unwrap_or_default();

            if let Some(sig) = signature {
                let opaque = state.opaque.clone().unwrap_or_default();
                return Ok(format!(
                    "{} qop=\"auth\", opaque=\"{}\", realm=\"{}\", targetname=\"{}\", crand=\"{}\", cnum=\"{}\", response=\"{}\"",
                    proto, opaque, realm, target, sig.rand, sig.num, sig.signature
                ));
            }

            let ready_for_token = match state.kind {
                AuthKind::Ntlm => {
                    state.nc == 3 && state.gssapi_data.is_some() && state.context.is_none()
                }
                AuthKind::Kerberos => state.nc == 3,
                _ => false,
            };

            if ready_for_token {
                let inbound = state.gssapi_data.clone().unwrap_or_default();
                let init = provider.init_context(&SecuritySetup {
                    kind: state.kind,
                    authdomain: creds.authdomain,
                    username: creds.authuser,
                    password: creds.password,
                    target: &target,
                    gssapi_data: &inbound,
                })?;
                state.context = Some(init.context);
                state.expires = init.expires;

                let opaque = match state.kind {
                    AuthKind::Ntlm => format!(
                        ", opaque=\"{}\"",
                        state.opaque.clone().unwrap_or_default()
                    ),
                    _ => String::new(),
                };
                return Ok(format!(
                    "{} qop=\"auth\"{}, realm=\"{}\", targetname=\"{}\", gssapi-data=\"{}\"",
                    proto, opaque, realm, target, init.token
                ));
            }

            // Initial request: announce the scheme with an empty token.
            Ok(format!(
                "{} qop=\"auth\", realm=\"{}\", targetname=\"{}\", gssapi-data=\"\"",
                proto, realm, target
            ))
        }
        AuthKind::Digest => {
            let realm = state
                .realm
                .clone()
                .ok_or(AuthError::MissingAttribute("realm"))?;
            let nonce = state
                .gssapi_data
                .clone()
                .ok_or(AuthError::MissingAttribute("nonce"))?;

            if state.opaque.is_none() {
                debug!(%realm, "computing digest session key");
                state.opaque = Some(md5_hex(&format!(
                    "{}:{}:{}",
                    creds.authuser, realm, creds.password
                )));
            }
            let ha1 = state.opaque.clone().unwrap_or_default();

            let noncecount = format!("{:08}", state.nc);
            state.nc += 1;
            let ha2 = md5_hex(&format!("{}:{}", method, target_uri));
            let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

            Ok(format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", nc=\"{}\", response=\"{}\"",
                creds.authuser, realm, nonce, target_uri, noncecount, response
            ))
        }
        AuthKind::Unset => Err(AuthError::MissingAttribute("challenge")),
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// MESSAGE SIGNING
// =============================================================================

/// Canonical signing string: every field wrapped in angle brackets, empty
/// fields as `<>`. The receiving proxy reconstructs the same string from the
/// message, so field order and quoting must not drift.
pub fn signature_input(
    scheme: AuthKind,
    crand: &str,
    cnum: &str,
    realm: &str,
    target: &str,
    msg: &SipMessage,
) -> String {
    let callid = msg.header("Call-ID").unwrap_or("");
    let cseq = msg
        .cseq_token()
        .and_then(|t| t.split_whitespace().next())
        .unwrap_or("");
    let from = msg.header("From").unwrap_or("");
    let to = msg.header("To").unwrap_or("");
    let from_uri = super::message::parse_uri(from).unwrap_or_default();
    let from_tag = super::message::find_tag(from).unwrap_or_default();
    let to_tag = super::message::find_tag(to).unwrap_or_default();
    let expires = msg.header("Expires").unwrap_or("");

    format!(
        "<{}><{}><{}><{}><{}><{}><{}><{}><{}><{}><{}><{}>",
        scheme.scheme_name(),
        crand,
        cnum,
        realm,
        target,
        callid,
        cseq,
        msg.method,
        from_uri,
        from_tag,
        to_tag,
        expires
    )
}

/// Fresh 32-bit random for the `crand` signing attribute.
pub fn gen_crand() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// `Authentication-Info` attributes on incoming messages: the server's
/// signature over the message plus the values it used to build it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub rspauth: String,
    pub srand: String,
    pub snum: String,
}

pub fn parse_auth_info(hdr: &str) -> Option<AuthInfo> {
    Some(AuthInfo {
        rspauth: find_part(hdr, "rspauth=\"", Some("\""))?,
        srand: find_part(hdr, "srand=\"", Some("\"")).unwrap_or_default(),
        snum: find_part(hdr, "snum=\"", Some("\"")).unwrap_or_default(),
    })
}

/// Decode a base64 gssapi-data attribute; tolerates the empty string.
pub fn decode_gssapi_data(data: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn creds() -> Credentials<'static> {
        Credentials {
            authdomain: "CORP",
            authuser: "alice",
            password: "secret",
        }
    }

    struct FixedContext;

    impl SecurityContext for FixedContext {
        fn step(&mut self, _inbound: &str) -> Result<String, AuthError> {
            Ok("step-token".into())
        }
        fn sign(&mut self, canonical: &str) -> Result<String, AuthError> {
            Ok(format!("sig:{}", canonical.len()))
        }
        fn verify(&self, canonical: &str, signature: &str) -> Result<bool, AuthError> {
            Ok(signature == format!("sig:{}", canonical.len()))
        }
    }

    struct FixedProvider;

    impl SecurityProvider for FixedProvider {
        fn init_context(
            &self,
            _setup: &SecuritySetup<'_>,
        ) -> Result<InitializedContext, AuthError> {
            Ok(InitializedContext {
                context: Box::new(FixedContext),
                token: "TlRMTVNTUA==".into(),
                expires: Some(4_000_000_000),
            })
        }
    }

    #[test]
    fn test_fill_ntlm_challenge() {
        let mut st = AuthState::new();
        st.fill_from_challenge(
            "NTLM realm=\"SIP Communications Service\", targetname=\"sip/ocs.example.com\", gssapi-data=\"\", opaque=\"ABCD\"",
        );
        assert_eq!(st.kind, AuthKind::Ntlm);
        assert_eq!(st.realm.as_deref(), Some("SIP Communications Service"));
        assert_eq!(st.target.as_deref(), Some("sip/ocs.example.com"));
        assert_eq!(st.opaque.as_deref(), Some("ABCD"));
        // gssapi-data present (even empty) readies the final token.
        assert_eq!(st.nc, 3);
    }

    #[test]
    fn test_fill_kerberos_challenge() {
        let mut st = AuthState::new();
        st.fill_from_challenge("Kerberos realm=\"R\", targetname=\"sip/x\", gssapi-data=\"YWJj\"");
        assert_eq!(st.kind, AuthKind::Kerberos);
        assert_eq!(st.nc, 3);
        assert_eq!(st.gssapi_data.as_deref(), Some("YWJj"));
    }

    #[test]
    fn test_digest_realm_change_resets_session() {
        let mut st = AuthState::new();
        st.fill_from_challenge("Digest realm=\"one\", nonce=\"n1\"");
        let _ = auth_header(&mut st, &NullProvider, &creds(), "REGISTER", "sip:x", None).unwrap();
        assert!(st.opaque.is_some());
        assert_eq!(st.nc, 2);

        st.fill_from_challenge("Digest realm=\"two\", nonce=\"n2\"");
        assert_eq!(st.opaque, None);
        assert_eq!(st.nc, 1);
    }

    #[test]
    fn test_digest_nc_increments() {
        let mut st = AuthState::new();
        st.fill_from_challenge("Digest realm=\"r\", nonce=\"abc\"");
        let h1 = auth_header(&mut st, &NullProvider, &creds(), "REGISTER", "sip:d", None).unwrap();
        let h2 = auth_header(&mut st, &NullProvider, &creds(), "REGISTER", "sip:d", None).unwrap();
        assert!(h1.contains("nc=\"00000001\""));
        assert!(h2.contains("nc=\"00000002\""));
        assert!(h1.starts_with("Digest username=\"alice\""));
    }

    #[test]
    fn test_ntlm_initial_header_has_empty_token() {
        let mut st = AuthState::new();
        st.kind = AuthKind::Ntlm;
        st.nc = 1;
        st.realm = Some("R".into());
        st.target = Some("sip/x".into());
        let h = auth_header(&mut st, &FixedProvider, &creds(), "REGISTER", "sip:d", None).unwrap();
        assert_eq!(h, "NTLM qop=\"auth\", realm=\"R\", targetname=\"sip/x\", gssapi-data=\"\"");
    }

    #[test]
    fn test_ntlm_token_issued_on_challenge() {
        let mut st = AuthState::new();
        st.fill_from_challenge("NTLM realm=\"R\", targetname=\"sip/x\", gssapi-data=\"Q2hhbGxlbmdl\", opaque=\"OP\"");
        let h = auth_header(&mut st, &FixedProvider, &creds(), "REGISTER", "sip:d", None).unwrap();
        assert!(h.contains("gssapi-data=\"TlRMTVNTUA==\""));
        assert!(h.contains("opaque=\"OP\""));
        assert!(st.has_context());
        assert_eq!(st.expires, Some(4_000_000_000));
    }

    #[test]
    fn test_signed_header_form() {
        let mut st = AuthState::new();
        st.kind = AuthKind::Ntlm;
        st.realm = Some("R".into());
        st.target = Some("sip/x".into());
        st.opaque = Some("OP".into());
        let sig = MessageSignature {
            signature: "abcdef".into(),
            rand: "01020304".into(),
            num: "7".into(),
        };
        let h = auth_header(&mut st, &NullProvider, &creds(), "INVITE", "sip:d", Some(&sig))
            .unwrap();
        assert_eq!(
            h,
            "NTLM qop=\"auth\", opaque=\"OP\", realm=\"R\", targetname=\"sip/x\", crand=\"01020304\", cnum=\"7\", response=\"abcdef\""
        );
    }

    #[test]
    fn test_signature_input_shape() {
        let raw = "INVITE sip:bob@x SIP/2.0\r\n\
            From: <sip:alice@x>;tag=11;epid=ee\r\n\
            To: <sip:bob@x>;tag=22\r\n\
            Call-ID: cid1\r\n\
            CSeq: 4 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from(raw);
        let msg = crate::sip::message::parse_message(&mut buf).unwrap().unwrap();
        let input = signature_input(AuthKind::Ntlm, "cafe0001", "9", "R", "sip/x", &msg);
        assert_eq!(
            input,
            "<NTLM><cafe0001><9><R><sip/x><cid1><4><INVITE><sip:alice@x><11><22><>"
        );
    }

    #[test]
    fn test_parse_auth_info() {
        let info = parse_auth_info(
            "NTLM rspauth=\"0100ffff\", srand=\"AABBCCDD\", snum=\"12\"",
        )
        .unwrap();
        assert_eq!(info.rspauth, "0100ffff");
        assert_eq!(info.srand, "AABBCCDD");
        assert_eq!(info.snum, "12");
        assert!(parse_auth_info("NTLM srand=\"x\"").is_none());
    }

    #[test]
    fn test_context_sign_verify_roundtrip() {
        let mut ctx = FixedContext;
        let sig = ctx.sign("<NTLM><a><1>").unwrap();
        assert!(ctx.verify("<NTLM><a><1>", &sig).unwrap());
        assert!(!ctx.verify("<NTLM><b><2><longer>", &sig).unwrap());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut st = AuthState::new();
        st.fill_from_challenge("NTLM realm=\"R\", targetname=\"T\", gssapi-data=\"\"");
        st.retries = 3;
        st.num = 9;
        st.clear();
        assert_eq!(st.kind, AuthKind::Unset);
        assert_eq!(st.retries, 0);
        assert_eq!(st.num, 0);
        assert!(st.realm.is_none());
    }
}
