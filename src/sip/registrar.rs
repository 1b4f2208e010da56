//! REGISTER construction and response decoding.
//!
//! The registrar drives the account lifecycle: the 200 OK to REGISTER
//! carries the server's capability advertisement (event packages, batched
//! subscribe support, GRUU, keep-alive interval) that shapes everything the
//! client does afterwards. The account owns the state machine; this module
//! owns the message shapes.

use super::message::{find_part, parse_uri, SipMessage};
use super::transport::TransportKind;

/// Registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterState {
    #[default]
    Unregistered,
    /// Initial REGISTER sent, no final answer yet.
    Registering,
    /// 401 received, challenge absorbed, credentialed REGISTER re-sent.
    Authenticating,
    Registered,
    /// Expires: 0 sent on sign-out.
    Deregistering,
}

/// Per-device Contact for REGISTER: advertises the method set and the GRUU
/// instance id derived from the EPID.
pub fn device_contact(local_ip: &str, port: u16, transport: TransportKind, uuid: &str) -> String {
    format!(
        "<sip:{}:{};transport={};ms-opaque=d3470f2e1d>;methods=\"INVITE, MESSAGE, INFO, SUBSCRIBE, OPTIONS, BYE, CANCEL, NOTIFY, ACK, BENOTIFY\";proxy=replace;+sip.instance=\"<urn:uuid:{}>\"",
        local_ip,
        port,
        transport.descriptor(),
        uuid
    )
}

/// Extra headers of a REGISTER request. `expires` is set for explicit
/// refresh/deregister; the initial REGISTER lets the server pick.
pub fn register_headers(device_contact: &str, expires: Option<u32>) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Contact".to_string(), device_contact.to_string()),
        (
            "Supported".to_string(),
            "gruu-10, adhoclist, msrtc-event-categories, com.microsoft.msrtc.presence".to_string(),
        ),
        ("Event".to_string(), "registration".to_string()),
        ("Allow-Events".to_string(), "presence".to_string()),
        ("ms-keep-alive".to_string(), "UAC;hop-hop=yes".to_string()),
    ];
    if let Some(secs) = expires {
        headers.push(("Expires".to_string(), secs.to_string()));
    }
    headers
}

/// Capabilities advertised in a 200 OK to REGISTER.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub expires: u64,
    /// `Supported: msrtc-event-categories` — OCS 2007 category presence.
    pub msrtc_event_categories: bool,
    /// `Supported: adhoclist` — batched presence subscriptions.
    pub batched_support: bool,
    /// Accumulated `Allow-Events` tokens.
    pub allow_events: Vec<String>,
    /// GRUU from the Contact instance matching our device uuid.
    pub gruu: Option<String>,
    /// `ms-keep-alive: ...;timeout=N`.
    pub keepalive_timeout: Option<u64>,
}

impl ServerCapabilities {
    pub fn allows_event(&self, event: &str) -> bool {
        self.allow_events.iter().any(|e| e.eq_ignore_ascii_case(event))
    }
}

/// Decode the capability advertisement of a 200 OK. `uuid` selects our own
/// Contact among the per-device instances the server echoes back.
pub fn parse_register_ok(msg: &SipMessage, uuid: &str) -> ServerCapabilities {
    let mut caps = ServerCapabilities {
        expires: msg
            .header("Expires")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        ..Default::default()
    };

    for value in msg.headers.all("Supported") {
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("msrtc-event-categories") {
                caps.msrtc_event_categories = true;
            } else if token.eq_ignore_ascii_case("adhoclist") {
                caps.batched_support = true;
            }
        }
    }

    for value in msg.headers.all("Allow-Events") {
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                caps.allow_events.push(token.to_string());
            }
        }
    }

    // Several Contact headers come back, one per signed-in device; ours is
    // the one carrying our instance uuid.
    for contact in msg.headers.all("Contact") {
        if contact.contains(uuid) {
            caps.gruu = find_part(contact, "gruu=\"", Some("\""));
            break;
        }
    }

    caps.keepalive_timeout = msg
        .header("ms-keep-alive")
        .and_then(|v| find_part(v, "timeout=", Some(";")).or_else(|| find_part(v, "timeout=", None)))
        .and_then(|t| t.trim().parse().ok());

    caps
}

/// Redirect target of a 301 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub host: String,
    pub port: Option<u16>,
    pub kind: TransportKind,
}

/// Decode the `Contact` of a 301: `<sip:host[:port][;transport=...]>`.
pub fn parse_redirect(msg: &SipMessage) -> Option<Redirect> {
    let contact = msg.header("Contact")?;
    let uri = parse_uri(contact)?;
    let rest = uri.strip_prefix("sip:")?;

    let mut parts = rest.split(';');
    let hostport = parts.next()?;
    let (host, port) = match hostport.split_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()),
        None => (hostport.to_string(), None),
    };
    if host.is_empty() {
        return None;
    }

    let mut kind = TransportKind::Tls;
    for param in parts {
        if let Some(value) = param.strip_prefix("transport=") {
            if value.eq_ignore_ascii_case("tcp") {
                kind = TransportKind::Tcp;
            } else if value.eq_ignore_ascii_case("udp") {
                kind = TransportKind::Udp;
            }
        }
    }

    Some(Redirect { host, port, kind })
}

/// Human-readable failure reason: `ms-diagnostics` preferred, then the
/// public variant.
pub fn diagnostics_reason(msg: &SipMessage) -> Option<String> {
    let hdr = msg
        .header("ms-diagnostics")
        .or_else(|| msg.header("ms-diagnostics-public"))?;
    find_part(hdr, "reason=\"", Some("\""))
}

/// Quoted text of a `Warning` header, e.g.
/// `Warning: 310 lcs.microsoft.com "You are ..."`.
pub fn warning_reason(msg: &SipMessage) -> Option<String> {
    let hdr = msg.header("Warning")?;
    find_part(hdr, "\"", Some("\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parse(raw: &str) -> SipMessage {
        let mut buf = BytesMut::from(raw);
        super::super::message::parse_message(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_register_headers_shape() {
        let contact = device_contact("10.0.0.5", 5060, TransportKind::Tls, "abc-uuid");
        let headers = register_headers(&contact, None);
        assert!(headers.iter().any(|(n, v)| n == "Supported" && v.contains("msrtc-event-categories")));
        assert!(headers.iter().any(|(n, v)| n == "ms-keep-alive" && v == "UAC;hop-hop=yes"));
        assert!(!headers.iter().any(|(n, _)| n == "Expires"));
        assert!(contact.contains("+sip.instance=\"<urn:uuid:abc-uuid>\""));
        assert!(contact.contains("transport=tls"));

        let dereg = register_headers(&contact, Some(0));
        assert!(dereg.iter().any(|(n, v)| n == "Expires" && v == "0"));
    }

    #[test]
    fn test_parse_register_ok() {
        let msg = parse(
            "SIP/2.0 200 OK\r\n\
             CSeq: 2 REGISTER\r\n\
             Expires: 600\r\n\
             Supported: adhoclist, msrtc-event-categories\r\n\
             Supported: gruu-10\r\n\
             Allow-Events: vnd-microsoft-roaming-contacts, vnd-microsoft-roaming-self\r\n\
             Allow-Events: presence.wpending, presence\r\n\
             Contact: <sip:other@1.2.3.4>;+sip.instance=\"<urn:uuid:other-device>\"\r\n\
             Contact: <sip:me@1.2.3.5>;+sip.instance=\"<urn:uuid:my-uuid>\";gruu=\"sip:me@x;opaque=app:epid\"\r\n\
             ms-keep-alive: UAS; tcp=yes; hop-hop=yes; timeout=300\r\n\
             Content-Length: 0\r\n\r\n",
        );
        let caps = parse_register_ok(&msg, "my-uuid");
        assert_eq!(caps.expires, 600);
        assert!(caps.msrtc_event_categories);
        assert!(caps.batched_support);
        assert!(caps.allows_event("presence"));
        assert!(caps.allows_event("VND-MICROSOFT-ROAMING-CONTACTS"));
        assert_eq!(caps.allow_events.len(), 4);
        assert_eq!(caps.gruu.as_deref(), Some("sip:me@x;opaque=app:epid"));
        assert_eq!(caps.keepalive_timeout, Some(300));
    }

    #[test]
    fn test_parse_register_ok_without_gruu() {
        let msg = parse(
            "SIP/2.0 200 OK\r\nCSeq: 2 REGISTER\r\nExpires: 480\r\nContent-Length: 0\r\n\r\n",
        );
        let caps = parse_register_ok(&msg, "my-uuid");
        assert_eq!(caps.expires, 480);
        assert_eq!(caps.gruu, None);
        assert!(!caps.msrtc_event_categories);
    }

    #[test]
    fn test_parse_redirect() {
        let msg = parse(
            "SIP/2.0 301 Redirect\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:pool.example.com:5061;transport=tls>\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert_eq!(
            parse_redirect(&msg),
            Some(Redirect {
                host: "pool.example.com".into(),
                port: Some(5061),
                kind: TransportKind::Tls
            })
        );
    }

    #[test]
    fn test_parse_redirect_defaults() {
        let msg = parse(
            "SIP/2.0 301 Redirect\r\nCSeq: 1 REGISTER\r\nContact: <sip:pool2.example.com;transport=tcp>\r\nContent-Length: 0\r\n\r\n",
        );
        let r = parse_redirect(&msg).unwrap();
        assert_eq!(r.host, "pool2.example.com");
        assert_eq!(r.port, None);
        assert_eq!(r.kind, TransportKind::Tcp);
    }

    #[test]
    fn test_diagnostics_and_warning() {
        let msg = parse(
            "SIP/2.0 404 Not Found\r\n\
             CSeq: 1 REGISTER\r\n\
             ms-diagnostics: 4619;reason=\"User not enabled for SIP\"\r\n\
             Warning: 310 lcs.example.com \"Old client version\"\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert_eq!(
            diagnostics_reason(&msg).as_deref(),
            Some("User not enabled for SIP")
        );
        assert_eq!(warning_reason(&msg).as_deref(), Some("Old client version"));
    }
}
