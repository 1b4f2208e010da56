//! Instant-messaging bodies: SDP for message media, `ms-text-format`
//! first-message transport, typing notifications, and the ad-hoc multiparty
//! roster-manager protocol (`application/x-ms-mim`).

use super::message::{find_part, parse_uri};
use base64::Engine as _;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Media types accepted in IM sessions.
pub const ACCEPT_TYPES: &str =
    "text/plain text/html image/gif multipart/alternative application/im-iscomposing+xml";

/// SDP body of an outgoing INVITE: advertises the message medium without
/// naming a contact address (the dialog route carries that).
pub fn invite_sdp(local_ip: &str, port: u16) -> String {
    format!(
        "v=0\r\no=- 0 0 IN IP4 {ip}\r\ns=session\r\nc=IN IP4 {ip}\r\nt=0 0\r\n\
         m=message {port} sip null\r\na=accept-types:{types}\r\n",
        ip = local_ip,
        port = port,
        types = ACCEPT_TYPES
    )
}

/// SDP body of a 200 OK to INVITE/OPTIONS, naming our own address.
pub fn answer_sdp(local_ip: &str, port: u16, username: &str) -> String {
    format!(
        "v=0\r\no=- 0 0 IN IP4 {ip}\r\ns=session\r\nc=IN IP4 {ip}\r\nt=0 0\r\n\
         m=message {port} sip sip:{user}\r\na=accept-types:{types}\r\n",
        ip = local_ip,
        port = port,
        user = username,
        types = ACCEPT_TYPES
    )
}

/// Whether an INVITE body offers a message medium we can answer.
pub fn offers_message_medium(body: &str) -> bool {
    body.contains("m=message") || body.contains("m=x-ms-message")
}

/// Build the `ms-text-format` header value carrying the first message:
/// `text/plain; charset=UTF-8;ms-body=<base64>`.
pub fn ms_text_format_value(text: &str) -> String {
    format!(
        "text/plain; charset=UTF-8;ms-body={}",
        base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
    )
}

/// Decode an incoming `ms-text-format` header. Only text payloads are
/// rendered; the `msgr` formatting blob is ignored.
pub fn parse_ms_text_format(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    if !lower.starts_with("text/plain") && !lower.starts_with("text/html") {
        return None;
    }
    let encoded = find_part(value, "ms-body=", Some(";")).or_else(|| find_part(value, "ms-body=", None))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Parse an `EndPoints:` header:
/// `"alice a" <sip:alice@x>, <sip:bob@x>;epid=ebca82d94d, <sip:carol@x>`.
pub fn parse_endpoints(value: &str) -> Vec<(String, Option<String>)> {
    value
        .split(',')
        .filter_map(|part| {
            let uri = parse_uri(part)?;
            let epid = find_part(part, "epid=", Some(";"))
                .or_else(|| find_part(part, "epid=", None))
                .map(|e| e.trim().to_string());
            Some((uri, epid))
        })
        .collect()
}

// =============================================================================
// TYPING NOTIFICATIONS
// =============================================================================

/// INFO body announcing local typing (`Content-Type: application/xml`).
pub const TYPING_BODY: &str =
    "<?xml version=\"1.0\"?><KeyboardActivity><status status=\"type\"/></KeyboardActivity>";

/// Read the `state` of an `application/im-iscomposing+xml` MESSAGE body.
/// Returns whether the peer is actively composing.
pub fn parse_iscomposing_active(xml: &str) -> Option<bool> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_state = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"state" {
                    in_state = true;
                }
            }
            Ok(Event::End(_)) => in_state = false,
            Ok(Event::Text(t)) => {
                if in_state {
                    let text = t.unescape().ok()?;
                    return Some(text.contains("active"));
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

// =============================================================================
// ROSTER-MANAGER PROTOCOL (application/x-ms-mim)
// =============================================================================

pub const MIM_CONTENT_TYPE: &str = "application/x-ms-mim";
const MIM_XMLNS: &str = "http://schemas.microsoft.com/sip/multiparty/";

/// Action carried in an `application/x-ms-mim` INFO body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimAction {
    /// Someone bids to become roster manager.
    RequestRm { uri: String, bid: Option<i32> },
    /// The accepted bidder announces itself as the manager.
    SetRm { uri: String },
    RequestRmResponse { uri: String, allow: bool },
    SetRmResponse { uri: String },
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

pub fn parse_mim(xml: &str) -> Option<MimAction> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"RequestRM" => {
                    return Some(MimAction::RequestRm {
                        uri: attr(e, "uri").unwrap_or_default(),
                        bid: attr(e, "bid").and_then(|b| b.parse().ok()),
                    });
                }
                b"SetRM" => {
                    return Some(MimAction::SetRm {
                        uri: attr(e, "uri").unwrap_or_default(),
                    });
                }
                b"RequestRMResponse" => {
                    return Some(MimAction::RequestRmResponse {
                        uri: attr(e, "uri").unwrap_or_default(),
                        allow: attr(e, "allow")
                            .map(|a| a.eq_ignore_ascii_case("true"))
                            .unwrap_or(false),
                    });
                }
                b"SetRMResponse" => {
                    return Some(MimAction::SetRmResponse {
                        uri: attr(e, "uri").unwrap_or_default(),
                    });
                }
                _ => {}
            },
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn mim_body(inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<action xmlns=\"{}\">{}</action>\r\n",
        MIM_XMLNS, inner
    )
}

pub fn request_rm(self_username: &str, bid: i32) -> String {
    mim_body(&format!(
        "<RequestRM uri=\"sip:{}\" bid=\"{}\"/>",
        escape(self_username),
        bid
    ))
}

pub fn request_rm_response(self_username: &str, allow: bool) -> String {
    mim_body(&format!(
        "<RequestRMResponse uri=\"sip:{}\" allow=\"{}\"/>",
        escape(self_username),
        allow
    ))
}

pub fn set_rm(self_username: &str) -> String {
    mim_body(&format!("<SetRM uri=\"sip:{}\"/>", escape(self_username)))
}

pub fn set_rm_response(self_username: &str) -> String {
    mim_body(&format!("<SetRMResponse uri=\"sip:{}\"/>", escape(self_username)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_media_lines() {
        let invite = invite_sdp("10.0.0.1", 5060);
        assert!(invite.contains("m=message 5060 sip null"));
        assert!(offers_message_medium(&invite));

        let answer = answer_sdp("10.0.0.1", 5060, "me@x.com");
        assert!(answer.contains("m=message 5060 sip sip:me@x.com"));
        assert!(answer.contains("a=accept-types:text/plain text/html"));

        assert!(offers_message_medium("m=x-ms-message 5060 sip null"));
        assert!(!offers_message_medium("m=audio 49170 RTP/AVP 0"));
    }

    #[test]
    fn test_ms_text_format_roundtrip() {
        let value = ms_text_format_value("hi there");
        assert!(value.starts_with("text/plain; charset=UTF-8;ms-body="));
        assert_eq!(parse_ms_text_format(&value).as_deref(), Some("hi there"));
    }

    #[test]
    fn test_ms_text_format_with_msgr_blob() {
        // The msgr formatting blob sits between charset and ms-body.
        let value = "text/plain; charset=UTF-8;msgr=WAAtAE0A;ms-body=SGk=";
        assert_eq!(parse_ms_text_format(value).as_deref(), Some("Hi"));
    }

    #[test]
    fn test_ms_text_format_rejects_non_text() {
        assert_eq!(parse_ms_text_format("application/octet-stream;ms-body=SGk="), None);
    }

    #[test]
    fn test_parse_endpoints() {
        let eps = parse_endpoints(
            "\"alice a\" <sip:alice@x>, <sip:bob@x>;epid=ebca82d94d, <sip:carol@x>",
        );
        assert_eq!(eps.len(), 3);
        assert_eq!(eps[0].0, "sip:alice@x");
        assert_eq!(eps[1], ("sip:bob@x".to_string(), Some("ebca82d94d".to_string())));
        assert_eq!(eps[2].1, None);
    }

    #[test]
    fn test_mim_roundtrip() {
        let body = request_rm("bob@x", 1);
        assert_eq!(
            parse_mim(&body),
            Some(MimAction::RequestRm { uri: "sip:bob@x".into(), bid: Some(1) })
        );

        let body = request_rm_response("me@x", true);
        assert_eq!(
            parse_mim(&body),
            Some(MimAction::RequestRmResponse { uri: "sip:me@x".into(), allow: true })
        );

        let body = set_rm("bob@x");
        assert_eq!(parse_mim(&body), Some(MimAction::SetRm { uri: "sip:bob@x".into() }));

        let body = set_rm_response("me@x");
        assert_eq!(
            parse_mim(&body),
            Some(MimAction::SetRmResponse { uri: "sip:me@x".into() })
        );
    }

    #[test]
    fn test_parse_iscomposing() {
        let active = r#"<?xml version="1.0"?><isComposing><state>active</state><contenttype>text/plain</contenttype></isComposing>"#;
        assert_eq!(parse_iscomposing_active(active), Some(true));
        let idle = r#"<isComposing><state>idle</state></isComposing>"#;
        assert_eq!(parse_iscomposing_active(idle), Some(false));
        assert_eq!(parse_iscomposing_active("<isComposing/>"), None);
    }
}
