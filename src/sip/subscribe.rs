//! SUBSCRIBE request construction and roaming NOTIFY body parsing.
//!
//! Every subscription announces `ms-benotify` (so the server may use
//! best-effort NOTIFY) and `ms-piggyback-first-notify` (so the first NOTIFY
//! may ride inside the SUBSCRIBE's own 200 OK). The presence subscription
//! comes in three shapes: full batched against the own URI, single-contact,
//! and pool-routed batched for `resubscribe` instances that share a
//! `poolFqdn`.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Extra headers plus optional body of a SUBSCRIBE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeParts {
    pub headers: Vec<(String, String)>,
    pub body: String,
}

fn benotify_headers() -> Vec<(String, String)> {
    vec![
        ("Supported".into(), "ms-benotify".into()),
        ("Proxy-Require".into(), "ms-benotify".into()),
        ("Supported".into(), "ms-piggyback-first-notify".into()),
    ]
}

pub fn roaming_contacts(contact: &str) -> SubscribeParts {
    let mut headers = vec![
        ("Event".into(), "vnd-microsoft-roaming-contacts".into()),
        (
            "Accept".into(),
            "application/vnd-microsoft-roaming-contacts+xml".into(),
        ),
        ("Supported".into(), "com.microsoft.autoextend".into()),
    ];
    headers.extend(benotify_headers());
    headers.push(("Contact".into(), contact.into()));
    SubscribeParts {
        headers,
        body: String::new(),
    }
}

pub fn roaming_acl(contact: &str) -> SubscribeParts {
    let mut headers = vec![
        ("Event".into(), "vnd-microsoft-roaming-ACL".into()),
        (
            "Accept".into(),
            "application/vnd-microsoft-roaming-acls+xml".into(),
        ),
        ("Supported".into(), "com.microsoft.autoextend".into()),
    ];
    headers.extend(benotify_headers());
    headers.push(("Contact".into(), contact.into()));
    SubscribeParts {
        headers,
        body: String::new(),
    }
}

pub fn roaming_self(contact: &str) -> SubscribeParts {
    let mut headers = vec![
        ("Event".into(), "vnd-microsoft-roaming-self".into()),
        (
            "Accept".into(),
            "application/vnd-microsoft-roaming-self+xml".into(),
        ),
    ];
    headers.extend(benotify_headers());
    headers.push(("Contact".into(), contact.into()));
    headers.push((
        "Content-Type".into(),
        "application/vnd-microsoft-roaming-self+xml".into(),
    ));
    SubscribeParts {
        headers,
        body: "<roamingList xmlns=\"http://schemas.microsoft.com/2006/09/sip/roaming-self\">\
               <roaming type=\"categories\"/><roaming type=\"containers\"/>\
               <roaming type=\"subscribers\"/></roamingList>"
            .into(),
    }
}

/// One-time provisioning query (Expires: 0). `v2` for OCS 2007, otherwise
/// the LCS 2005 variant.
pub fn provisioning(contact: &str, v2: bool) -> SubscribeParts {
    let (event, accept) = if v2 {
        (
            "vnd-microsoft-provisioning-v2",
            "application/vnd-microsoft-roaming-provisioning-v2+xml",
        )
    } else {
        (
            "vnd-microsoft-provisioning",
            "application/vnd-microsoft-roaming-provisioning+xml",
        )
    };
    let mut headers = vec![
        ("Event".into(), event.to_string()),
        ("Accept".into(), accept.to_string()),
        ("Supported".into(), "com.microsoft.autoextend".into()),
    ];
    headers.extend(benotify_headers());
    headers.push(("Expires".into(), "0".into()));
    headers.push(("Contact".into(), contact.into()));

    let body = if v2 {
        "<provisioningGroupList xmlns=\"http://schemas.microsoft.com/2006/09/sip/provisioninggrouplist\">\
         <provisioningGroup name=\"ServerConfiguration\"/><provisioningGroup name=\"meetingPolicy\"/>\
         <provisioningGroup name=\"ucPolicy\"/></provisioningGroupList>"
            .to_string()
    } else {
        String::new()
    };
    if v2 {
        headers.push(("Content-Type".into(), accept.to_string()));
    }
    SubscribeParts { headers, body }
}

pub fn wpending(contact: &str) -> SubscribeParts {
    let mut headers = vec![
        ("Event".into(), "presence.wpending".into()),
        ("Accept".into(), "text/xml+msrtc.wpending".into()),
        ("Supported".into(), "com.microsoft.autoextend".into()),
    ];
    headers.extend(benotify_headers());
    headers.push(("Contact".into(), contact.into()));
    SubscribeParts {
        headers,
        body: String::new(),
    }
}

/// Resource line of a batched presence subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub uri: String,
    /// `<context/>` marks contacts subscribed for the first time; set for
    /// everyone except already-resubscribed contacts on category servers.
    pub with_context: bool,
}

/// Batched presence SUBSCRIBE. From and To are both the local user; `to`
/// may instead be a pool host when routing resubscriptions. With
/// `msrtc_event_categories` the body is a category batchSub, otherwise the
/// legacy adhoclist.
pub fn presence_batched(
    contact: &str,
    self_uri: &str,
    resources: &[Resource],
    msrtc_event_categories: bool,
) -> SubscribeParts {
    let mut resource_lines = String::new();
    for r in resources {
        if msrtc_event_categories && r.with_context {
            resource_lines.push_str(&format!(
                "<resource uri=\"{}\"><context/></resource>\n",
                escape(r.uri.as_str())
            ));
        } else {
            resource_lines.push_str(&format!("<resource uri=\"{}\"/>\n", escape(r.uri.as_str())));
        }
    }

    let (content_type, body, require, accept_extra, autoextend) = if msrtc_event_categories {
        (
            "application/msrtc-adrl-categorylist+xml",
            format!(
                "<batchSub xmlns=\"http://schemas.microsoft.com/2006/01/sip/batch-subscribe\" uri=\"{}\" name=\"\">\n\
                 <action name=\"subscribe\" id=\"63792024\">\n<adhocList>\n{}</adhocList>\n\
                 <categoryList xmlns=\"http://schemas.microsoft.com/2006/09/sip/categorylist\">\n\
                 <category name=\"note\"/>\n<category name=\"state\"/>\n</categoryList>\n\
                 </action>\n</batchSub>",
                escape(self_uri),
                resource_lines
            ),
            "adhoclist, categoryList",
            ", application/msrtc-event-categories+xml, application/xpidf+xml, application/pidf+xml",
            false,
        )
    } else {
        (
            "application/adrl+xml",
            format!(
                "<adhoclist xmlns=\"urn:ietf:params:xml:ns:adrl\" uri=\"{}\" name=\"{}\">\n\
                 <create xmlns=\"\">\n{}</create>\n</adhoclist>\n",
                escape(self_uri),
                escape(self_uri),
                resource_lines
            ),
            "adhoclist",
            "",
            true,
        )
    };

    let mut headers = vec![
        ("Require".into(), require.to_string()),
        ("Supported".into(), "eventlist".into()),
        (
            "Accept".into(),
            format!(
                "application/rlmi+xml, multipart/related, text/xml+msrtc.pidf{}",
                accept_extra
            ),
        ),
    ];
    if autoextend {
        headers.push(("Supported".into(), "com.microsoft.autoextend".into()));
    }
    headers.extend(benotify_headers());
    headers.push(("Event".into(), "presence".into()));
    headers.push(("Content-Type".into(), content_type.into()));
    headers.push(("Contact".into(), contact.into()));

    SubscribeParts { headers, body }
}

/// Single-contact presence SUBSCRIBE; To and the listed resource are the
/// contact itself.
pub fn presence_single(
    contact: &str,
    self_uri: &str,
    buddy_uri: &str,
    msrtc_event_categories: bool,
) -> SubscribeParts {
    let mut headers = vec![(
        "Accept".into(),
        "application/msrtc-event-categories+xml, text/xml+msrtc.pidf, application/xpidf+xml, application/pidf+xml, application/rlmi+xml, multipart/related"
            .to_string(),
    )];
    if !msrtc_event_categories {
        headers.push(("Supported".into(), "com.microsoft.autoextend".into()));
    }
    headers.extend(benotify_headers());
    headers.push(("Event".into(), "presence".into()));
    headers.push((
        "Content-Type".into(),
        "application/msrtc-adrl-categorylist+xml".into(),
    ));
    headers.push(("Contact".into(), contact.into()));

    let body = format!(
        "<batchSub xmlns=\"http://schemas.microsoft.com/2006/01/sip/batch-subscribe\" uri=\"{}\" name=\"\">\n\
         <action name=\"subscribe\" id=\"63792024\"><adhocList>\n<resource uri=\"{}\"/>\n</adhocList>\n\
         <categoryList xmlns=\"http://schemas.microsoft.com/2006/09/sip/categorylist\">\n\
         <category name=\"note\"/>\n<category name=\"state\"/>\n</categoryList>\n</action>\n</batchSub>",
        escape(self_uri),
        escape(buddy_uri)
    );
    SubscribeParts { headers, body }
}

// =============================================================================
// ROAMING BODY PARSERS
// =============================================================================

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoamingContact {
    /// Bare address as sent by the server (no `sip:` prefix).
    pub uri: String,
    pub name: Option<String>,
    /// Raw `groups` attribute, space-separated ids; empty means unassigned.
    pub group_ids: Vec<i32>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoamingContacts {
    pub delta: Option<u32>,
    /// (id, name) pairs in document order.
    pub groups: Vec<(i32, String)>,
    pub contacts: Vec<RoamingContact>,
}

/// Parse a `vnd-microsoft-roaming-contacts` NOTIFY body.
pub fn parse_roaming_contacts(xml: &str) -> Option<RoamingContacts> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = RoamingContacts::default();
    let mut seen_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.name().as_ref() {
                    b"contactList" => {
                        seen_root = true;
                        out.delta = attr(e, "deltaNum").and_then(|v| v.parse().ok());
                    }
                    b"group" => {
                        if let Some(id) = attr(e, "id").and_then(|v| v.parse().ok()) {
                            let name = attr(e, "name").unwrap_or_default();
                            out.groups.push((id, name));
                        }
                    }
                    b"contact" => {
                        if let Some(uri) = attr(e, "uri") {
                            let group_ids = attr(e, "groups")
                                .unwrap_or_default()
                                .split_whitespace()
                                .filter_map(|t| t.parse().ok())
                                .collect();
                            out.contacts.push(RoamingContact {
                                uri,
                                name: attr(e, "name").filter(|n| !n.is_empty()),
                                group_ids,
                            });
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }
    if seen_root || !out.contacts.is_empty() || !out.groups.is_empty() {
        Some(out)
    } else {
        None
    }
}

/// Parse the `deltaNum` of a roaming-ACL NOTIFY.
pub fn parse_acl_delta(xml: &str) -> Option<u32> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                return attr(e, "deltaNum").and_then(|v| v.parse().ok());
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfSubscriber {
    /// Bare address, no `sip:` prefix.
    pub user: String,
    pub display_name: Option<String>,
    pub acknowledged: bool,
}

/// Parse the `subscribers` section of a roaming-self NOTIFY.
pub fn parse_roaming_self(xml: &str) -> Vec<SelfSubscriber> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"subscriber" {
                    if let Some(user) = attr(e, "user") {
                        out.push(SelfSubscriber {
                            user,
                            display_name: attr(e, "displayName"),
                            acknowledged: attr(e, "acknowledged")
                                .map(|v| v.eq_ignore_ascii_case("true"))
                                .unwrap_or(true),
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watcher {
    pub uri: String,
    pub display_name: Option<String>,
}

/// Parse a `presence.wpending` watcher list.
pub fn parse_wpending(xml: &str) -> Vec<Watcher> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"watcher" {
                    if let Some(uri) = attr(e, "uri") {
                        out.push(Watcher {
                            uri,
                            display_name: attr(e, "displayName"),
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    out
}

/// Extract the deregistration event token from a `text/registration-event`
/// body, e.g. `deregistered;event=rejected` → `rejected`.
pub fn parse_dereg_event(body: &str) -> Option<String> {
    let token = super::message::find_part(body, "event=", Some(";"))
        .or_else(|| super::message::find_part(body, "event=", None))?;
    Some(token.trim().to_string())
}

/// User-facing reason for a server-initiated deregistration when no
/// ms-diagnostics reason was supplied (LCS 2005).
pub fn dereg_reason_for_event(event: &str) -> &'static str {
    if event.eq_ignore_ascii_case("unregistered") {
        "You have been signed off because you've signed in at another location"
    } else if event.eq_ignore_ascii_case("rejected") {
        "User disabled"
    } else if event.eq_ignore_ascii_case("deactivated") {
        "User moved"
    } else {
        "no reason given"
    }
}

/// Parse a directory-search SOAP response into attribute rows.
pub fn parse_search_results(xml: &str) -> Vec<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut rows = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name();
                let local = name.as_ref().rsplit(|b| *b == b':').next().unwrap_or(b"");
                if local == b"row" {
                    let mut row = Vec::new();
                    for a in e.attributes().flatten() {
                        let key = a.key.as_ref().rsplit(|b| *b == b':').next().unwrap_or(b"");
                        if let (Ok(k), Ok(v)) = (
                            std::str::from_utf8(key),
                            a.unescape_value().map(|v| v.into_owned()),
                        ) {
                            row.push((k.to_string(), v));
                        }
                    }
                    if !row.is_empty() {
                        rows.push(row);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    rows
}
