//! Presence body decoding and publication encoding.
//!
//! Three inbound encodings are understood:
//!
//! - msrtc category documents (`application/msrtc-event-categories+xml`),
//!   per-contact `<categories>` with `state/availability` and `note/body`;
//! - legacy MSRTC presentity documents (`text/xml+msrtc.pidf`) with
//!   `availability`/`activity` aggregates and the LegacyInterop states;
//! - PIDF (`application/pidf+xml` and friends) as the fallback.
//!
//! Batched NOTIFYs wrap these in `multipart/related`; RLMI resource lists
//! (`application/rlmi+xml`) carry `state="resubscribe"` instances that drive
//! per-pool resubscription.

use super::types::Activity;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

/// Decoded presence for one contact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceUpdate {
    pub uri: String,
    pub activity: Option<Activity>,
    pub note: Option<String>,
    pub device_name: Option<String>,
    pub display_name: Option<String>,
}

/// A `state="resubscribe"` instance from an RLMI list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResubEntry {
    pub uri: String,
    pub pool_fqdn: Option<String>,
}

/// Everything extracted from one presence NOTIFY body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PresenceDocument {
    pub updates: Vec<PresenceUpdate>,
    pub resubscribe: Vec<ResubEntry>,
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

fn local_name(raw: &[u8]) -> Vec<u8> {
    match raw.iter().rposition(|b| *b == b':') {
        Some(idx) => raw[idx + 1..].to_vec(),
        None => raw.to_vec(),
    }
}

// =============================================================================
// CATEGORY DOCUMENT (msrtc-event-categories)
// =============================================================================

/// Parse a `<categories uri="...">` document: category `state` carries the
/// aggregate availability, category `note` the annotation.
pub fn parse_categories(xml: &str) -> Option<PresenceUpdate> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut update = PresenceUpdate::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut in_note_category = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == b"categories" {
                    update.uri = attr(&e, "uri").unwrap_or_default();
                } else if name == b"category" {
                    in_note_category = attr(&e, "name").as_deref() == Some("note");
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?.into_owned();
                match path.last().map(|n| n.as_slice()) {
                    Some(b"availability") => {
                        if let Ok(avail) = text.trim().parse::<i32>() {
                            update.activity = Some(Activity::from_avail(avail));
                        }
                    }
                    Some(b"body") if in_note_category => {
                        update.note = Some(text);
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    if update.uri.is_empty() {
        None
    } else {
        Some(update)
    }
}

// =============================================================================
// RLMI RESOURCE LIST (resubscribe instances)
// =============================================================================

pub fn parse_resubscribe_list(xml: &str) -> Vec<ResubEntry> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current_uri: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = local_name(e.name().as_ref());
                if name == b"resource" {
                    current_uri = attr(e, "uri");
                } else if name == b"instance" {
                    let state = attr(e, "state").unwrap_or_default();
                    if state.contains("resubscribe") {
                        if let Some(uri) = current_uri.clone() {
                            entries.push(ResubEntry {
                                uri,
                                pool_fqdn: attr(e, "poolFqdn"),
                            });
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    entries
}

// =============================================================================
// MSRTC PRESENTITY (text/xml+msrtc.pidf)
// =============================================================================

fn msrtc_activity(act: i32, avl: i32, legacy_avail: Option<i32>, ocs2007: bool) -> Activity {
    if ocs2007 {
        let fixed = match (act, avl) {
            (100, 0) => Some(Activity::Offline),
            (100, 300) => Some(Activity::Away),
            (300, 300) => Some(Activity::BeRightBack),
            (400, 300) => Some(Activity::Available),
            (500, 300) => Some(Activity::OnThePhone),
            (600, 300) => Some(Activity::Busy),
            (0, 0) => legacy_avail.and_then(|avail| match avail {
                18500 => Some(Activity::Offline),
                3500 => Some(Activity::Available),
                15500 => Some(Activity::Away),
                6500 => Some(Activity::Busy),
                12500 => Some(Activity::BeRightBack),
                _ => None,
            }),
            _ => None,
        };
        if let Some(activity) = fixed {
            return activity;
        }
    }

    if avl == 0 {
        return Activity::Offline;
    }
    if act <= 100 {
        Activity::Away
    } else if act <= 150 {
        Activity::OutToLunch
    } else if act <= 300 {
        Activity::BeRightBack
    } else if act <= 400 {
        Activity::Available
    } else if act <= 500 {
        Activity::OnThePhone
    } else if act <= 600 {
        Activity::Busy
    } else {
        Activity::Available
    }
}

/// Parse an MSRTC `<presentity>` document. The `uri` attribute has no `sip:`
/// prefix on the wire; the returned update carries it prefixed.
pub fn parse_msrtc(xml: &str, ocs2007: bool) -> Option<PresenceUpdate> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut update = PresenceUpdate::default();
    let mut availability: i32 = 0;
    let mut activity: i32 = 0;
    let mut legacy_avail: Option<i32> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        let event = reader.read_event();
        match &event {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_slice() {
                    b"presentity" => {
                        let uri = attr(e, "uri").unwrap_or_default();
                        update.uri = if uri.starts_with("sip:") {
                            uri
                        } else {
                            format!("sip:{}", uri)
                        };
                    }
                    b"availability" => {
                        availability = attr(e, "aggregate")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    b"activity" => {
                        activity = attr(e, "aggregate")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    b"displayName" => {
                        update.display_name = attr(e, "displayName");
                    }
                    b"state" if path.iter().any(|p| p == b"userInfo") => {
                        legacy_avail = attr(e, "avail").and_then(|v| v.parse().ok());
                    }
                    b"deviceName" => {
                        update.device_name = attr(e, "name");
                    }
                    _ => {}
                }
                // Only container elements open a scope.
                if matches!(&event, Ok(Event::Start(_))) {
                    path.push(name);
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                if path.last().map(|n| n.as_slice()) == Some(b"note")
                    && path.iter().any(|p| p == b"userInfo")
                {
                    update.note = t.unescape().ok().map(|v| v.into_owned());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    if update.uri.is_empty() {
        return None;
    }
    update.activity = Some(msrtc_activity(activity, availability, legacy_avail, ocs2007));
    Some(update)
}

// =============================================================================
// PIDF (fallback)
// =============================================================================

pub fn parse_pidf(xml: &str) -> Option<PresenceUpdate> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut update = PresenceUpdate::default();
    let mut basic: Option<String> = None;
    let mut pidf_activity: Option<String> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == b"presence" {
                    update.uri = attr(&e, "entity").unwrap_or_default();
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?.into_owned();
                match path.last().map(|n| n.as_slice()) {
                    Some(b"basic") => basic = Some(text),
                    Some(b"activity") => pidf_activity = Some(text),
                    Some(b"display-name") => update.display_name = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    let basic = basic?;
    let online = basic.contains("open");
    update.activity = Some(if online {
        match pidf_activity.as_deref() {
            Some(a) if a.contains("busy") => Activity::Busy,
            Some(a) if a.contains("away") => Activity::Away,
            _ => Activity::Available,
        }
    } else {
        Activity::Offline
    });
    if update.uri.is_empty() {
        return None;
    }
    Some(update)
}

/// `uri` (or `entity`) attribute of a document's root element; identifies
/// which contact a batched part talks about.
pub fn root_uri(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                return attr(e, "uri").or_else(|| attr(e, "entity"));
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

// =============================================================================
// MULTIPART
// =============================================================================

/// Split a `multipart/*` body into `(content-type, content)` parts.
pub fn split_multipart(content_type: &str, body: &str) -> Vec<(String, String)> {
    let boundary = match super::message::find_part(content_type, "boundary=\"", Some("\""))
        .or_else(|| super::message::find_part(content_type, "boundary=", Some(";")))
        .or_else(|| super::message::find_part(content_type, "boundary=", None))
    {
        Some(b) => b,
        None => return Vec::new(),
    };
    let delim = format!("--{}", boundary);

    let mut parts = Vec::new();
    for raw in body.split(delim.as_str()).skip(1) {
        let raw = raw.trim_start_matches("\r\n");
        if raw.starts_with("--") || raw.trim().is_empty() {
            continue;
        }
        let (headers, content) = match raw.split_once("\r\n\r\n") {
            Some(pair) => pair,
            None => continue,
        };
        let ctype = headers
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("Content-Type") {
                    Some(value.trim().to_string())
                } else {
                    None
                }
            })
            .unwrap_or_default();
        let content = content.trim_end_matches(['\r', '\n']);
        parts.push((ctype, content.to_string()));
    }
    parts
}

// =============================================================================
// DOCUMENT DISPATCH
// =============================================================================

/// Decode one presence NOTIFY body according to its content type, recursing
/// into multipart containers. `ocs2007` selects the fixed MSRTC mapping.
pub fn process_presence_document(
    content_type: &str,
    body: &str,
    ocs2007: bool,
) -> PresenceDocument {
    let mut doc = PresenceDocument::default();
    collect_presence(content_type, body, ocs2007, &mut doc);
    doc
}

fn collect_presence(content_type: &str, body: &str, ocs2007: bool, doc: &mut PresenceDocument) {
    let ctype = content_type.to_ascii_lowercase();

    if ctype.contains("multipart") {
        for (part_ctype, part_body) in split_multipart(content_type, body) {
            collect_presence(&part_ctype, &part_body, ocs2007, doc);
        }
    } else if ctype.contains("application/rlmi+xml") {
        doc.resubscribe.extend(parse_resubscribe_list(body));
    } else if ctype.contains("text/xml+msrtc.pidf") {
        if let Some(update) = parse_msrtc(body, ocs2007) {
            doc.updates.push(update);
        }
    } else if ctype.contains("application/msrtc-event-categories+xml") {
        if let Some(update) = parse_categories(body) {
            doc.updates.push(update);
        }
    } else if let Some(update) = parse_pidf(body) {
        doc.updates.push(update);
    } else {
        debug!(%content_type, "presence body not decodable");
    }
}

// =============================================================================
// PUBLICATION ENCODERS
// =============================================================================

/// msrtc category publication (OCS 2007). `version` must increase per
/// publication; a 409 response means the server holds a higher version and
/// the caller should clear and republish from zero.
pub fn category_publish_body(uri: &str, version: u32, code: i32, note: &str) -> String {
    let note = escape(note);
    let state = |instance: &str, container: u32| {
        format!(
            "<publication categoryName=\"state\" instance=\"{}\" container=\"{}\" version=\"{}\" expireType=\"endpoint\">\
             <state xmlns=\"http://schemas.microsoft.com/2006/09/sip/state\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xsi:type=\"aggregateState\">\
             <availability>{}</availability></state></publication>",
            instance, container, version, code
        )
    };
    let note_pub = |container: u32| {
        format!(
            "<publication categoryName=\"note\" instance=\"0\" container=\"{}\" version=\"{}\" expireType=\"static\">\
             <note xmlns=\"http://schemas.microsoft.com/2006/09/sip/note\"><body type=\"personal\" uri=\"\">{}</body></note></publication>",
            container, version, note
        )
    };
    format!(
        "<publish xmlns=\"http://schemas.microsoft.com/2006/09/sip/rich-presence\"><publications uri=\"{}\">{}{}{}{}{}</publications></publish>",
        escape(uri),
        state("906391354", 2),
        state("906391356", 3),
        note_pub(200),
        note_pub(300),
        note_pub(400)
    )
}

/// Clear-presence SERVICE body sent after a 409 version conflict.
pub fn clear_presence_body(uri: &str) -> String {
    let cleared = |instance: &str, container: u32| {
        format!(
            "<publication categoryName=\"state\" instance=\"{}\" container=\"{}\" version=\"0\" expireType=\"endpoint\" expires=\"0\"/>",
            instance, container
        )
    };
    format!(
        "<publish xmlns=\"http://schemas.microsoft.com/2006/09/sip/rich-presence\"><publications uri=\"{}\">{}{}</publications></publish>",
        escape(uri),
        cleared("906391354", 2),
        cleared("906391356", 3)
    )
}
