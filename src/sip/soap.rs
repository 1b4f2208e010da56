//! SOAP bodies carried by the SERVICE method.
//!
//! OCS/LCS contact-list and presence management is SOAP-over-SIP: a SERVICE
//! request with `Content-Type: application/SOAP+xml` and one operation per
//! body. Counters (`deltaNum`) are owned by the caller and must increase per
//! mutation within a session.

use quick_xml::escape::escape;

const ENVELOPE_OPEN: &str = "<SOAP-ENV:Envelope xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\" xmlns:m=\"http://schemas.microsoft.com/winrtc/2002/11/sip\"><SOAP-ENV:Body>";
const ENVELOPE_CLOSE: &str = "</SOAP-ENV:Body></SOAP-ENV:Envelope>";

fn envelope(body: &str) -> String {
    format!("{}{}{}", ENVELOPE_OPEN, body, ENVELOPE_CLOSE)
}

pub fn add_group(name: &str, delta: u32) -> String {
    envelope(&format!(
        "<m:addGroup><m:name>{}</m:name><m:externalURI/><m:deltaNum>{}</m:deltaNum></m:addGroup>",
        escape(name),
        delta
    ))
}

pub fn modify_group(group_id: i32, name: &str, delta: u32) -> String {
    envelope(&format!(
        "<m:modifyGroup><m:groupID>{}</m:groupID><m:name>{}</m:name><m:externalURI/><m:deltaNum>{}</m:deltaNum></m:modifyGroup>",
        group_id,
        escape(name),
        delta
    ))
}

pub fn delete_group(group_id: i32, delta: u32) -> String {
    envelope(&format!(
        "<m:deleteGroup><m:groupID>{}</m:groupID><m:deltaNum>{}</m:deltaNum></m:deleteGroup>",
        group_id, delta
    ))
}

/// Create or update a contact. `groups` is the space-separated list of group
/// ids the contact belongs to, e.g. `"2 4"`.
pub fn set_contact(display_name: &str, groups: &str, subscribed: bool, uri: &str, delta: u32) -> String {
    envelope(&format!(
        "<m:setContact><m:displayName>{}</m:displayName><m:groups>{}</m:groups><m:subscribed>{}</m:subscribed><m:URI>{}</m:URI><m:externalURI/><m:deltaNum>{}</m:deltaNum></m:setContact>",
        escape(display_name),
        escape(groups),
        subscribed,
        escape(uri),
        delta
    ))
}

pub fn delete_contact(uri: &str, delta: u32) -> String {
    envelope(&format!(
        "<m:deleteContact><m:URI>{}</m:URI><m:deltaNum>{}</m:deltaNum></m:deleteContact>",
        escape(uri),
        delta
    ))
}

/// Access-control entry. `rights` is `"AA"` (allow) or `"BD"` (block).
pub fn set_ace(uri: &str, rights: &str, delta: u32) -> String {
    envelope(&format!(
        "<m:setACE><m:scope>USER</m:scope><m:rights>{}</m:rights><m:entity>{}</m:entity><m:deltaNum>{}</m:deltaNum></m:setACE>",
        escape(rights),
        escape(uri),
        delta
    ))
}

/// LCS 2005 presence publication.
pub fn set_presence(presentity_uri: &str, availability: i32, activity: i32, note: &str) -> String {
    envelope(&format!(
        "<m:setPresence><m:presentity m:uri=\"{}\"><m:availability m:aggregate=\"{}\"/><m:activity m:aggregate=\"{}\"/>\
         <userInfo xmlns=\"http://schemas.microsoft.com/2002/09/sip/presence\"><note>{}</note></userInfo>\
         </m:presentity></m:setPresence>",
        escape(presentity_uri),
        availability,
        activity,
        escape(note)
    ))
}

/// Acknowledge a subscriber reported by roaming-self.
pub fn set_subscribers(user: &str) -> String {
    format!(
        "<setSubscribers xmlns=\"http://schemas.microsoft.com/2006/09/sip/presence-subscribers\"><subscriber user=\"{}\" acknowledged=\"true\"/></setSubscribers>",
        escape(user)
    )
}

/// One filter row of a directory search.
pub fn search_row(attribute: &str, value: &str) -> String {
    format!(
        "<m:row m:attrib=\"{}\" m:value=\"{}\"/>",
        escape(attribute),
        escape(value)
    )
}

/// AD directory search over the rows built with [`search_row`].
pub fn directory_search(max_results: u32, rows: &str) -> String {
    envelope(&format!(
        "<m:directorySearch><m:filter m:href=\"#searchArray\"/><m:maxResults>{}</m:maxResults></m:directorySearch><m:Array m:id=\"searchArray\">{}</m:Array>",
        max_results, rows
    ))
}

/// Read the server-assigned `groupID` out of an addGroup 200 response.
pub fn parse_add_group_response(xml: &str) -> Option<i32> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_group_id = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = e.name();
                let local = name.as_ref().rsplit(|b| *b == b':').next().unwrap_or(b"");
                in_group_id = local == b"groupID";
            }
            Ok(Event::End(_)) => in_group_id = false,
            Ok(Event::Text(t)) => {
                if in_group_id {
                    return t.unescape().ok()?.trim().parse().ok();
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}
