//! End-to-end protocol flows driven against a detached account: requests are
//! read back off the transmit queue and server responses are injected
//! directly, so every scenario runs without sockets.

use bytes::BytesMut;
use ocsip::events::{ClientEvent, Command};
use ocsip::sip::auth::{
    AuthError, InitializedContext, SecurityContext, SecurityProvider, SecuritySetup,
};
use ocsip::sip::message::{find_part, parse_message, SipMessage};
use ocsip::sip::registrar::RegisterState;
use ocsip::sip::Account;
use ocsip::AccountConfig;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct TestContext;

impl SecurityContext for TestContext {
    fn step(&mut self, _inbound: &str) -> Result<String, AuthError> {
        Ok("U1RFUDI=".into())
    }
    fn sign(&mut self, canonical: &str) -> Result<String, AuthError> {
        Ok(format!("sig-{}", canonical.len()))
    }
    fn verify(&self, canonical: &str, signature: &str) -> Result<bool, AuthError> {
        Ok(signature == format!("sig-{}", canonical.len()))
    }
}

struct TestProvider;

impl SecurityProvider for TestProvider {
    fn init_context(&self, _setup: &SecuritySetup<'_>) -> Result<InitializedContext, AuthError> {
        Ok(InitializedContext {
            context: Box::new(TestContext),
            token: "VE9LRU4x".into(),
            expires: Some(4_000_000_000),
        })
    }
}

fn parse(raw: &str) -> SipMessage {
    let mut buf = BytesMut::from(raw);
    parse_message(&mut buf)
        .expect("crafted message parses")
        .expect("crafted message complete")
}

fn new_account() -> (Account, UnboundedReceiver<ClientEvent>) {
    let cfg = AccountConfig::from_signin_name("me@ocs.example.com,CORP\\me", "secret")
        .expect("valid sign-in");
    Account::new_detached(cfg, Arc::new(TestProvider))
}

fn drain(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn ok_response(request: &SipMessage, extra: &str, body: &str) -> String {
    format!(
        "SIP/2.0 200 OK\r\nFrom: {}\r\nTo: {};tag=srv{}\r\nCall-ID: {}\r\nCSeq: {}\r\n{}Content-Length: {}\r\n\r\n{}",
        request.header("From").unwrap_or(""),
        request.header("To").unwrap_or(""),
        request.cseq_number().unwrap_or(0),
        request.header("Call-ID").unwrap_or(""),
        request.cseq_token().unwrap_or(""),
        extra,
        body.len(),
        body
    )
}

/// Drive the NTLM handshake to a registered account with the given server
/// capability headers; returns the post-registration outgoing requests.
fn register(acc: &mut Account, capability_headers: &str) -> Vec<SipMessage> {
    acc.do_register(None);
    let first = acc.take_outgoing().remove(0);

    let challenge = format!(
        "SIP/2.0 401 Unauthorized\r\nCSeq: {}\r\n\
         WWW-Authenticate: NTLM realm=\"SIP Communications Service\", targetname=\"sip/srv.ocs.example.com\", gssapi-data=\"\", opaque=\"A\"\r\n\
         Content-Length: 0\r\n\r\n",
        first.cseq_token().unwrap()
    );
    acc.handle_message(parse(&challenge));

    let second = acc.take_outgoing().remove(0);
    assert!(second
        .header("Authorization")
        .expect("credentialed REGISTER")
        .contains("gssapi-data=\"VE9LRU4x\""));

    // The server echoes our device Contact with a GRUU attached.
    let uuid = second
        .header("Contact")
        .and_then(|c| find_part(c, "urn:uuid:", Some(">")))
        .expect("device contact has uuid");
    let ok = format!(
        "SIP/2.0 200 OK\r\nCSeq: {}\r\nExpires: 600\r\n\
         Contact: <sip:me@10.0.0.1>;+sip.instance=\"<urn:uuid:{}>\";gruu=\"sip:me@ocs.example.com;opaque=app:{}\"\r\n\
         {}Content-Length: 0\r\n\r\n",
        second.cseq_token().unwrap(),
        uuid,
        uuid,
        capability_headers
    );
    acc.handle_message(parse(&ok));
    assert_eq!(acc.register_state(), RegisterState::Registered);
    acc.take_outgoing()
}

const OCS2007_CAPS: &str = "Supported: adhoclist, msrtc-event-categories\r\n\
    Allow-Events: vnd-microsoft-roaming-contacts, vnd-microsoft-roaming-self, vnd-microsoft-roaming-ACL\r\n\
    Allow-Events: vnd-microsoft-provisioning-v2, presence.wpending, presence\r\n\
    ms-keep-alive: UAS; tcp=yes; hop-hop=yes; timeout=300\r\n";

#[test]
fn register_cascade_subscribes_advertised_events() {
    let (mut acc, mut rx) = new_account();
    let after = register(&mut acc, OCS2007_CAPS);

    let events_subscribed: Vec<&str> = after
        .iter()
        .filter(|m| m.method == "SUBSCRIBE")
        .filter_map(|m| m.header("Event"))
        .collect();
    assert!(events_subscribed.contains(&"vnd-microsoft-roaming-contacts"));
    assert!(events_subscribed.contains(&"vnd-microsoft-roaming-ACL"));
    assert!(events_subscribed.contains(&"vnd-microsoft-roaming-self"));
    assert!(events_subscribed.contains(&"vnd-microsoft-provisioning-v2"));
    assert!(events_subscribed.contains(&"presence.wpending"));

    // Every subscription announces best-effort notify support.
    for msg in after.iter().filter(|m| m.method == "SUBSCRIBE") {
        assert!(msg.headers.all("Supported").any(|v| v == "ms-benotify"));
        assert!(msg
            .headers
            .all("Supported")
            .any(|v| v == "ms-piggyback-first-notify"));
        assert_eq!(msg.header("Proxy-Require"), Some("ms-benotify"));
    }

    // OCS 2007: initial presence goes out as a category publication.
    let publish = after
        .iter()
        .find(|m| m.method == "SERVICE")
        .expect("initial presence publication");
    assert!(publish.body_str().contains("version=\"0\""));

    // Refresh timers armed.
    assert!(acc.has_scheduled("<registration>"));
    assert!(acc.has_scheduled("<+reauthentication>"));
    assert!(acc.has_scheduled("<keepalive>"));

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ClientEvent::Registered)));
    assert!(acc.capabilities().msrtc_event_categories);
    assert!(acc.capabilities().batched_support);
}

#[test]
fn register_redirect_carries_new_home() {
    let (mut acc, _rx) = new_account();
    acc.do_register(None);
    let reg = acc.take_outgoing().remove(0);
    let raw = format!(
        "SIP/2.0 301 Redirect\r\nCSeq: {}\r\nContact: <sip:pool.example.com:5061;transport=tls>\r\nContent-Length: 0\r\n\r\n",
        reg.cseq_token().unwrap()
    );
    acc.handle_message(parse(&raw));
    let redirect = acc.pending_reconnect().expect("reconnect planned");
    assert_eq!(redirect.host, "pool.example.com");
    assert_eq!(redirect.port, Some(5061));
}

#[test]
fn first_im_rides_the_invite() {
    let (mut acc, _rx) = new_account();
    acc.send_im("sip:alice@ocs.example.com", "hi");

    let invite = acc.take_outgoing().remove(0);
    assert_eq!(invite.method, "INVITE");
    let text_format = invite.header("ms-text-format").expect("first message");
    // base64("hi")
    assert!(text_format.contains("ms-body=aGk="));
    assert!(invite.body_str().contains("m=message"));

    let ok = ok_response(
        &invite,
        "Supported: ms-text-format\r\nContact: <sip:alice@10.0.0.9:5061;transport=tls>\r\n",
        "",
    );
    acc.handle_message(parse(&ok));

    let followup = acc.take_outgoing();
    // The INVITE delivered the message: ACK only, no MESSAGE.
    assert_eq!(followup.len(), 1);
    assert_eq!(followup[0].method, "ACK");
    assert_eq!(followup[0].header("Call-ID"), invite.header("Call-ID"));
}

#[test]
fn queued_messages_flow_after_invite_without_text_format() {
    let (mut acc, _rx) = new_account();
    acc.send_im("sip:alice@ocs.example.com", "hi");
    let invite = acc.take_outgoing().remove(0);

    // Peer without ms-text-format: the queued message must follow as MESSAGE.
    let ok = ok_response(&invite, "Contact: <sip:alice@10.0.0.9>\r\n", "");
    acc.handle_message(parse(&ok));

    let followup = acc.take_outgoing();
    let methods: Vec<&str> = followup.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(methods, vec!["ACK", "MESSAGE"]);
    assert_eq!(followup[1].body_str(), "hi");

    // Confirm delivery; the unconfirmed entry clears and nothing further
    // goes out.
    let ok_msg = ok_response(&followup[1], "", "");
    acc.handle_message(parse(&ok_msg));
    assert!(acc.take_outgoing().is_empty());
    assert_eq!(acc.session_count(), 1);
}

#[test]
fn undelivered_message_destroys_session() {
    let (mut acc, mut rx) = new_account();
    acc.send_im("sip:alice@ocs.example.com", "hi");
    let invite = acc.take_outgoing().remove(0);
    let ok = ok_response(&invite, "Contact: <sip:alice@10.0.0.9>\r\n", "");
    acc.handle_message(parse(&ok));
    let message = acc
        .take_outgoing()
        .into_iter()
        .find(|m| m.method == "MESSAGE")
        .expect("queued message sent");

    let failure = format!(
        "SIP/2.0 480 Temporarily Unavailable\r\nFrom: {}\r\nTo: {};tag=s\r\nCall-ID: {}\r\nCSeq: {}\r\nContent-Length: 0\r\n\r\n",
        message.header("From").unwrap(),
        message.header("To").unwrap(),
        message.header("Call-ID").unwrap(),
        message.cseq_token().unwrap()
    );
    acc.handle_message(parse(&failure));

    assert_eq!(acc.session_count(), 0);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ClientEvent::ImUndelivered { with, text } if with == "sip:alice@ocs.example.com" && text == "hi"
    )));
}

/// Build the incoming INVITE that upgrades an existing 1:1 session.
fn multiparty_invite(callid: &str, from_tag: &str) -> String {
    let sdp = "v=0\r\no=- 0 0 IN IP4 10.0.0.9\r\ns=session\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\nm=message 5061 sip sip:alice@ocs.example.com\r\n";
    format!(
        "INVITE sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:alice@ocs.example.com>;tag={};epid=aa11\r\n\
         To: <sip:me@ocs.example.com>\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@10.0.0.9>\r\n\
         EndPoints: <sip:alice@ocs.example.com>, <sip:bob@ocs.example.com>;epid=ebca82d94d, <sip:me@ocs.example.com>\r\n\
         Roster-Manager: sip:alice@ocs.example.com\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        from_tag,
        callid,
        sdp.len(),
        sdp
    )
}

#[test]
fn multiparty_upgrade_sends_triggered_invite() {
    let (mut acc, mut rx) = new_account();

    // Established 1:1 with alice.
    acc.send_im("sip:alice@ocs.example.com", "hi");
    let invite = acc.take_outgoing().remove(0);
    let callid = invite.header("Call-ID").unwrap().to_string();
    let ok = ok_response(
        &invite,
        "Supported: ms-text-format\r\nContact: <sip:alice@10.0.0.9>\r\n",
        "",
    );
    acc.handle_message(parse(&ok));
    let _ = acc.take_outgoing();
    drain(&mut rx);

    // Alice escalates the same Call-ID to a three-way conversation.
    acc.handle_message(parse(&multiparty_invite(&callid, "77aa")));

    let out = acc.take_outgoing();
    let triggered = out
        .iter()
        .find(|m| m.method == "INVITE")
        .expect("triggered INVITE to the third party");
    assert_eq!(triggered.target, "sip:bob@ocs.example.com");
    assert_eq!(triggered.header("TriggeredInvite"), Some("TRUE"));
    assert_eq!(triggered.header("Require"), Some("com.microsoft.rtc-multiparty"));
    assert_eq!(triggered.header("Call-ID"), Some(callid.as_str()));

    let answer = out
        .iter()
        .find(|m| m.response == 200)
        .expect("200 OK to the escalating INVITE");
    assert!(answer.headers.all("Supported").any(|v| v == "com.microsoft.rtc-multiparty"));
    assert!(answer
        .header("To")
        .map(|v| v.contains("tag="))
        .unwrap_or(false));
    // Headers that must not be echoed back.
    assert!(answer.header("EndPoints").is_none());
    assert!(answer.header("Roster-Manager").is_none());

    let idx = acc.sessions().find_chat(&callid).expect("chat session");
    let session = acc.sessions().get(idx).unwrap();
    assert!(session.multiparty);
    assert_eq!(
        session.roster_manager.as_deref(),
        Some("sip:alice@ocs.example.com")
    );

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ClientEvent::ChatOpened { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::ChatUserJoined { uri, .. } if uri == "sip:alice@ocs.example.com"
    )));
}

#[test]
fn roster_manager_transfer() {
    let (mut acc, _rx) = new_account();
    acc.send_im("sip:alice@ocs.example.com", "hi");
    let invite = acc.take_outgoing().remove(0);
    let callid = invite.header("Call-ID").unwrap().to_string();
    let ok = ok_response(&invite, "Contact: <sip:alice@10.0.0.9>\r\n", "");
    acc.handle_message(parse(&ok));
    let _ = acc.take_outgoing();
    acc.handle_message(parse(&multiparty_invite(&callid, "77aa")));
    let _ = acc.take_outgoing();

    // Bob bids for roster manager through us.
    let request_rm = "<?xml version=\"1.0\"?>\r\n<action xmlns=\"http://schemas.microsoft.com/sip/multiparty/\"><RequestRM uri=\"sip:bob@ocs.example.com\" bid=\"1\"/></action>\r\n";
    let info = format!(
        "INFO sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:bob@ocs.example.com>;tag=b1\r\nTo: <sip:me@ocs.example.com>;tag=m1\r\n\
         Call-ID: {}\r\nCSeq: 3 INFO\r\nContent-Type: application/x-ms-mim\r\n\
         Content-Length: {}\r\n\r\n{}",
        callid,
        request_rm.len(),
        request_rm
    );
    acc.handle_message(parse(&info));
    let reply = acc.take_outgoing().remove(0);
    assert_eq!(reply.response, 200);
    assert!(reply.body_str().contains("<RequestRMResponse uri=\"sip:me@ocs.example.com\" allow=\"true\"/>"));

    // The accepted bidder announces itself.
    let set_rm = "<?xml version=\"1.0\"?>\r\n<action xmlns=\"http://schemas.microsoft.com/sip/multiparty/\"><SetRM uri=\"sip:bob@ocs.example.com\"/></action>\r\n";
    let info2 = format!(
        "INFO sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:bob@ocs.example.com>;tag=b1\r\nTo: <sip:me@ocs.example.com>;tag=m1\r\n\
         Call-ID: {}\r\nCSeq: 4 INFO\r\nContent-Type: application/x-ms-mim\r\n\
         Content-Length: {}\r\n\r\n{}",
        callid,
        set_rm.len(),
        set_rm
    );
    acc.handle_message(parse(&info2));
    let reply2 = acc.take_outgoing().remove(0);
    assert!(reply2.body_str().contains("<SetRMResponse uri=\"sip:me@ocs.example.com\"/>"));

    let idx = acc.sessions().find_chat(&callid).unwrap();
    assert_eq!(
        acc.sessions().get(idx).unwrap().roster_manager.as_deref(),
        Some("sip:bob@ocs.example.com")
    );

    // A BYE from the roster manager clears the role.
    let bye = format!(
        "BYE sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:bob@ocs.example.com>;tag=b1\r\nTo: <sip:me@ocs.example.com>;tag=m1\r\n\
         Call-ID: {}\r\nCSeq: 5 BYE\r\nContent-Length: 0\r\n\r\n",
        callid
    );
    acc.handle_message(parse(&bye));
    let idx = acc.sessions().find_chat(&callid).expect("chat survives");
    assert_eq!(acc.sessions().get(idx).unwrap().roster_manager, None);
}

#[test]
fn publish_conflict_clears_and_retries() {
    let (mut acc, _rx) = new_account();
    let after = register(&mut acc, OCS2007_CAPS);
    let publish = after
        .into_iter()
        .find(|m| m.method == "SERVICE")
        .expect("initial publish");

    let conflict = format!(
        "SIP/2.0 409 Conflict\r\nCSeq: {}\r\nContent-Length: 0\r\n\r\n",
        publish.cseq_token().unwrap()
    );
    acc.handle_message(parse(&conflict));

    let clear = acc.take_outgoing().remove(0);
    assert_eq!(clear.method, "SERVICE");
    assert!(clear.body_str().contains("expires=\"0\""));

    let ok = format!(
        "SIP/2.0 200 OK\r\nCSeq: {}\r\nContent-Length: 0\r\n\r\n",
        clear.cseq_token().unwrap()
    );
    acc.handle_message(parse(&ok));

    let republished = acc.take_outgoing().remove(0);
    assert_eq!(republished.method, "SERVICE");
    // Version restarted from zero.
    assert!(republished.body_str().contains("version=\"0\""));
}

const ROAMING_CONTACTS: &str = r#"<contactList deltaNum="7">
<group id="1" name="~"/>
<group id="2" name="Colleagues"/>
<contact uri="bob@ocs.example.com" name="Bob B" groups="2"/>
<contact uri="carol@ocs.example.com"/>
</contactList>"#;

#[test]
fn roaming_contacts_build_roster_and_batch_subscribe() {
    let (mut acc, mut rx) = new_account();
    let _ = register(&mut acc, OCS2007_CAPS);
    drain(&mut rx);

    let notify = format!(
        "BENOTIFY sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:me@ocs.example.com>;tag=s\r\nTo: <sip:me@ocs.example.com>;tag=c\r\n\
         Call-ID: rc1\r\nCSeq: 1 BENOTIFY\r\nEvent: vnd-microsoft-roaming-contacts\r\n\
         Content-Type: application/vnd-microsoft-roaming-contacts+xml\r\n\
         Content-Length: {}\r\n\r\n{}",
        ROAMING_CONTACTS.len(),
        ROAMING_CONTACTS
    );
    acc.handle_message(parse(&notify));

    assert_eq!(acc.buddy_count(), 2);
    assert!(acc.buddies().contains("sip:bob@ocs.example.com"));
    // Contact without groups lands in the synthesized default group.
    assert!(acc.groups().find_by_name("Other Contacts").is_some());
    assert!(acc.groups().find_by_name("Colleagues").is_some());

    let batched = acc
        .take_outgoing()
        .into_iter()
        .find(|m| m.method == "SUBSCRIBE")
        .expect("batched presence subscription");
    assert_eq!(batched.header("Event"), Some("presence"));
    assert!(batched.body_str().contains("sip:bob@ocs.example.com"));
    assert!(batched.body_str().contains("sip:carol@ocs.example.com"));
    assert!(batched.body_str().contains("<batchSub"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ClientEvent::RosterUpdated)));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::GroupAdded { name, .. } if name == "Colleagues"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::AliasUpdate { uri, display_name } if uri == "sip:bob@ocs.example.com" && display_name == "Bob B"
    )));
}

#[test]
fn wpending_watcher_flows_to_acl_decision() {
    let (mut acc, mut rx) = new_account();
    let _ = register(&mut acc, OCS2007_CAPS);
    drain(&mut rx);

    let body = r#"<watchers><watcher uri="sip:eve@ocs.example.com" displayName="Eve E"/></watchers>"#;
    let notify = format!(
        "BENOTIFY sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:me@ocs.example.com>;tag=s\r\nTo: <sip:me@ocs.example.com>;tag=c\r\n\
         Call-ID: wp1\r\nCSeq: 1 BENOTIFY\r\nEvent: presence.wpending\r\n\
         Content-Type: text/xml+msrtc.wpending\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    acc.handle_message(parse(&notify));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::AuthorizationRequested { uri, on_list: false, .. } if uri == "sip:eve@ocs.example.com"
    )));

    let _ = acc.take_outgoing();
    acc.handle_command(Command::AuthorizeWatcher {
        uri: "sip:eve@ocs.example.com".into(),
        allow: true,
    });
    let ace = acc.take_outgoing().remove(0);
    assert_eq!(ace.method, "SERVICE");
    assert!(ace.body_str().contains("<m:rights>AA</m:rights>"));
    assert!(ace.body_str().contains("sip:eve@ocs.example.com"));

    acc.handle_command(Command::AuthorizeWatcher {
        uri: "sip:mallory@ocs.example.com".into(),
        allow: false,
    });
    let ace2 = acc.take_outgoing().remove(0);
    assert!(ace2.body_str().contains("<m:rights>BD</m:rights>"));
}

#[test]
fn roaming_self_acknowledges_new_subscriber() {
    let (mut acc, _rx) = new_account();
    let _ = register(&mut acc, OCS2007_CAPS);
    let _ = acc.take_outgoing();

    let body = r#"<roamingData><subscribers><subscriber user="bob@ocs.example.com" acknowledged="false"/></subscribers></roamingData>"#;
    let notify = format!(
        "BENOTIFY sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:me@ocs.example.com>;tag=s\r\nTo: <sip:me@ocs.example.com>;tag=c\r\n\
         Call-ID: rs1\r\nCSeq: 1 BENOTIFY\r\nEvent: vnd-microsoft-roaming-self\r\n\
         Content-Type: application/vnd-microsoft-roaming-self+xml\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    acc.handle_message(parse(&notify));

    let service = acc.take_outgoing().remove(0);
    assert_eq!(service.method, "SERVICE");
    assert_eq!(
        service.header("Content-Type"),
        Some("application/msrtc-presence-setsubscriber+xml")
    );
    assert!(service
        .body_str()
        .contains("subscriber user=\"bob@ocs.example.com\" acknowledged=\"true\""));
}

#[test]
fn piggybacked_notify_schedules_refresh() {
    let (mut acc, _rx) = new_account();
    let after = register(&mut acc, OCS2007_CAPS);
    let wpending = after
        .iter()
        .find(|m| m.method == "SUBSCRIBE" && m.header("Event") == Some("presence.wpending"))
        .expect("wpending subscription");

    // 200 OK carrying the first notify piggybacked.
    let ok = format!(
        "SIP/2.0 200 OK\r\nCSeq: {}\r\nExpires: 300\r\nEvent: presence.wpending\r\n\
         ms-piggyback-cseq: 101\r\nContent-Type: text/xml+msrtc.wpending\r\nContent-Length: 0\r\n\r\n",
        wpending.cseq_token().unwrap()
    );
    acc.handle_message(parse(&ok));

    // Refresh lands one minute ahead of expiry.
    assert!(acc.has_scheduled("<presence.wpending>"));
}

#[test]
fn dereg_notify_terminates_with_reason() {
    let (mut acc, mut rx) = new_account();
    let _ = register(&mut acc, OCS2007_CAPS);
    drain(&mut rx);

    let body = "deregistered;event=rejected";
    let notify = format!(
        "NOTIFY sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:me@ocs.example.com>;tag=s\r\nTo: <sip:me@ocs.example.com>;tag=c\r\n\
         Call-ID: rn1\r\nCSeq: 1 NOTIFY\r\nEvent: registration-notify\r\n\
         Content-Type: text/registration-event\r\nsubscription-state: terminated;expires=0\r\n\
         ms-diagnostics-public: 4141;reason=\"User disabled\"\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    acc.handle_message(parse(&notify));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Terminated { reason, fatal: true } if reason.contains("User disabled")
    )));
}

#[test]
fn typing_notifications_round_trip() {
    let (mut acc, mut rx) = new_account();
    acc.send_im("sip:alice@ocs.example.com", "hi");
    let invite = acc.take_outgoing().remove(0);
    let ok = ok_response(
        &invite,
        "Supported: ms-text-format\r\nContact: <sip:alice@10.0.0.9>\r\n",
        "",
    );
    acc.handle_message(parse(&ok));
    let _ = acc.take_outgoing();
    drain(&mut rx);

    // Outgoing typing notification within the established dialog.
    acc.handle_command(Command::SendTyping {
        to: "sip:alice@ocs.example.com".into(),
    });
    let info = acc.take_outgoing().remove(0);
    assert_eq!(info.method, "INFO");
    assert!(info.body_str().contains("KeyboardActivity"));

    // Incoming iscomposing MESSAGE maps to a typing event.
    let composing = r#"<?xml version="1.0"?><isComposing><state>active</state></isComposing>"#;
    let message = format!(
        "MESSAGE sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:alice@ocs.example.com>;tag=a\r\nTo: <sip:me@ocs.example.com>;tag=m\r\n\
         Call-ID: {}\r\nCSeq: 7 MESSAGE\r\nContent-Type: application/im-iscomposing+xml\r\n\
         Content-Length: {}\r\n\r\n{}",
        invite.header("Call-ID").unwrap(),
        composing.len(),
        composing
    );
    acc.handle_message(parse(&message));
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ClientEvent::Typing { from } if from == "sip:alice@ocs.example.com"
    )));
}

#[test]
fn incoming_invite_with_wrong_media_is_rejected() {
    let (mut acc, _rx) = new_account();
    let sdp = "v=0\r\nm=audio 49170 RTP/AVP 0\r\n";
    let invite = format!(
        "INVITE sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:alice@ocs.example.com>;tag=a\r\nTo: <sip:me@ocs.example.com>\r\n\
         Call-ID: av1\r\nCSeq: 1 INVITE\r\nContent-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    );
    acc.handle_message(parse(&invite));
    let out = acc.take_outgoing();
    assert_eq!(out[0].response, 501);
    assert_eq!(acc.session_count(), 0);
}

#[test]
fn incoming_invite_first_message_is_delivered() {
    let (mut acc, mut rx) = new_account();
    let sdp = "v=0\r\nm=message 5061 sip sip:alice@ocs.example.com\r\n";
    let invite = format!(
        "INVITE sip:me@ocs.example.com SIP/2.0\r\n\
         From: <sip:alice@ocs.example.com>;tag=a;epid=ae\r\nTo: <sip:me@ocs.example.com>\r\n\
         Call-ID: im1\r\nCSeq: 1 INVITE\r\n\
         ms-text-format: text/plain; charset=UTF-8;msgr=WAAtAE0A;ms-body=SGk=\r\n\
         Contact: <sip:alice@10.0.0.9>\r\nContent-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    );
    acc.handle_message(parse(&invite));

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ClientEvent::ImReceived { from, text, chat_id: None } if from == "sip:alice@ocs.example.com" && text == "Hi"
    )));
    let answer = acc.take_outgoing().remove(0);
    assert_eq!(answer.response, 200);
    // Accepting the inline message is advertised back.
    assert!(answer.headers.all("Supported").any(|v| v == "ms-text-format"));
    assert!(answer.body_str().contains("m=message"));
}
