//! Events flowing between the protocol engine and the host IM framework.
//!
//! The engine never talks to UI directly: everything user-visible leaves as a
//! `ClientEvent` on an unbounded channel, and everything user-initiated
//! arrives as a `Command`. Both are plain data so hosts can bridge them to
//! whatever widget toolkit or bot framework they embed the engine in.

use crate::sip::types::Activity;

/// Engine → host notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Transport is up and the first REGISTER went out.
    Connecting,
    /// Registration succeeded; the account is usable.
    Registered,
    /// The account is gone. `fatal` means the host should not auto-reconnect
    /// (wrong password, rejected by server).
    Terminated { reason: String, fatal: bool },

    /// A contact's presence changed.
    BuddyStatus {
        uri: String,
        activity: Activity,
        note: Option<String>,
        device_name: Option<String>,
    },
    /// The server supplied a display name for a contact whose local alias is
    /// still the bare URI.
    AliasUpdate { uri: String, display_name: String },
    /// The roaming contact list finished a reconciliation pass.
    RosterUpdated,
    /// A server-side group appeared or was renamed.
    GroupAdded { id: i32, name: String },
    /// A contact present locally but absent from the server roster was
    /// dropped during reconciliation.
    BuddyRemoved { uri: String },

    /// Incoming instant message. `chat_id` is set for multiparty sessions.
    ImReceived {
        from: String,
        text: String,
        chat_id: Option<u32>,
    },
    /// A message could not be delivered to every recipient.
    ImUndelivered { with: String, text: String },
    /// Peer started composing.
    Typing { from: String },
    /// Peer stopped composing.
    TypingStopped { from: String },

    /// An ad-hoc multiparty conversation opened.
    ChatOpened { chat_id: u32 },
    ChatUserJoined { chat_id: u32, uri: String },
    ChatUserLeft { chat_id: u32, uri: String },

    /// Someone wants to subscribe to our presence; reply with
    /// `Command::AuthorizeWatcher`.
    AuthorizationRequested {
        uri: String,
        display_name: Option<String>,
        on_list: bool,
    },

    /// Rows from a directory search, one map-like row per match.
    SearchResults { rows: Vec<Vec<(String, String)>> },
}

/// Host → engine requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendIm { to: String, text: String },
    SendChat { chat_id: u32, text: String },
    SendTyping { to: String },
    CloseIm { with: String },
    LeaveChat { chat_id: u32 },

    SetStatus { activity: Activity, note: Option<String> },

    AddBuddy { uri: String, group: String },
    RemoveBuddy { uri: String, group: Option<String> },
    MoveBuddy {
        uri: String,
        old_group: Option<String>,
        new_group: String,
    },
    RenameGroup { old_name: String, new_name: String },
    RemoveGroup { name: String },

    AuthorizeWatcher { uri: String, allow: bool },

    /// AD search; rows are (attribute, value) pairs, e.g.
    /// `("displayName", "Ali*")`.
    Search { rows: Vec<(String, String)> },

    /// Graceful sign-out: BYE all dialogs, deregister, tear down.
    Quit,
}
