//! SIP/SIMPLE protocol engine for OCS/LCS.

pub mod account;
pub mod auth;
pub mod dialog;
pub mod im;
pub mod message;
pub mod presence;
pub mod registrar;
pub mod resolve;
pub mod roster;
pub mod soap;
pub mod subscribe;
pub mod transaction;
pub mod transport;
pub mod types;

// Re-exports
pub use account::{spawn, Account, AccountHandle};
pub use auth::{
    AuthError, AuthKind, AuthState, InitializedContext, NullProvider, SecurityContext,
    SecurityProvider, SecuritySetup,
};
pub use dialog::{Dialog, ImSession, SessionStore};
pub use message::{parse_datagram, parse_message, Headers, ParseError, SipMessage};
pub use presence::{PresenceDocument, PresenceUpdate};
pub use registrar::{RegisterState, ServerCapabilities};
pub use resolve::{
    resolve_connection_target, ConnectionTarget, NoSrvResolver, SrvResolver, SrvTarget,
};
pub use roster::{Buddy, BuddyTable, Group, GroupList};
pub use transaction::{ResponseHandler, Transaction, TransactionStore};
pub use transport::{TransportKind, Wire, WireError, WireEvent};
pub use types::Activity;
