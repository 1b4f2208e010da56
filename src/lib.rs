pub mod config;
pub mod events;
pub mod sched;
pub mod sip;

pub use config::{AccountConfig, ConfigError, TransportSetting};
pub use events::{ClientEvent, Command};
pub use sched::{ScheduledKind, Scheduler};
pub use sip::{Account, AccountHandle, Activity, NoSrvResolver, NullProvider};
