//! Account configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sign-in name contains invalid characters")]
    InvalidCharacters,
    #[error("sign-in name must be user@domain")]
    MissingDomain,
}

/// Transport selection. `Auto` walks the SRV record candidates in
/// `sip::resolve` and falls back to connecting the SIP domain directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportSetting {
    #[default]
    Auto,
    Tls,
    Tcp,
    Udp,
}

impl std::str::FromStr for TransportSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportSetting::Auto),
            "tls" => Ok(TransportSetting::Tls),
            "tcp" => Ok(TransportSetting::Tcp),
            "udp" => Ok(TransportSetting::Udp),
            other => Err(format!("unknown transport {:?}", other)),
        }
    }
}

/// Everything needed to sign an account in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// SIP address, `user@domain`.
    pub username: String,
    /// Domain part of `username`.
    pub sipdomain: String,
    /// Windows domain for NTLM/Kerberos, from the `domain\user` suffix.
    pub authdomain: Option<String>,
    /// Login account when it differs from the SIP user.
    pub authuser: Option<String>,
    pub password: String,
    pub transport: TransportSetting,
    /// Explicit server host:port, bypassing SRV discovery.
    pub server: Option<String>,
    pub port: Option<u16>,
    pub useragent: String,
}

impl AccountConfig {
    /// Parse a sign-in name of the form `user@domain[,domain\authuser]`.
    pub fn from_signin_name(signin: &str, password: &str) -> Result<Self, ConfigError> {
        if signin.contains(|c: char| c.is_whitespace()) {
            return Err(ConfigError::InvalidCharacters);
        }

        let (address, login) = match signin.split_once(',') {
            Some((a, l)) => (a, Some(l)),
            None => (signin, None),
        };

        let (user, domain) = address.split_once('@').ok_or(ConfigError::MissingDomain)?;
        if user.is_empty() || domain.is_empty() {
            return Err(ConfigError::MissingDomain);
        }

        let (authdomain, authuser) = match login {
            Some(l) => match l.split_once('\\') {
                Some((d, u)) => (Some(d.to_string()), Some(u.to_string())),
                None => (None, Some(l.to_string())),
            },
            None => (None, None),
        };

        Ok(AccountConfig {
            username: address.to_string(),
            sipdomain: domain.to_string(),
            authdomain,
            authuser,
            password: password.to_string(),
            transport: TransportSetting::Auto,
            server: None,
            port: None,
            useragent: format!("ocsip/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Account used for authentication: the explicit login account when one
    /// was given, otherwise the SIP user.
    pub fn effective_authuser(&self) -> &str {
        match &self.authuser {
            Some(u) if !u.is_empty() => u,
            _ => &self.username,
        }
    }

    /// `sip:` URI of the local user.
    pub fn self_uri(&self) -> String {
        format!("sip:{}", self.username)
    }
}
