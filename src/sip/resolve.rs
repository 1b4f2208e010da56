//! Server discovery: SRV service candidates and transport auto-selection.
//!
//! DNS itself is an external collaborator — hosts plug in whatever resolver
//! they have via [`SrvResolver`]. This module owns the *policy*: which
//! records to try, in which order, and what to fall back to when none
//! answer. Lookups may block and are driven through `spawn_blocking`.

use super::transport::TransportKind;
use crate::config::TransportSetting;
use std::sync::Arc;
use tracing::{debug, info};

/// One SRV candidate: `_{service}._{proto}.{domain}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service: &'static str,
    pub proto: &'static str,
    pub kind: TransportKind,
}

const fn rec(service: &'static str, proto: &'static str, kind: TransportKind) -> ServiceRecord {
    ServiceRecord {
        service,
        proto,
        kind,
    }
}

/// Candidate order for automatic transport detection.
pub const SERVICE_AUTODETECT: &[ServiceRecord] = &[
    rec("sipinternaltls", "tcp", TransportKind::Tls),
    rec("sipinternal", "tcp", TransportKind::Tcp),
    rec("sip", "tls", TransportKind::Tls),
    rec("sip", "tcp", TransportKind::Tcp),
];

pub const SERVICE_TLS: &[ServiceRecord] = &[
    rec("sipinternaltls", "tcp", TransportKind::Tls),
    rec("sip", "tls", TransportKind::Tls),
];

pub const SERVICE_TCP: &[ServiceRecord] = &[
    rec("sipinternal", "tcp", TransportKind::Tcp),
    rec("sip", "tcp", TransportKind::Tcp),
];

pub const SERVICE_UDP: &[ServiceRecord] = &[rec("sip", "udp", TransportKind::Udp)];

pub fn candidates_for(setting: TransportSetting) -> &'static [ServiceRecord] {
    match setting {
        TransportSetting::Auto => SERVICE_AUTODETECT,
        TransportSetting::Tls => SERVICE_TLS,
        TransportSetting::Tcp => SERVICE_TCP,
        TransportSetting::Udp => SERVICE_UDP,
    }
}

/// Host/port answer of one SRV lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
}

/// SRV lookup contract. Implementations may block; callers run them off the
/// async executor.
pub trait SrvResolver: Send + Sync {
    /// Resolve `_{service}._{proto}.{domain}`, best targets first. An empty
    /// answer moves resolution on to the next candidate.
    fn lookup_srv(&self, service: &str, proto: &str, domain: &str) -> Vec<SrvTarget>;
}

/// Resolver for environments without SRV support; every lookup is empty, so
/// auto mode always falls back to connecting the SIP domain directly.
pub struct NoSrvResolver;

impl SrvResolver for NoSrvResolver {
    fn lookup_srv(&self, _service: &str, _proto: &str, _domain: &str) -> Vec<SrvTarget> {
        Vec::new()
    }
}

/// Where to actually connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
}

/// Walk the SRV candidates for `setting` and pick the first answer; fall
/// back to the SIP domain itself (TLS in auto mode) when nothing resolves.
pub async fn resolve_connection_target(
    setting: TransportSetting,
    sipdomain: &str,
    resolver: Arc<dyn SrvResolver + 'static>,
) -> ConnectionTarget {
    for record in candidates_for(setting) {
        let (service, proto, domain) = (record.service, record.proto, sipdomain.to_string());
        let res = resolver.clone();
        let answers = tokio::task::spawn_blocking(move || res.lookup_srv(service, proto, &domain))
            .await
            .unwrap_or_default();
        if let Some(target) = answers.into_iter().next() {
            info!(
                srv = format!("_{}._{}.{}", record.service, record.proto, sipdomain),
                host = %target.host,
                port = target.port,
                "SRV record selected"
            );
            return ConnectionTarget {
                host: target.host,
                port: target.port,
                kind: record.kind,
            };
        }
        debug!(
            srv = format!("_{}._{}.{}", record.service, record.proto, sipdomain),
            "no SRV answer"
        );
    }

    // No SRV records: connect the SIP domain directly. OCS pools are rarely
    // reachable over plain TCP from the outside, so auto prefers TLS.
    let kind = match setting {
        TransportSetting::Auto | TransportSetting::Tls => TransportKind::Tls,
        TransportSetting::Tcp => TransportKind::Tcp,
        TransportSetting::Udp => TransportKind::Udp,
    };
    info!(host = sipdomain, transport = kind.descriptor(), "falling back to SIP domain");
    ConnectionTarget {
        host: sipdomain.to_string(),
        port: kind.default_port(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver {
        records: HashMap<String, Vec<SrvTarget>>,
    }

    impl StaticResolver {
        fn new(entries: &[(&str, &str, u16)]) -> Self {
            let mut records = HashMap::new();
            for (name, host, port) in entries {
                records.insert(
                    name.to_string(),
                    vec![SrvTarget {
                        host: host.to_string(),
                        port: *port,
                    }],
                );
            }
            StaticResolver { records }
        }
    }

    impl SrvResolver for StaticResolver {
        fn lookup_srv(&self, service: &str, proto: &str, domain: &str) -> Vec<SrvTarget> {
            self.records
                .get(&format!("_{}._{}.{}", service, proto, domain))
                .cloned()
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_auto_prefers_internal_tls() {
        let resolver = Arc::new(StaticResolver::new(&[
            ("_sipinternaltls._tcp.example.com", "pool.example.com", 5061),
            ("_sip._tcp.example.com", "edge.example.com", 5060),
        ]));
        let target =
            resolve_connection_target(TransportSetting::Auto, "example.com", resolver).await;
        assert_eq!(
            target,
            ConnectionTarget {
                host: "pool.example.com".into(),
                port: 5061,
                kind: TransportKind::Tls
            }
        );
    }

    #[tokio::test]
    async fn test_auto_walks_candidates_in_order() {
        let resolver = Arc::new(StaticResolver::new(&[(
            "_sip._tcp.example.com",
            "edge.example.com",
            5060,
        )]));
        let target =
            resolve_connection_target(TransportSetting::Auto, "example.com", resolver).await;
        assert_eq!(target.host, "edge.example.com");
        assert_eq!(target.kind, TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_fallback_is_domain_tls() {
        let target = resolve_connection_target(
            TransportSetting::Auto,
            "example.com",
            Arc::new(NoSrvResolver),
        )
        .await;
        assert_eq!(
            target,
            ConnectionTarget {
                host: "example.com".into(),
                port: 5061,
                kind: TransportKind::Tls
            }
        );
    }

    #[tokio::test]
    async fn test_fixed_transport_fallback_keeps_kind() {
        let target = resolve_connection_target(
            TransportSetting::Udp,
            "example.com",
            Arc::new(NoSrvResolver),
        )
        .await;
        assert_eq!(target.kind, TransportKind::Udp);
        assert_eq!(target.port, 5060);
    }

    #[test]
    fn test_candidate_tables() {
        assert_eq!(SERVICE_AUTODETECT.len(), 4);
        assert_eq!(SERVICE_AUTODETECT[0].service, "sipinternaltls");
        assert_eq!(candidates_for(TransportSetting::Udp), SERVICE_UDP);
    }
}
