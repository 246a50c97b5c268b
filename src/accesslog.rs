use std::sync::Arc;

use chrono::Local;
use tracing::info;

use crate::interfaces::{HitLog, HitRecord, Resolver};

/// Emits completed requests in Common Log Format:
///
/// `<host> - <user> [DD/Mon/YYYY:HH:MM:SS +ZZZZ] "<first-line>" <status>
/// <bytes> "<referer>" "<user-agent>"`
///
/// Lines go to the `access` tracing target; wire a subscriber to route
/// them wherever access logs belong.
pub struct CommonAccessLogger {
    resolver: Option<Arc<dyn Resolver>>,
}

impl CommonAccessLogger {
    pub fn new() -> Self {
        CommonAccessLogger { resolver: None }
    }

    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        CommonAccessLogger {
            resolver: Some(resolver),
        }
    }

    fn host_for(&self, hit: &HitRecord) -> String {
        if let Some(resolver) = &self.resolver {
            if let Some(host) = resolver.cached_host(hit.remote_addr) {
                return host;
            }
        }
        hit.remote_addr.to_string()
    }
}

impl Default for CommonAccessLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl HitLog for CommonAccessLogger {
    fn log(&self, hit: &HitRecord) {
        let user = if hit.user_name.is_empty() {
            "anonymous"
        } else {
            &hit.user_name
        };
        let when = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
        info!(
            target: "access",
            "{} - {} [{}] \"{}\" {} {} \"{}\" \"{}\"",
            self.host_for(hit),
            user,
            when,
            hit.first_line,
            hit.status,
            hit.bytes_written,
            hit.referer,
            hit.user_agent,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedResolver;

    impl Resolver for FixedResolver {
        fn cached_host(&self, _addr: IpAddr) -> Option<String> {
            Some("client.example.com".to_string())
        }
    }

    fn sample_hit() -> HitRecord {
        HitRecord {
            remote_addr: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            user_name: String::new(),
            first_line: "GET / HTTP/1.1".to_string(),
            status: "200".to_string(),
            bytes_written: 42,
            referer: String::new(),
            user_agent: "test".to_string(),
        }
    }

    #[test]
    fn falls_back_to_ip_without_resolver() {
        let logger = CommonAccessLogger::new();
        assert_eq!(logger.host_for(&sample_hit()), "10.1.2.3");
    }

    #[test]
    fn uses_resolver_cache_when_present() {
        let logger = CommonAccessLogger::with_resolver(Arc::new(FixedResolver));
        assert_eq!(logger.host_for(&sample_hit()), "client.example.com");
    }
}
