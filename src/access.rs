//! Trusted-subnet gate for mutating requests.
//!
//! The subnet is parsed once at startup. With no subnet configured every
//! caller is allowed, including ones that send no address at all.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use tracing::debug;

use crate::error::{AccessError, ConfigError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessGuard {
    subnet: Option<IpNet>,
}

impl AccessGuard {
    /// Empty or absent CIDR disables the guard
    pub fn new(cidr: Option<&str>) -> Result<Self, ConfigError> {
        let subnet = match cidr.map(str::trim).filter(|c| !c.is_empty()) {
            Some(cidr) => Some(
                cidr.parse::<IpNet>()
                    .map_err(|e| ConfigError::invalid_value("trusted_subnet", format!("'{cidr}': {e}")))?,
            ),
            None => None,
        };
        Ok(Self { subnet })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn subnet(&self) -> Option<&IpNet> {
        self.subnet.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.subnet.is_some()
    }

    /// Check a raw `X-Real-IP` value
    pub fn check(&self, real_ip: Option<&str>) -> Result<(), AccessError> {
        let Some(subnet) = &self.subnet else {
            return Ok(());
        };

        let raw = real_ip.map(str::trim).filter(|r| !r.is_empty()).ok_or(AccessError::MissingAddress)?;
        let ip = parse_client_ip(raw).ok_or_else(|| AccessError::InvalidAddress { raw: raw.to_string() })?;

        if subnet.contains(&ip) {
            Ok(())
        } else {
            debug!(target: "synapse::access", %ip, %subnet, "Rejected untrusted client");
            Err(AccessError::Untrusted { ip, subnet: *subnet })
        }
    }
}

/// Accepts a bare address or `host:port` (`[v6]:port` for IPv6)
pub fn parse_client_ip(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_no_subnet_allows_everything() {
        let guard = AccessGuard::new(None).unwrap();
        assert!(!guard.is_enabled());
        assert_eq!(guard.check(None), Ok(()));
        assert_eq!(guard.check(Some("not-an-ip")), Ok(()));
        assert_eq!(AccessGuard::new(Some("  ")).unwrap(), AccessGuard::allow_all());
    }

    #[test]
    fn test_missing_header_rejected_when_subnet_set() {
        let guard = AccessGuard::new(Some("192.168.1.0/24")).unwrap();
        assert_eq!(guard.check(None), Err(AccessError::MissingAddress));
        assert_eq!(guard.check(Some("")), Err(AccessError::MissingAddress));
    }

    #[rstest]
    #[case("192.168.1.10", true)]
    #[case("192.168.1.10:51234", true)]
    #[case("192.168.2.10", false)]
    #[case("10.0.0.1:80", false)]
    fn test_subnet_membership(#[case] raw: &str, #[case] allowed: bool) {
        let guard = AccessGuard::new(Some("192.168.1.0/24")).unwrap();
        assert_eq!(guard.check(Some(raw)).is_ok(), allowed);
    }

    #[test]
    fn test_ipv6_with_port() {
        let guard = AccessGuard::new(Some("fd00::/8")).unwrap();
        assert_eq!(guard.check(Some("[fd00::1]:8080")), Ok(()));
        assert!(matches!(guard.check(Some("::1")), Err(AccessError::Untrusted { .. })));
    }

    #[test]
    fn test_garbage_address_and_subnet() {
        let guard = AccessGuard::new(Some("10.0.0.0/8")).unwrap();
        assert_eq!(
            guard.check(Some("localhost")),
            Err(AccessError::InvalidAddress { raw: "localhost".into() })
        );
        assert!(matches!(
            AccessGuard::new(Some("10.0.0.0/33")),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
