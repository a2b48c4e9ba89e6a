//! Target-URL policy: SSRF classes and the domain whitelist.
//!
//! A submission is rejected when its host parses as an IP in a forbidden
//! class (loopback, RFC1918-private, link-local, unspecified) or when a
//! hostname misses the configured whitelist. Whitelist entries starting
//! with `*` are suffix-matched, bare hostnames exact-matched, and a
//! single-entry list of `*` disables whitelisting. IP-class checks always
//! apply — `*` never re-admits loopback or private targets.

use std::net::{IpAddr, Ipv6Addr};

use url::Url;

/// Why a target URL was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    /// The URL did not parse as an absolute http(s) URL.
    InvalidUrl(String),

    /// The host is an IP in a forbidden class.
    ForbiddenAddress(String),

    /// The hostname is not covered by the whitelist.
    NotWhitelisted(String),
}

impl std::fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(detail) => write!(f, "invalid target URL: {detail}"),
            Self::ForbiddenAddress(host) => write!(f, "target address not allowed: {host}"),
            Self::NotWhitelisted(host) => write!(f, "target domain not in whitelist: {host}"),
        }
    }
}

/// Checks a target URL against the SSRF classes and the whitelist.
///
/// # Errors
///
/// Returns the rejection reason; callers surface it as a 403 (or 400 for a
/// URL that does not parse).
pub fn check_target_url(target_url: &str, allowed_domains: &[String]) -> Result<(), PolicyRejection> {
    let parsed = Url::parse(target_url)
        .map_err(|e| PolicyRejection::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {},
        other => {
            return Err(PolicyRejection::InvalidUrl(format!("unsupported scheme: {other}")));
        },
    }

    let host = match parsed.host() {
        Some(host) => host,
        None => return Err(PolicyRejection::InvalidUrl("missing host".to_string())),
    };

    match host {
        url::Host::Ipv4(addr) => check_ip(IpAddr::V4(addr)),
        url::Host::Ipv6(addr) => check_ip(IpAddr::V6(addr)),
        url::Host::Domain(domain) => check_whitelist(domain, allowed_domains),
    }
}

fn check_ip(addr: IpAddr) -> Result<(), PolicyRejection> {
    let forbidden = match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        },
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local(v6)
                || is_link_local_v6(v6)
                || v4_mapped_forbidden(v6)
        },
    };

    if forbidden {
        return Err(PolicyRejection::ForbiddenAddress(addr.to_string()));
    }

    Ok(())
}

/// fc00::/7
fn is_unique_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// An IPv4-mapped address smuggling a forbidden IPv4 target.
fn v4_mapped_forbidden(addr: Ipv6Addr) -> bool {
    addr.to_ipv4_mapped().is_some_and(|v4| {
        v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
    })
}

fn check_whitelist(domain: &str, allowed_domains: &[String]) -> Result<(), PolicyRejection> {
    if allowed_domains.is_empty()
        || (allowed_domains.len() == 1 && allowed_domains[0] == "*")
    {
        return Ok(());
    }

    let host = domain.to_ascii_lowercase();

    for entry in allowed_domains {
        let entry = entry.to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix('*') {
            if host.ends_with(suffix) {
                return Ok(());
            }
        } else if host == entry {
            return Ok(());
        }
    }

    Err(PolicyRejection::NotWhitelisted(domain.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn loopback_rejected_even_with_open_whitelist() {
        let allow_all = domains(&["*"]);

        for url in [
            "http://127.0.0.1/x",
            "http://127.0.0.1:8080/x",
            "https://127.255.255.254/hook",
            "http://[::1]/x",
        ] {
            let err = check_target_url(url, &allow_all).unwrap_err();
            assert!(matches!(err, PolicyRejection::ForbiddenAddress(_)), "{url} => {err:?}");
        }
    }

    #[test]
    fn private_ranges_rejected() {
        let allow_all = domains(&["*"]);

        for url in [
            "http://10.0.0.5/x",
            "http://172.16.1.1/x",
            "http://192.168.1.20/x",
            "http://169.254.0.1/x",
            "http://0.0.0.0/x",
            "http://[fd00::1]/x",
            "http://[fe80::1]/x",
            "http://[::ffff:10.0.0.5]/x",
        ] {
            assert!(check_target_url(url, &allow_all).is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn public_ip_allowed() {
        assert!(check_target_url("http://93.184.216.34/hook", &domains(&["*"])).is_ok());
    }

    #[test]
    fn star_entry_disables_domain_whitelist() {
        assert!(check_target_url("https://anything.example.net/x", &domains(&["*"])).is_ok());
        assert!(check_target_url("https://anything.example.net/x", &[]).is_ok());
    }

    #[test]
    fn exact_whitelist_entries_match_exactly() {
        let allowed = domains(&["hooks.example.com"]);

        assert!(check_target_url("https://hooks.example.com/x", &allowed).is_ok());
        assert!(check_target_url("https://HOOKS.EXAMPLE.COM/x", &allowed).is_ok());

        let err = check_target_url("https://evil.example.com/x", &allowed).unwrap_err();
        assert!(matches!(err, PolicyRejection::NotWhitelisted(_)));
    }

    #[test]
    fn wildcard_entries_suffix_match() {
        let allowed = domains(&["*.example.com"]);

        assert!(check_target_url("https://a.example.com/x", &allowed).is_ok());
        assert!(check_target_url("https://deep.b.example.com/x", &allowed).is_ok());

        assert!(check_target_url("https://example.org/x", &allowed).is_err());
    }

    #[test]
    fn malformed_and_non_http_urls_rejected() {
        let allow_all = domains(&["*"]);

        assert!(matches!(
            check_target_url("not a url", &allow_all),
            Err(PolicyRejection::InvalidUrl(_))
        ));
        assert!(matches!(
            check_target_url("ftp://files.example.com/x", &allow_all),
            Err(PolicyRejection::InvalidUrl(_))
        ));
        assert!(matches!(
            check_target_url("/relative/path", &allow_all),
            Err(PolicyRejection::InvalidUrl(_))
        ));
    }
}
