//! Destination URL validation (SSRF protection)
//!
//! Every outbound federation destination is validated before any request
//! is made. A rejected URL is a permanent failure: it is recorded and the
//! work item dropped, never retried.

use std::net::IpAddr;

use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

/// Return true for hostnames that are IP literals in disguise
///
/// The URL parser already folds decimal/hex IPv4 forms into canonical
/// addresses; this catches anything that slips through as a domain.
fn is_disguised_ip_literal(host: &str) -> bool {
    if host.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() {
        return true;
    }

    if let Some(hex) = host.strip_prefix("0x") {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }

    false
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    if is_disguised_ip_literal(&normalized) {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Validate a remote inbox URL before delivery
///
/// Rejects:
/// - non-HTTPS schemes
/// - loopback/localhost literals
/// - RFC1918 private ranges (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16)
/// - link-local, multicast and unspecified addresses
/// - bare numeric or hexadecimal host literals used to disguise an IP
pub fn validate_inbox_url(raw: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid inbox URL: {}", e)))?;

    if parsed.scheme() != "https" {
        return Err(AppError::Validation(format!(
            "Disallowed inbox URL scheme: {}",
            parsed.scheme()
        )));
    }

    validate_host(&parsed)
}

/// Validate the host of a remote actor URL before fetching key material
///
/// Same host rules as [`validate_inbox_url`]; applied before every public
/// key fetch so signature verification can never be steered at internal
/// addresses.
pub fn validate_actor_url(raw: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Disallowed actor URL scheme: {}",
                scheme
            )));
        }
    }

    validate_host(&parsed)
}

fn validate_host(parsed: &url::Url) -> Result<(), AppError> {
    let host = match parsed.host() {
        Some(host) => host,
        None => {
            return Err(AppError::Validation("Missing host in URL".to_string()));
        }
    };

    let disallowed = match host {
        url::Host::Domain(domain) => is_disallowed_host(domain),
        url::Host::Ipv4(addr) => is_disallowed_ip(IpAddr::V4(addr)),
        url::Host::Ipv6(addr) => is_disallowed_ip(IpAddr::V6(addr)),
    };

    if disallowed {
        return Err(AppError::Validation(format!(
            "Disallowed destination host: {}",
            parsed.host_str().unwrap_or_default()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_https_inbox() {
        assert!(validate_inbox_url("https://mastodon.example/inbox").is_ok());
        assert!(validate_inbox_url("https://remote.example/users/alice/inbox").is_ok());
    }

    #[test]
    fn rejects_non_https_scheme() {
        assert!(validate_inbox_url("http://example.com").is_err());
        assert!(validate_inbox_url("ftp://example.com/inbox").is_err());
    }

    #[test]
    fn rejects_loopback_and_localhost() {
        assert!(validate_inbox_url("https://127.0.0.1/inbox").is_err());
        assert!(validate_inbox_url("https://localhost/inbox").is_err());
        assert!(validate_inbox_url("https://foo.localhost/inbox").is_err());
        assert!(validate_inbox_url("https://[::1]/inbox").is_err());
    }

    #[test]
    fn rejects_private_ranges() {
        assert!(validate_inbox_url("https://10.1.2.3/inbox").is_err());
        assert!(validate_inbox_url("https://192.168.1.1/inbox").is_err());
        assert!(validate_inbox_url("https://172.16.0.1/inbox").is_err());
        assert!(validate_inbox_url("https://172.31.255.254/inbox").is_err());
    }

    #[test]
    fn rejects_link_local() {
        assert!(validate_inbox_url("https://169.254.1.1/inbox").is_err());
        assert!(validate_inbox_url("https://[fe80::1]/inbox").is_err());
    }

    #[test]
    fn rejects_disguised_ip_literals() {
        // 0x7f000001 and 2130706433 are both 127.0.0.1.
        assert!(validate_inbox_url("https://0x7f000001/inbox").is_err());
        assert!(validate_inbox_url("https://2130706433/inbox").is_err());
    }

    #[test]
    fn rejects_disguised_literal_helper() {
        assert!(is_disguised_ip_literal("2130706433"));
        assert!(is_disguised_ip_literal("0x7f000001"));
        assert!(!is_disguised_ip_literal("mastodon.example"));
        assert!(!is_disguised_ip_literal("0xg"));
    }

    #[test]
    fn actor_url_allows_http_but_still_rejects_private_hosts() {
        assert!(validate_actor_url("http://remote.example/users/alice").is_ok());
        assert!(validate_actor_url("http://192.168.1.10/users/alice").is_err());
        assert!(validate_actor_url("https://localhost/users/alice").is_err());
    }
}
