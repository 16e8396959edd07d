use std::net::IpAddr;

use tokio::net::lookup_host;

use crate::tools::web_backends::WebError;

/// True when a single IP must not be fetched: loopback, RFC1918 private,
/// link-local, IPv6 unique-local (fc00::/7), or unspecified.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let segments = v6.segments();
            // fc00::/7 unique local
            if (segments[0] & 0xfe00) == 0xfc00 {
                return true;
            }
            // fe80::/10 link local
            if (segments[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            // v4-mapped addresses inherit the v4 rules
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            false
        }
    }
}

/// Extract the host portion of a URL, preserving `[::1]` bracket form.
pub fn host_from_url(url: &str) -> Option<String> {
    let rest = url.trim().split("://").nth(1)?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };
    if authority.is_empty() {
        return None;
    }
    if let Some(end) = authority.rfind(']') {
        // IPv6 literal, possibly with a port after the bracket
        return Some(authority[..=end].to_string());
    }
    match authority.split_once(':') {
        Some((host, _port)) => Some(host.to_string()),
        None => Some(authority.to_string()),
    }
}

async fn resolve_host(host: &str) -> Vec<IpAddr> {
    let clean = host.trim_matches(|c| c == '[' || c == ']');
    if let Ok(ip) = clean.parse::<IpAddr>() {
        return vec![ip];
    }
    match lookup_host((clean, 80)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Reject the URL when its host resolves to any blocked IP. A host that
/// resolves to both public and private space is blocked.
pub async fn check_ssrf_blocked(url: &str) -> Result<(), WebError> {
    let Some(host) = host_from_url(url) else {
        return Ok(());
    };
    for ip in resolve_host(&host).await {
        if is_blocked_ip(ip) {
            return Err(WebError::SsrfBlocked(format!(
                "SSRF blocked: {host} resolves to private/loopback/link-local {ip}"
            )));
        }
    }
    Ok(())
}
