use crate::config::XForwardedForConfig;
use http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Resolves the effective client IP (§4.3 "Identity Resolver"), in order:
/// a synthetic `Mock-IP` header (testing only), `X-Forwarded-For` honoring
/// `max_trusted_index`, `X-Real-IP`, and finally the transport remote
/// address. Canonicalizes IPv6 loopback and IPv4-mapped IPv6 addresses.
/// Returns `127.0.0.1` when no source yields a valid IP.
///
/// Mirrors `proxy/handler.rs::inject_forwarded_headers`, which writes these
/// same headers on the way out — this is the read-side counterpart.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    remote_addr: IpAddr,
    config: &XForwardedForConfig,
) -> IpAddr {
    if let Some(ip) = header_ip(headers, "mock-ip") {
        return canonicalize(ip);
    }

    if let Some(ip) = xff_trusted_ip(headers, config.max_trusted_index) {
        return canonicalize(ip);
    }

    if let Some(ip) = header_ip(headers, "x-real-ip") {
        return canonicalize(ip);
    }

    canonicalize(remote_addr)
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Pick the `(1 + max_trusted_index)`-th rightmost value in `X-Forwarded-For`
/// (§4.3 "trust depth" / GLOSSARY). `max_trusted_index = 0` trusts only the
/// rightmost entry (the nearest, most-trusted proxy hop).
fn xff_trusted_ip(headers: &HeaderMap, max_trusted_index: usize) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let parts: Vec<&str> = raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return None;
    }
    let idx_from_right = max_trusted_index.min(parts.len() - 1);
    let pos = parts.len() - 1 - idx_from_right;
    parts[pos].parse::<IpAddr>().ok()
}

/// IPv6 loopback → `127.0.0.1`; IPv4-mapped IPv6 (`::ffff:a.b.c.d`) → the
/// v4 form; everything else is returned unchanged.
fn canonicalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            if v6 == Ipv6Addr::LOCALHOST {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else if let Some(v4) = v6.to_ipv4_mapped() {
                IpAddr::V4(v4)
            } else {
                ip
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn mock_ip_wins_over_everything() {
        let h = headers(&[("mock-ip", "9.9.9.9"), ("x-real-ip", "1.1.1.1")]);
        let ip = resolve_client_ip(&h, "2.2.2.2".parse().unwrap(), &XForwardedForConfig::default());
        assert_eq!(ip, "9.9.9.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn xff_trust_depth_zero_picks_rightmost() {
        let h = headers(&[("x-forwarded-for", "1.1.1.1, 2.2.2.2, 3.3.3.3")]);
        let ip = resolve_client_ip(&h, "9.9.9.9".parse().unwrap(), &XForwardedForConfig::default());
        assert_eq!(ip, "3.3.3.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn xff_trust_depth_one_picks_second_from_right() {
        let h = headers(&[("x-forwarded-for", "1.1.1.1, 2.2.2.2, 3.3.3.3")]);
        let cfg = XForwardedForConfig { max_trusted_index: 1 };
        let ip = resolve_client_ip(&h, "9.9.9.9".parse().unwrap(), &cfg);
        assert_eq!(ip, "2.2.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn falls_back_to_x_real_ip_then_remote_addr() {
        let h = headers(&[("x-real-ip", "4.4.4.4")]);
        let ip = resolve_client_ip(&h, "9.9.9.9".parse().unwrap(), &XForwardedForConfig::default());
        assert_eq!(ip, "4.4.4.4".parse::<IpAddr>().unwrap());

        let h2 = HeaderMap::new();
        let ip2 = resolve_client_ip(&h2, "9.9.9.9".parse().unwrap(), &XForwardedForConfig::default());
        assert_eq!(ip2, "9.9.9.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv6_loopback_canonicalizes_to_v4() {
        let ip = canonicalize(Ipv6Addr::LOCALHOST.into());
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn ipv4_mapped_ipv6_collapses_to_v4() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0102, 0x0304);
        let ip = canonicalize(mapped.into());
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }
}
