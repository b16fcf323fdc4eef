use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use {axum::http::HeaderMap, ipnet::IpNet};

/// Loopback, RFC 1918 and IPv6 unique-local addresses. IPv4-mapped IPv6
/// addresses are judged by their IPv4 form.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            // fc00::/7
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
        },
    }
}

/// The address a request should be attributed to.
///
/// Requests without a peer address (Unix sockets) count as local. When the
/// peer is a trusted reverse proxy, the first `X-Forwarded-For` entry wins if
/// it parses.
pub fn client_ip(
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    reverse_proxies: &[IpNet],
) -> IpAddr {
    let Some(peer) = peer else {
        return IpAddr::V4(Ipv4Addr::LOCALHOST);
    };
    let peer_ip = peer.ip();

    if !reverse_proxies.iter().any(|net| net.contains(&peer_ip)) {
        return peer_ip;
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer_ip)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn private_ranges() {
        for private in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "::1",
            "fd12::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_private_ip(ip(private)), "{private}");
        }
        for public in ["8.8.8.8", "172.32.0.1", "2001:db8::1", "::ffff:1.1.1.1"] {
            assert!(!is_private_ip(ip(public)), "{public}");
        }
    }

    #[test]
    fn missing_peer_is_local() {
        assert_eq!(client_ip(None, &HeaderMap::new(), &[]), ip("127.0.0.1"));
    }

    #[test]
    fn forwarded_for_only_from_trusted_proxies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        let proxies = vec!["10.0.0.0/8".parse().unwrap()];

        let trusted: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(
            client_ip(Some(trusted), &headers, &proxies),
            ip("203.0.113.9")
        );

        let untrusted: SocketAddr = "192.168.0.5:5000".parse().unwrap();
        assert_eq!(
            client_ip(Some(untrusted), &headers, &proxies),
            ip("192.168.0.5")
        );
    }

    #[test]
    fn garbage_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let proxies = vec!["127.0.0.0/8".parse().unwrap()];
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        assert_eq!(client_ip(Some(peer), &headers, &proxies), ip("127.0.0.1"));
    }
}
