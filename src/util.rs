//! Multiaddr conversion helpers.

use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, bail, Result};
use multiaddr::{Multiaddr, Protocol};
use url::Url;

/// Extracts an IP socket address from a `/ip4|ip6/../tcp/..` multiaddr.
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Result<SocketAddr> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(a) => ip = Some(IpAddr::V4(a)),
            Protocol::Ip6(a) => ip = Some(IpAddr::V6(a)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => Ok(SocketAddr::new(ip, port)),
        _ => bail!("multiaddr {} is not a tcp ip address", addr),
    }
}

pub fn socketaddr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut ma = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(a) => ma.push(Protocol::Ip4(a)),
        IpAddr::V6(a) => ma.push(Protocol::Ip6(a)),
    }
    ma.push(Protocol::Tcp(addr.port()));
    ma
}

/// Whether the multiaddr contains an HTTP or HTTPS protocol component.
pub fn is_http_multiaddr(addr: &Multiaddr) -> bool {
    addr.iter()
        .any(|p| matches!(p, Protocol::Http | Protocol::Https))
}

/// Builds a base URL from a multiaddr carrying an HTTP endpoint.
///
/// The scheme is `https` when the multiaddr has an `/https` component,
/// `http` otherwise.
pub fn multiaddr_to_url(addr: &Multiaddr) -> Result<Url> {
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut scheme = "http";
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(a) => host = Some(a.to_string()),
            Protocol::Ip6(a) => host = Some(format!("[{a}]")),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) => host = Some(h.to_string()),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Https => scheme = "https",
            _ => {}
        }
    }
    let host = host.ok_or_else(|| anyhow!("multiaddr {} has no host component", addr))?;
    let url = match port {
        Some(port) => format!("{scheme}://{host}:{port}/"),
        None => format!("{scheme}://{host}/"),
    };
    Ok(Url::parse(&url)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socketaddr_roundtrip() {
        let ma: Multiaddr = "/ip4/127.0.0.1/tcp/3104".parse().unwrap();
        let sa = multiaddr_to_socketaddr(&ma).unwrap();
        assert_eq!(sa.to_string(), "127.0.0.1:3104");
        assert_eq!(socketaddr_to_multiaddr(sa), ma);
    }

    #[test]
    fn test_http_detection() {
        let http: Multiaddr = "/ip4/1.2.3.4/tcp/1234/http".parse().unwrap();
        let plain: Multiaddr = "/ip4/1.2.3.4/tcp/1234".parse().unwrap();
        assert!(is_http_multiaddr(&http));
        assert!(!is_http_multiaddr(&plain));
    }

    #[test]
    fn test_multiaddr_to_url() {
        let ma: Multiaddr = "/dns4/indexer.example/tcp/443/https".parse().unwrap();
        let url = multiaddr_to_url(&ma).unwrap();
        assert_eq!(url.as_str(), "https://indexer.example:443/");

        let ma: Multiaddr = "/ip4/127.0.0.1/tcp/8080/http".parse().unwrap();
        let url = multiaddr_to_url(&ma).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/");
    }
}
