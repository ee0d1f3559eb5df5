use std::io;
use std::net::{IpAddr, ToSocketAddrs};

/// Hostname lookup, injectable so config loading can be tested offline.
pub trait Resolve {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    /// First address, preferring IPv4 the way `gethostbyname` callers expect.
    fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let addrs = self.lookup(host)?;
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found"))
    }
}

/// Resolver backed by the system's getaddrinfo.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        Ok((host, 0).to_socket_addrs()?.map(|sa| sa.ip()).collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeResolver;
    use super::*;

    #[test]
    fn resolve_prefers_ipv4() {
        let r = FakeResolver::new()
            .with("dual", "::1")
            .with("dual", "10.1.2.3");
        assert_eq!(r.resolve("dual").unwrap(), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn resolve_falls_back_to_ipv6() {
        let r = FakeResolver::new().with("v6only", "fe80::1");
        assert!(r.resolve("v6only").unwrap().is_ipv6());
    }

    #[test]
    fn system_resolver_passes_literals_through() {
        let ip = SystemResolver.resolve("192.0.2.7").unwrap();
        assert_eq!(ip, "192.0.2.7".parse::<IpAddr>().unwrap());
    }
}
