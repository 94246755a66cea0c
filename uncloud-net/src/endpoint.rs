use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// An address at which a machine's tunnel listener is reachable. The host is
/// kept as written so operators can advertise DNS names alongside plain IPs;
/// it is resolved only when the endpoint is about to be handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to a socket address, preferring IPv4 since
    /// candidate lists commonly mix families and WireGuard needs one.
    pub fn resolve(&self) -> std::io::Result<SocketAddr> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs
            .clone()
            .find(SocketAddr::is_ipv4)
            .or_else(|| addrs.next())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("could not resolve {self}"),
                )
            })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::new(v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => Endpoint::new(v6.ip().to_string(), v6.port()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<IpAddr>().map_or(false, |ip| ip.is_ipv6()) {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6: [host]:port
            let (host, port) = rest
                .rsplit_once("]:")
                .ok_or_else(|| format!("invalid endpoint: {s}"))?;
            let port = port.parse().map_err(|_| format!("invalid port in {s}"))?;
            Ok(Endpoint::new(host, port))
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid endpoint: {s}"))?;
            if host.is_empty() || host.contains(':') {
                return Err(format!("invalid endpoint: {s}"));
            }
            let port = port.parse().map_err(|_| format!("invalid port in {s}"))?;
            Ok(Endpoint::new(host, port))
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
