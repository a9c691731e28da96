#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` bind endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `http://host:port`; the scheme may be omitted.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				Some(("http", rest)) => rest,
				Some((scheme, _)) => {
					return Err(format!("unsupported scheme {scheme:?} (expected http://host:port): {s}"));
				}
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected http://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected http://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like http://[::1]:8100): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_with_and_without_scheme() {
			let e = BindEndpoint::parse("http://0.0.0.0:8100").unwrap();
			assert_eq!(e.hostport(), "0.0.0.0:8100");

			let e = BindEndpoint::parse("lookup.example.com:80").unwrap();
			assert_eq!(e.host, "lookup.example.com");
			assert_eq!(e.port, 80);
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = BindEndpoint::parse("http://[::1]:8100").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:8100");
		}

		#[test]
		fn rejects_bad_inputs() {
			assert!(BindEndpoint::parse("").is_err());
			assert!(BindEndpoint::parse("https://127.0.0.1:8100").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:8100/lookup").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1").is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:0").is_err());
			assert!(BindEndpoint::parse("http://::1:8100").is_err());
		}

		#[test]
		fn dns_host_is_not_a_socket_addr() {
			let e = BindEndpoint::parse("http://lookup.example.com:80").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}

pub mod realip {
	use std::net::{IpAddr, SocketAddr};

	pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
	pub const X_REAL_IP: &str = "x-real-ip";

	/// Client address as seen through a reverse proxy.
	///
	/// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the
	/// socket peer. Header values that are not IP literals are skipped.
	pub fn real_ip(forwarded_for: Option<&str>, real_ip: Option<&str>, peer: SocketAddr) -> IpAddr {
		forwarded_for
			.and_then(|v| v.split(',').next())
			.and_then(parse_ip)
			.or_else(|| real_ip.and_then(parse_ip))
			.unwrap_or_else(|| peer.ip())
	}

	fn parse_ip(v: &str) -> Option<IpAddr> {
		v.trim().parse().ok()
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		fn peer() -> SocketAddr {
			"192.0.2.10:5555".parse().unwrap()
		}

		#[test]
		fn first_forwarded_hop_wins() {
			let ip = real_ip(Some(" 203.0.113.5, 10.0.0.1"), Some("198.51.100.1"), peer());
			assert_eq!(ip.to_string(), "203.0.113.5");
		}

		#[test]
		fn falls_back_to_real_ip_then_peer() {
			assert_eq!(real_ip(None, Some("198.51.100.1"), peer()).to_string(), "198.51.100.1");
			assert_eq!(real_ip(Some("garbage"), Some("also bad"), peer()).to_string(), "192.0.2.10");
			assert_eq!(real_ip(None, None, peer()).to_string(), "192.0.2.10");
		}

		#[test]
		fn accepts_ipv6_hops() {
			assert_eq!(real_ip(Some("2001:db8::1"), None, peer()).to_string(), "2001:db8::1");
		}
	}
}
