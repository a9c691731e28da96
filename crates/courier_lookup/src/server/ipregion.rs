#![forbid(unsafe_code)]

use std::net::IpAddr;

use async_trait::async_trait;
use cidr::IpCidr;
use courier_domain::Country;
use thiserror::Error;

/// Result of a geo-IP lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
	pub country: Country,
}

impl IpInfo {
	pub fn unknown() -> Self {
		Self {
			country: Country::new(Country::UNKNOWN),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeoError {
	#[error("geo database unavailable: {0}")]
	Unavailable(String),
	#[error("geo lookup timed out")]
	Timeout,
	#[error("invalid ip range {cidr:?}: {reason}")]
	InvalidRange { cidr: String, reason: String },
}

/// Resolves a client address to a location.
#[async_trait]
pub trait IpRegion: Send + Sync {
	/// `Country::UNKNOWN` means the database holds no entry for `ip`.
	async fn search(&self, ip: IpAddr) -> Result<IpInfo, GeoError>;
}

/// Geo lookup over a fixed list of CIDR ranges.
///
/// The most specific matching range wins; ties go to the range listed first.
#[derive(Debug, Clone, Default)]
pub struct StaticIpRegion {
	ranges: Vec<(IpCidr, Country)>,
}

impl StaticIpRegion {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_range(mut self, cidr: &str, country: impl Into<String>) -> Result<Self, GeoError> {
		let parsed = cidr.trim().parse::<IpCidr>().map_err(|e| GeoError::InvalidRange {
			cidr: cidr.to_string(),
			reason: e.to_string(),
		})?;
		self.ranges.push((parsed, Country::new(country)));
		Ok(self)
	}

	pub fn len(&self) -> usize {
		self.ranges.len()
	}

	fn resolve(&self, ip: IpAddr) -> IpInfo {
		let mut best: Option<&(IpCidr, Country)> = None;
		for entry in self.ranges.iter().filter(|(cidr, _)| cidr.contains(&ip)) {
			if best.is_none_or(|b| entry.0.network_length() > b.0.network_length()) {
				best = Some(entry);
			}
		}

		match best {
			Some((_, country)) => IpInfo {
				country: country.clone(),
			},
			None => IpInfo::unknown(),
		}
	}
}

#[async_trait]
impl IpRegion for StaticIpRegion {
	async fn search(&self, ip: IpAddr) -> Result<IpInfo, GeoError> {
		Ok(self.resolve(ip))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[tokio::test]
	async fn most_specific_range_wins() {
		let geo = StaticIpRegion::new()
			.with_range("10.0.0.0/8", "中国")
			.unwrap()
			.with_range("10.1.0.0/16", "US")
			.unwrap()
			.with_range("2001:db8::/32", "FR")
			.unwrap();

		assert_eq!(geo.search(ip("10.2.3.4")).await.unwrap().country.as_str(), "中国");
		assert_eq!(geo.search(ip("10.1.3.4")).await.unwrap().country.as_str(), "US");
		assert_eq!(geo.search(ip("2001:db8::7")).await.unwrap().country.as_str(), "FR");
	}

	#[tokio::test]
	async fn miss_is_unknown_sentinel() {
		let geo = StaticIpRegion::new().with_range("10.0.0.0/8", "US").unwrap();
		let info = geo.search(ip("192.0.2.1")).await.unwrap();
		assert!(info.country.is_unknown());
	}

	#[test]
	fn rejects_malformed_ranges() {
		assert!(matches!(
			StaticIpRegion::new().with_range("10.0.0.0/33", "US"),
			Err(GeoError::InvalidRange { .. })
		));
		assert!(StaticIpRegion::new().with_range("not-a-cidr", "US").is_err());
	}
}
