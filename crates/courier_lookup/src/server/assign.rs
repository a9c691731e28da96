#![forbid(unsafe_code)]

//! Gateway assignment: token + client address -> gateway domains.
//!
//! The token hash drives both the weighted IDC pick inside the client's
//! region and the gateway subset inside that IDC, so a client keeps landing
//! on the same place for as long as the topology and registry don't change.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use courier_domain::{Country, Idc, META_DOMAIN, Region, RegionId, ServiceRegistration, TAG_IDC, Topology, service};
use hyper::StatusCode;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::server::ipregion::{GeoError, IpRegion};
use crate::server::naming::Naming;
use crate::util::time::unix_secs_now;

/// Each gateway index is repeated this many times in the selection slot array.
pub const VIRTUAL_SLOTS_PER_GATEWAY: usize = 10;

/// Location used when geo resolution fails.
pub const DEFAULT_LOCATION: &str = "中国";

/// Gateways returned per lookup unless configured otherwise.
pub const DEFAULT_GATEWAY_COUNT: usize = 3;

/// Upper bound on a single geo lookup.
pub const DEFAULT_GEO_TIMEOUT: Duration = Duration::from_millis(500);

/// Geo gets at most `1/GEO_BUDGET_DIVISOR` of what is left of a request deadline.
const GEO_BUDGET_DIVISOR: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignerConfig {
	pub default_location: Country,
	/// Upper bound on returned domains (`k`), at least 1.
	pub gateway_count: usize,
	/// Discovery service name of the gateway fleet.
	pub gateway_service: String,
	/// Tag key used to filter gateways by IDC.
	pub idc_tag_key: String,
	/// Region to retry in when the chosen IDC has no live gateways.
	pub fallback_region: Option<RegionId>,
	/// Budget of a single geo lookup; discovery keeps the rest of the request deadline.
	pub geo_timeout: Duration,
}

impl Default for AssignerConfig {
	fn default() -> Self {
		Self {
			default_location: Country::new(DEFAULT_LOCATION),
			gateway_count: DEFAULT_GATEWAY_COUNT,
			gateway_service: service::WS_GATEWAY.to_string(),
			idc_tag_key: TAG_IDC.to_string(),
			fallback_region: None,
			geo_timeout: DEFAULT_GEO_TIMEOUT,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LookupRequest {
	pub token: String,
	pub ip: IpAddr,
	/// Bound on each collaborator call; `None` leaves timeouts to the collaborators.
	pub deadline: Option<Instant>,
}

impl LookupRequest {
	pub fn new(token: impl Into<String>, ip: IpAddr) -> Self {
		Self {
			token: token.into(),
			ip,
			deadline: None,
		}
	}

	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}
}

/// How the client location was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoOutcome {
	Resolved,
	/// Geo lookup failed or returned the unknown sentinel; the default location was used.
	Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
	/// Unix seconds at assignment time.
	pub utc: i64,
	pub location: Country,
	pub geo: GeoOutcome,
	pub region: RegionId,
	pub idc: String,
	pub domains: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssignError {
	#[error("no region configured for location {location}")]
	NoRegionForLocation { location: String },
	#[error("location {location} maps to region {region}, which is not configured")]
	NoSuchRegionConfigured { location: String, region: String },
	#[error("gateway discovery unavailable: {0}")]
	DiscoveryUnavailable(String),
	#[error("no gateways available in idc {idc}")]
	NoGatewaysAvailable { idc: String },
}

impl AssignError {
	pub fn status_code(&self) -> StatusCode {
		match self {
			AssignError::NoRegionForLocation { .. } => StatusCode::FORBIDDEN,
			AssignError::NoSuchRegionConfigured { .. }
			| AssignError::DiscoveryUnavailable(_)
			| AssignError::NoGatewaysAvailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Metrics label.
	pub fn outcome(&self) -> &'static str {
		match self {
			AssignError::NoRegionForLocation { .. } => "no_region_for_location",
			AssignError::NoSuchRegionConfigured { .. } => "no_such_region",
			AssignError::DiscoveryUnavailable(_) => "discovery_unavailable",
			AssignError::NoGatewaysAvailable { .. } => "no_gateways",
		}
	}
}

/// CRC32 (IEEE) of the token bytes.
pub fn hash_code(token: &str) -> u32 {
	crc32fast::hash(token.as_bytes())
}

/// Pick up to `count` distinct gateways for `token_hash`.
///
/// Duplicate ids are dropped (first occurrence wins). With more than `count`
/// gateways left, the start index comes from a slot array holding every
/// gateway index `VIRTUAL_SLOTS_PER_GATEWAY` times, and the walk continues
/// circularly over the gateway list.
pub fn select_gateways(token_hash: u32, gateways: Vec<ServiceRegistration>, count: usize) -> Vec<ServiceRegistration> {
	let mut seen = HashSet::with_capacity(gateways.len());
	let gateways: Vec<ServiceRegistration> = gateways
		.into_iter()
		.filter(|g| seen.insert(g.service_id().to_string()))
		.collect();

	if gateways.len() <= count {
		return gateways;
	}

	let mut slots = Vec::with_capacity(gateways.len() * VIRTUAL_SLOTS_PER_GATEWAY);
	for index in 0..gateways.len() {
		slots.extend(std::iter::repeat_n(index, VIRTUAL_SLOTS_PER_GATEWAY));
	}

	let start = slots[token_hash as usize % slots.len()];
	(0..count)
		.map(|step| gateways[(start + step) % gateways.len()].clone())
		.collect()
}

/// Resolves lookups against a fixed topology and live discovery.
pub struct Assigner {
	cfg: AssignerConfig,
	topology: Arc<Topology>,
	geo: Arc<dyn IpRegion>,
	naming: Arc<dyn Naming>,
}

impl Assigner {
	pub fn new(cfg: AssignerConfig, topology: Arc<Topology>, geo: Arc<dyn IpRegion>, naming: Arc<dyn Naming>) -> Self {
		Self {
			cfg,
			topology,
			geo,
			naming,
		}
	}

	pub async fn assign(&self, req: &LookupRequest) -> Result<Assignment, AssignError> {
		let start = StdInstant::now();
		let result = self.assign_inner(req).await;

		let outcome = match &result {
			Ok(_) => "ok",
			Err(e) => e.outcome(),
		};
		counter!("courier_lookup_requests_total", "outcome" => outcome).increment(1);
		histogram!("courier_lookup_duration_seconds").record(start.elapsed().as_secs_f64());

		result
	}

	async fn assign_inner(&self, req: &LookupRequest) -> Result<Assignment, AssignError> {
		let hash = hash_code(&req.token);
		let (location, geo) = self.locate(req.ip, req.deadline).await;

		let region_id = self
			.topology
			.region_for(location.as_str())
			.ok_or_else(|| AssignError::NoRegionForLocation {
				location: location.to_string(),
			})?;
		let region = self
			.topology
			.region(region_id.as_str())
			.ok_or_else(|| AssignError::NoSuchRegionConfigured {
				location: location.to_string(),
				region: region_id.to_string(),
			})?;

		let (region, idc, gateways) = self.discover_with_fallback(region, hash, req.deadline).await?;

		let domains: Vec<String> = select_gateways(hash, gateways, self.cfg.gateway_count)
			.iter()
			.filter_map(|g| g.meta_value(META_DOMAIN))
			.map(str::to_string)
			.collect();
		if domains.is_empty() {
			return Err(AssignError::NoGatewaysAvailable { idc: idc.id.clone() });
		}

		debug!(token_hash = hash, location = %location, domains = ?domains, "gateways assigned");

		Ok(Assignment {
			utc: unix_secs_now(),
			location,
			geo,
			region: region.id().clone(),
			idc: idc.id.clone(),
			domains,
		})
	}

	async fn locate(&self, ip: IpAddr, deadline: Option<Instant>) -> (Country, GeoOutcome) {
		let result = match bounded(Some(self.geo_deadline(deadline)), self.geo.search(ip)).await {
			Some(result) => result,
			None => Err(GeoError::Timeout),
		};

		match result {
			Ok(info) if !info.country.is_unknown() => (info.country, GeoOutcome::Resolved),
			Ok(_) => {
				warn!(%ip, fallback = %self.cfg.default_location, "geo lookup found no location; using default");
				self.degraded()
			}
			Err(e) => {
				warn!(%ip, error = %e, fallback = %self.cfg.default_location, "geo lookup failed; using default");
				self.degraded()
			}
		}
	}

	/// `geo_timeout` from now, cut to a share of the request deadline when one is set.
	fn geo_deadline(&self, deadline: Option<Instant>) -> Instant {
		let now = Instant::now();
		let own = now + self.cfg.geo_timeout;
		match deadline {
			Some(deadline) => own.min(now + deadline.saturating_duration_since(now) / GEO_BUDGET_DIVISOR),
			None => own,
		}
	}

	fn degraded(&self) -> (Country, GeoOutcome) {
		counter!("courier_lookup_geo_degraded_total").increment(1);
		(self.cfg.default_location.clone(), GeoOutcome::Degraded)
	}

	/// Discover the gateways of the IDC the hash selects in `region`, retrying
	/// once in the fallback region when that IDC has none.
	async fn discover_with_fallback<'a>(
		&'a self,
		region: &'a Region,
		hash: u32,
		deadline: Option<Instant>,
	) -> Result<(&'a Region, &'a Idc, Vec<ServiceRegistration>), AssignError> {
		let idc = region.idc_for_hash(hash);
		let gateways = self.discover(idc, deadline).await?;
		if !gateways.is_empty() {
			return Ok((region, idc, gateways));
		}

		let Some(fallback_id) = self.cfg.fallback_region.as_ref().filter(|f| *f != region.id()) else {
			return Ok((region, idc, gateways));
		};
		let Some(fallback) = self.topology.region(fallback_id.as_str()) else {
			warn!(region = %fallback_id, "fallback region is not configured");
			return Ok((region, idc, gateways));
		};

		let fallback_idc = fallback.idc_for_hash(hash);
		warn!(
			region = %region.id(),
			idc = %idc.id,
			fallback_region = %fallback.id(),
			fallback_idc = %fallback_idc.id,
			"no live gateways in idc; trying fallback region"
		);
		let gateways = self.discover(fallback_idc, deadline).await?;
		Ok((fallback, fallback_idc, gateways))
	}

	async fn discover(&self, idc: &Idc, deadline: Option<Instant>) -> Result<Vec<ServiceRegistration>, AssignError> {
		let tags = [idc.tag(&self.cfg.idc_tag_key)];
		let found = bounded(deadline, self.naming.find(&self.cfg.gateway_service, &tags))
			.await
			.ok_or_else(|| AssignError::DiscoveryUnavailable("discovery timed out".to_string()))?
			.map_err(|e| AssignError::DiscoveryUnavailable(e.to_string()))?;

		let before = found.len();
		let usable: Vec<ServiceRegistration> = found
			.into_iter()
			.filter(|g| g.meta_value(META_DOMAIN).is_some_and(|d| !d.trim().is_empty()))
			.collect();
		if usable.len() < before {
			debug!(
				idc = %idc.id,
				skipped = before - usable.len(),
				"ignoring gateways without a domain"
			);
		}
		Ok(usable)
	}
}

/// Run `fut` under `deadline` if one is set; `None` means the deadline passed.
async fn bounded<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
	match deadline {
		Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
		None => Some(fut.await),
	}
}
