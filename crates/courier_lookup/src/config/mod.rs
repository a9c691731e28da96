#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courier_domain::{Country, Idc, Protocol, Region, RegionId, ServiceRegistration, Topology, META_DOMAIN};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::assign::{AssignerConfig, DEFAULT_GATEWAY_COUNT, DEFAULT_LOCATION};
use crate::server::ipregion::{GeoError, StaticIpRegion};

/// Bind used when neither `--bind`, the config file nor the env sets one.
pub const DEFAULT_BIND: &str = "http://127.0.0.1:8100";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;

/// Default config path: `~/.courier/lookup.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("lookup.toml"))
}

/// Load the lookup config from TOML at `path` (missing file = defaults), then env overrides.
pub fn load_lookup_config_from_path(path: &Path) -> anyhow::Result<LookupConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = LookupConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);
	cfg.validate()?;

	Ok(cfg)
}

/// Lookup service config (v1).
#[derive(Debug, Clone, Default)]
pub struct LookupConfig {
	pub server: ServerSettings,
	pub lookup: AssignerConfig,
	pub topology: Topology,
	pub ip_ranges: Vec<IpRangeSettings>,
	pub gateways: Vec<GatewaySettings>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// HTTP bind endpoint (`http://host:port`).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Deadline for the collaborator calls of one lookup; `None` disables it.
	pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRangeSettings {
	pub cidr: String,
	pub country: String,
}

/// A gateway registered statically at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
	pub id: String,
	/// Service name; defaults to `lookup.gateway_service`.
	pub name: Option<String>,
	pub protocol: Protocol,
	pub address: String,
	pub port: u16,
	pub namespace: Option<String>,
	/// IDC membership, published as `<idc_tag_key>:<idc>`.
	pub idc: Option<String>,
	pub domain: Option<String>,
	pub tags: Vec<String>,
	pub meta: BTreeMap<String, String>,
}

impl LookupConfig {
	/// Geo database built from `[[ip_ranges]]`.
	pub fn ip_region(&self) -> Result<StaticIpRegion, GeoError> {
		self.ip_ranges
			.iter()
			.try_fold(StaticIpRegion::new(), |geo, r| geo.with_range(&r.cidr, r.country.clone()))
	}

	/// Registrations for `[[gateways]]`, tagged with the configured IDC tag key.
	pub fn registrations(&self) -> anyhow::Result<Vec<ServiceRegistration>> {
		self.gateways
			.iter()
			.map(|g| -> anyhow::Result<ServiceRegistration> {
				let name = g.name.as_deref().unwrap_or(&self.lookup.gateway_service);
				let mut reg = ServiceRegistration::new(&g.id, name, g.protocol, &g.address, g.port)
					.with_context(|| format!("gateway {:?}", g.id))?
					.with_tags(g.tags.iter().cloned());

				if let Some(ns) = &g.namespace {
					reg = reg.with_namespace(ns);
				}
				if let Some(idc) = &g.idc {
					reg = reg.with_tags([Idc::new(idc, 1).tag(&self.lookup.idc_tag_key)]);
				}
				for (k, v) in &g.meta {
					reg = reg.with_meta(k, v);
				}
				if let Some(domain) = &g.domain {
					reg = reg.with_meta(META_DOMAIN, domain);
				}
				Ok(reg)
			})
			.collect()
	}

	fn validate(&self) -> anyhow::Result<()> {
		if self.lookup.gateway_count == 0 {
			return Err(anyhow!("lookup.gateway_count must be at least 1"));
		}
		if self.lookup.geo_timeout.is_zero() {
			return Err(anyhow!("lookup.geo_timeout_ms must be at least 1"));
		}
		self.ip_region().context("ip_ranges")?;
		self.registrations()?;

		for (country, region) in self.topology.dangling_mappings() {
			warn!(%country, %region, "mapping points at a region that is not configured");
		}
		if let Some(fallback) = &self.lookup.fallback_region
			&& self.topology.region(fallback.as_str()).is_none()
		{
			warn!(region = %fallback, "lookup.fallback_region is not a configured region");
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	lookup: FileLookupSettings,

	/// location -> region id
	#[serde(default)]
	mapping: BTreeMap<String, String>,

	#[serde(default)]
	regions: Vec<FileRegion>,

	#[serde(default)]
	ip_ranges: Vec<FileIpRange>,

	#[serde(default)]
	gateways: Vec<FileGateway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLookupSettings {
	default_location: Option<String>,
	gateway_count: Option<usize>,
	gateway_service: Option<String>,
	idc_tag_key: Option<String>,
	fallback_region: Option<String>,
	geo_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileRegion {
	id: String,
	#[serde(default)]
	idcs: Vec<FileIdc>,
	/// Explicit slot array; derived from weights when absent.
	slots: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileIdc {
	id: String,
	weight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileIpRange {
	cidr: String,
	country: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FileGateway {
	id: String,
	name: Option<String>,
	protocol: Option<String>,
	address: String,
	port: u16,
	namespace: Option<String>,
	idc: Option<String>,
	domain: Option<String>,
	#[serde(default)]
	tags: Vec<String>,
	#[serde(default)]
	meta: BTreeMap<String, String>,
}

impl LookupConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let regions = file
			.regions
			.into_iter()
			.map(|r| {
				let id = RegionId::new(r.id);
				let idcs = r
					.idcs
					.into_iter()
					.map(|i| Idc::new(i.id, i.weight.unwrap_or(1)))
					.collect();
				match r.slots {
					Some(slots) => Region::from_slots(id, idcs, slots),
					None => Region::new(id, idcs),
				}
			})
			.collect::<Result<Vec<_>, _>>()
			.context("invalid region config")?;

		let mapping = file
			.mapping
			.into_iter()
			.map(|(country, region)| (Country::new(country), RegionId::new(region)));
		let topology = Topology::new(mapping, regions).context("invalid region config")?;

		let gateways = file
			.gateways
			.into_iter()
			.map(|g| -> anyhow::Result<GatewaySettings> {
				let protocol = match g.protocol.as_deref().filter(|s| !s.trim().is_empty()) {
					Some(p) => p.parse::<Protocol>().with_context(|| format!("gateway {:?}", g.id))?,
					None => Protocol::Ws,
				};
				Ok(GatewaySettings {
					id: g.id,
					name: g.name.filter(|s| !s.trim().is_empty()),
					protocol,
					address: g.address,
					port: g.port,
					namespace: g.namespace.filter(|s| !s.trim().is_empty()),
					idc: g.idc.filter(|s| !s.trim().is_empty()),
					domain: g.domain.filter(|s| !s.trim().is_empty()),
					tags: g.tags,
					meta: g.meta,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let defaults = AssignerConfig::default();
		let lookup = AssignerConfig {
			default_location: file
				.lookup
				.default_location
				.filter(|s| !s.trim().is_empty())
				.map(Country::new)
				.unwrap_or(defaults.default_location),
			gateway_count: file.lookup.gateway_count.unwrap_or(DEFAULT_GATEWAY_COUNT),
			gateway_service: file
				.lookup
				.gateway_service
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.gateway_service),
			idc_tag_key: file
				.lookup
				.idc_tag_key
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.idc_tag_key),
			fallback_region: file
				.lookup
				.fallback_region
				.filter(|s| !s.trim().is_empty())
				.map(RegionId::new),
			geo_timeout: file
				.lookup
				.geo_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.geo_timeout),
		};

		Ok(Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				request_timeout: request_timeout(file.server.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)),
			},
			lookup,
			topology,
			ip_ranges: file
				.ip_ranges
				.into_iter()
				.map(|r| IpRangeSettings {
					cidr: r.cidr,
					country: r.country,
				})
				.collect(),
			gateways,
		})
	}
}

/// `0` disables the deadline.
fn request_timeout(ms: u64) -> Option<Duration> {
	(ms > 0).then(|| Duration::from_millis(ms))
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut LookupConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut LookupConfig, var: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("COURIER_LOOKUP_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = non_empty("COURIER_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("COURIER_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.request_timeout = request_timeout(ms);
		info!(ms, "server config: request_timeout overridden by env");
	}

	if let Some(v) = non_empty("COURIER_DEFAULT_LOCATION") {
		info!(location = %v, "lookup config: default_location overridden by env");
		cfg.lookup.default_location = Country::new(v);
	}

	if let Some(v) = non_empty("COURIER_GATEWAY_COUNT")
		&& let Ok(count) = v.parse::<usize>()
	{
		if count == 0 {
			warn!("lookup config: COURIER_GATEWAY_COUNT must be at least 1; ignored");
		} else {
			cfg.lookup.gateway_count = count;
			info!(count, "lookup config: gateway_count overridden by env");
		}
	}

	if let Some(v) = non_empty("COURIER_GEO_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		if ms == 0 {
			warn!("lookup config: COURIER_GEO_TIMEOUT_MS must be at least 1; ignored");
		} else {
			cfg.lookup.geo_timeout = Duration::from_millis(ms);
			info!(ms, "lookup config: geo_timeout overridden by env");
		}
	}

	if let Some(v) = non_empty("COURIER_GATEWAY_SERVICE") {
		cfg.lookup.gateway_service = v;
		info!("lookup config: gateway_service overridden by env");
	}

	if let Some(v) = non_empty("COURIER_IDC_TAG_KEY") {
		cfg.lookup.idc_tag_key = v;
		info!("lookup config: idc_tag_key overridden by env");
	}

	if let Some(v) = non_empty("COURIER_FALLBACK_REGION") {
		info!(region = %v, "lookup config: fallback_region overridden by env");
		cfg.lookup.fallback_region = Some(RegionId::new(v));
	}

	if cfg.lookup.default_location.is_unknown() {
		warn!(
			location = %cfg.lookup.default_location,
			fallback = DEFAULT_LOCATION,
			"lookup config: default_location is the unknown sentinel; using built-in default"
		);
		cfg.lookup.default_location = Country::new(DEFAULT_LOCATION);
	}
}
