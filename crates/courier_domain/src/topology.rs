#![forbid(unsafe_code)]

use core::fmt;
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest weight `Region::new` expands into slots for a single IDC.
pub const MAX_IDC_WEIGHT: u32 = 1_000;

/// Errors raised while assembling a topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
	#[error("region {region} has no idcs")]
	NoIdcs { region: String },
	#[error("region {region} has no selectable slots (all idc weights are zero)")]
	EmptySlots { region: String },
	#[error("region {region} slot {slot} points past {len} idcs")]
	SlotOutOfRange { region: String, slot: usize, len: usize },
	#[error("region {region} lists idc {idc} more than once")]
	DuplicateIdc { region: String, idc: String },
	#[error("region {region} idc {idc} weight {weight} exceeds {max}", max = MAX_IDC_WEIGHT)]
	WeightTooLarge { region: String, idc: String, weight: u32 },
	#[error("region {0} configured more than once")]
	DuplicateRegion(String),
}

/// Location key produced by geo resolution (e.g. `中国`, `US`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Country(String);

impl Country {
	/// Sentinel the geo database returns for addresses it cannot place.
	pub const UNKNOWN: &'static str = "0";

	pub fn new(country: impl Into<String>) -> Self {
		Self(country.into())
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn is_unknown(&self) -> bool {
		let s = self.0.trim();
		s.is_empty() || s == Self::UNKNOWN
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl Borrow<str> for Country {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Country {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Region identifier (e.g. `SH`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for RegionId {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RegionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A data center inside a region, with its integer selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Idc {
	pub id: String,
	pub weight: u32,
}

impl Idc {
	pub fn new(id: impl Into<String>, weight: u32) -> Self {
		Self { id: id.into(), weight }
	}

	/// Discovery tag filter for this IDC, `"<key>:<id>"`.
	pub fn tag(&self, key: &str) -> String {
		format!("{key}:{}", self.id)
	}
}

/// A region: its IDCs plus the slot array encoding their weights.
///
/// Every entry of `slots` indexes into `idcs` and `slots` is never empty;
/// both constructors enforce this, so slot lookups cannot go out of bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
	id: RegionId,
	idcs: Vec<Idc>,
	slots: Vec<usize>,
}

impl Region {
	/// Build a region whose slot array repeats each IDC index `weight` times.
	pub fn new(id: RegionId, idcs: Vec<Idc>) -> Result<Self, TopologyError> {
		check_idcs(&id, &idcs)?;
		if let Some(idc) = idcs.iter().find(|i| i.weight > MAX_IDC_WEIGHT) {
			return Err(TopologyError::WeightTooLarge {
				region: id.0,
				idc: idc.id.clone(),
				weight: idc.weight,
			});
		}

		let mut slots = Vec::with_capacity(idcs.iter().map(|i| i.weight as usize).sum());
		for (index, idc) in idcs.iter().enumerate() {
			slots.extend(std::iter::repeat_n(index, idc.weight as usize));
		}

		if slots.is_empty() {
			return Err(TopologyError::EmptySlots { region: id.0 });
		}

		Ok(Self { id, idcs, slots })
	}

	/// Build a region from an explicit slot array.
	pub fn from_slots(id: RegionId, idcs: Vec<Idc>, slots: Vec<usize>) -> Result<Self, TopologyError> {
		check_idcs(&id, &idcs)?;

		if slots.is_empty() {
			return Err(TopologyError::EmptySlots { region: id.0 });
		}
		if let Some(&slot) = slots.iter().find(|&&s| s >= idcs.len()) {
			return Err(TopologyError::SlotOutOfRange {
				region: id.0,
				slot,
				len: idcs.len(),
			});
		}

		Ok(Self { id, idcs, slots })
	}

	pub fn id(&self) -> &RegionId {
		&self.id
	}

	pub fn idcs(&self) -> &[Idc] {
		&self.idcs
	}

	pub fn slots(&self) -> &[usize] {
		&self.slots
	}

	/// IDC owning slot `hash mod len(slots)`.
	pub fn idc_for_hash(&self, hash: u32) -> &Idc {
		let slot = hash as usize % self.slots.len();
		&self.idcs[self.slots[slot]]
	}
}

fn check_idcs(id: &RegionId, idcs: &[Idc]) -> Result<(), TopologyError> {
	if idcs.is_empty() {
		return Err(TopologyError::NoIdcs { region: id.0.clone() });
	}

	let mut seen = HashSet::with_capacity(idcs.len());
	for idc in idcs {
		if !seen.insert(idc.id.as_str()) {
			return Err(TopologyError::DuplicateIdc {
				region: id.0.clone(),
				idc: idc.id.clone(),
			});
		}
	}
	Ok(())
}

/// Static routing topology: location → region → weighted IDCs.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Topology {
	mapping: HashMap<Country, RegionId>,
	regions: HashMap<RegionId, Region>,
}

impl Topology {
	pub fn new(
		mapping: impl IntoIterator<Item = (Country, RegionId)>,
		regions: impl IntoIterator<Item = Region>,
	) -> Result<Self, TopologyError> {
		let mut by_id = HashMap::new();
		for region in regions {
			let id = region.id.clone();
			if by_id.insert(id.clone(), region).is_some() {
				return Err(TopologyError::DuplicateRegion(id.0));
			}
		}

		Ok(Self {
			mapping: mapping.into_iter().collect(),
			regions: by_id,
		})
	}

	/// Region id configured for a location.
	pub fn region_for(&self, country: &str) -> Option<&RegionId> {
		self.mapping.get(country)
	}

	pub fn region(&self, id: &str) -> Option<&Region> {
		self.regions.get(id)
	}

	pub fn regions(&self) -> impl Iterator<Item = &Region> {
		self.regions.values()
	}

	/// Mappings whose region id has no region record, sorted by location.
	pub fn dangling_mappings(&self) -> Vec<(&Country, &RegionId)> {
		let mut out: Vec<_> = self
			.mapping
			.iter()
			.filter(|(_, region)| !self.regions.contains_key(*region))
			.collect();
		out.sort();
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn region(id: &str, idcs: &[(&str, u32)]) -> Result<Region, TopologyError> {
		Region::new(
			RegionId::new(id),
			idcs.iter().map(|(i, w)| Idc::new(*i, *w)).collect(),
		)
	}

	#[test]
	fn slots_repeat_index_by_weight() {
		let r = region("r1", &[("A", 2), ("B", 1), ("C", 0), ("D", 3)]).unwrap();
		assert_eq!(r.slots(), &[0, 0, 1, 3, 3, 3]);
	}

	#[test]
	fn idc_for_hash_wraps_modulo_slot_count() {
		let r = Region::from_slots(
			RegionId::new("r1"),
			vec![Idc::new("A", 2), Idc::new("B", 1)],
			vec![0, 0, 1],
		)
		.unwrap();

		assert_eq!(r.idc_for_hash(0).id, "A");
		assert_eq!(r.idc_for_hash(1).id, "A");
		assert_eq!(r.idc_for_hash(2).id, "B");
		assert_eq!(r.idc_for_hash(5).id, "B");
		assert_eq!(r.idc_for_hash(u32::MAX).id, ["A", "A", "B"][(u32::MAX as usize) % 3]);
	}

	#[test]
	fn rejects_invalid_regions() {
		assert!(matches!(region("r", &[]), Err(TopologyError::NoIdcs { .. })));
		assert!(matches!(region("r", &[("A", 0)]), Err(TopologyError::EmptySlots { .. })));
		assert!(matches!(
			region("r", &[("A", 1), ("A", 2)]),
			Err(TopologyError::DuplicateIdc { .. })
		));
		assert!(matches!(
			Region::from_slots(RegionId::new("r"), vec![Idc::new("A", 1)], vec![0, 1]),
			Err(TopologyError::SlotOutOfRange { slot: 1, len: 1, .. })
		));
		assert!(matches!(
			Region::from_slots(RegionId::new("r"), vec![Idc::new("A", 1)], vec![]),
			Err(TopologyError::EmptySlots { .. })
		));
	}

	#[test]
	fn rejects_oversized_weights_before_expanding() {
		assert!(region("r", &[("A", MAX_IDC_WEIGHT)]).is_ok());
		assert_eq!(
			region("r", &[("A", 1), ("B", 4_000_000_000)]),
			Err(TopologyError::WeightTooLarge {
				region: "r".into(),
				idc: "B".into(),
				weight: 4_000_000_000,
			})
		);
	}

	#[test]
	fn topology_lookups_and_dangling_mappings() {
		let topo = Topology::new(
			[
				(Country::new("US"), RegionId::new("r1")),
				(Country::new("FR"), RegionId::new("missing")),
			],
			[region("r1", &[("A", 1)]).unwrap()],
		)
		.unwrap();

		assert_eq!(topo.region_for("US").map(RegionId::as_str), Some("r1"));
		assert!(topo.region_for("DE").is_none());
		assert!(topo.region("r1").is_some());
		assert!(topo.region("missing").is_none());

		let dangling = topo.dangling_mappings();
		assert_eq!(dangling.len(), 1);
		assert_eq!(dangling[0].0.as_str(), "FR");
	}

	#[test]
	fn rejects_duplicate_regions() {
		let err = Topology::new(
			Vec::<(Country, RegionId)>::new(),
			[region("r1", &[("A", 1)]).unwrap(), region("r1", &[("B", 1)]).unwrap()],
		)
		.unwrap_err();
		assert_eq!(err, TopologyError::DuplicateRegion("r1".into()));
	}

	#[test]
	fn unknown_country_sentinel() {
		assert!(Country::new("0").is_unknown());
		assert!(Country::new("").is_unknown());
		assert!(!Country::new("US").is_unknown());
	}

	#[test]
	fn idc_tag_format() {
		assert_eq!(Idc::new("SH_ALI", 1).tag("IDC"), "IDC:SH_ALI");
	}
}
