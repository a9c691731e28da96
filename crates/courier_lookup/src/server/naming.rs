#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use courier_domain::ServiceRegistration;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
	#[error("naming backend unavailable: {0}")]
	Unavailable(String),
	#[error("service instance {0} already registered")]
	AlreadyRegistered(String),
	#[error("service instance {0} not registered")]
	NotRegistered(String),
}

/// Service discovery.
#[async_trait]
pub trait Naming: Send + Sync {
	/// Live instances of `service_name` carrying every tag in `tags`.
	async fn find(&self, service_name: &str, tags: &[String]) -> Result<Vec<ServiceRegistration>, NamingError>;
}

/// In-process registry, seeded from config or driven directly in tests.
///
/// Instances are returned in registration order.
#[derive(Debug, Default)]
pub struct MemoryNaming {
	/// service name -> instances
	services: RwLock<HashMap<String, Vec<ServiceRegistration>>>,
}

impl MemoryNaming {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, registration: ServiceRegistration) -> Result<(), NamingError> {
		let mut services = self.services.write();
		let instances = services.entry(registration.service_name().to_string()).or_default();
		if instances.iter().any(|r| r.service_id() == registration.service_id()) {
			return Err(NamingError::AlreadyRegistered(registration.service_id().to_string()));
		}
		instances.push(registration);
		Ok(())
	}

	#[cfg(test)]
	pub fn deregister(&self, service_name: &str, service_id: &str) -> Result<(), NamingError> {
		let mut services = self.services.write();
		let Some(instances) = services.get_mut(service_name) else {
			return Err(NamingError::NotRegistered(service_id.to_string()));
		};

		let before = instances.len();
		instances.retain(|r| r.service_id() != service_id);
		if instances.len() == before {
			return Err(NamingError::NotRegistered(service_id.to_string()));
		}
		if instances.is_empty() {
			services.remove(service_name);
		}
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.services.read().values().map(Vec::len).sum()
	}
}

#[async_trait]
impl Naming for MemoryNaming {
	async fn find(&self, service_name: &str, tags: &[String]) -> Result<Vec<ServiceRegistration>, NamingError> {
		let services = self.services.read();
		Ok(services
			.get(service_name)
			.map(|instances| {
				instances
					.iter()
					.filter(|r| tags.iter().all(|t| r.has_tag(t)))
					.cloned()
					.collect()
			})
			.unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use courier_domain::{Protocol, service};

	use super::*;

	fn gateway(id: &str, idc: &str) -> ServiceRegistration {
		ServiceRegistration::new(id, service::WS_GATEWAY, Protocol::Ws, "10.0.0.1", 8000)
			.unwrap()
			.with_tags([format!("IDC:{idc}")])
	}

	#[tokio::test]
	async fn find_filters_by_every_tag() {
		let naming = MemoryNaming::new();
		naming.register(gateway("g1", "SH")).unwrap();
		naming.register(gateway("g2", "BJ")).unwrap();
		naming
			.register(gateway("g3", "SH").with_tags(["canary"]))
			.unwrap();

		let sh = naming.find(service::WS_GATEWAY, &["IDC:SH".to_string()]).await.unwrap();
		let ids: Vec<_> = sh.iter().map(ServiceRegistration::service_id).collect();
		assert_eq!(ids, ["g1", "g3"]);

		let canary = naming
			.find(service::WS_GATEWAY, &["IDC:SH".to_string(), "canary".to_string()])
			.await
			.unwrap();
		assert_eq!(canary.len(), 1);

		assert!(naming.find("chat", &[]).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn register_and_deregister() {
		let naming = MemoryNaming::new();
		naming.register(gateway("g1", "SH")).unwrap();
		assert_eq!(
			naming.register(gateway("g1", "BJ")),
			Err(NamingError::AlreadyRegistered("g1".into()))
		);

		naming.deregister(service::WS_GATEWAY, "g1").unwrap();
		assert_eq!(naming.len(), 0);
		assert_eq!(
			naming.deregister(service::WS_GATEWAY, "g1"),
			Err(NamingError::NotRegistered("g1".into()))
		);
	}
}
