#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use courier_domain::{Location, Session};
use parking_lot::RwLock;

use crate::error::StorageError;

/// Session lookup keyed by connection and by account.
///
/// The router only passes this through to handlers; implementations own their
/// own synchronization.
pub trait SessionStorage: Send + Sync {
	fn add(&self, session: Session) -> Result<(), StorageError>;

	fn delete(&self, account: &str, channel_id: &str) -> Result<(), StorageError>;

	fn get(&self, channel_id: &str) -> Result<Session, StorageError>;

	fn get_location(&self, account: &str, device: &str) -> Result<Location, StorageError>;

	/// Every known location of the given accounts (all devices).
	///
	/// Accounts without sessions are skipped; `SessionNotFound` only when none
	/// of them has one.
	fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>, StorageError>;
}

#[derive(Debug, Default)]
struct Inner {
	by_channel: HashMap<String, Session>,
	/// account -> device -> channel id
	by_account: HashMap<String, BTreeMap<String, String>>,
}

/// In-process `SessionStorage` for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	inner: RwLock<Inner>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.inner.read().by_channel.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Inner {
	/// Drop the account index entry pointing at `session`, if it still does.
	fn unindex(&mut self, session: &Session) {
		let Some(devices) = self.by_account.get_mut(&session.account) else {
			return;
		};
		if devices.get(&session.device).is_some_and(|c| *c == session.channel_id) {
			devices.remove(&session.device);
		}
		if devices.is_empty() {
			self.by_account.remove(&session.account);
		}
	}
}

impl SessionStorage for MemoryStorage {
	fn add(&self, session: Session) -> Result<(), StorageError> {
		let mut inner = self.inner.write();

		if let Some(previous) = inner.by_channel.remove(&session.channel_id) {
			inner.unindex(&previous);
		}

		let devices = inner.by_account.entry(session.account.clone()).or_default();
		let replaced = devices.insert(session.device.clone(), session.channel_id.clone());
		if let Some(old) = replaced
			&& old != session.channel_id
		{
			inner.by_channel.remove(&old);
		}

		inner.by_channel.insert(session.channel_id.clone(), session);
		Ok(())
	}

	/// The account index is cleaned up under the stored session's account.
	fn delete(&self, _account: &str, channel_id: &str) -> Result<(), StorageError> {
		let mut inner = self.inner.write();

		let Some(session) = inner.by_channel.remove(channel_id) else {
			return Err(StorageError::SessionNotFound);
		};
		inner.unindex(&session);
		Ok(())
	}

	fn get(&self, channel_id: &str) -> Result<Session, StorageError> {
		self.inner
			.read()
			.by_channel
			.get(channel_id)
			.cloned()
			.ok_or(StorageError::SessionNotFound)
	}

	fn get_location(&self, account: &str, device: &str) -> Result<Location, StorageError> {
		let inner = self.inner.read();
		inner
			.by_account
			.get(account)
			.and_then(|devices| devices.get(device))
			.and_then(|channel| inner.by_channel.get(channel))
			.map(Session::location)
			.ok_or(StorageError::SessionNotFound)
	}

	fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>, StorageError> {
		let inner = self.inner.read();

		let locations: Vec<Location> = accounts
			.iter()
			.filter_map(|account| inner.by_account.get(account))
			.flat_map(|devices| devices.values())
			.filter_map(|channel| inner.by_channel.get(channel))
			.map(Session::location)
			.collect();

		if locations.is_empty() {
			return Err(StorageError::SessionNotFound);
		}
		Ok(locations)
	}
}
