//! Lookup of vehicle adapters by device id.

use std::collections::HashSet;
use std::sync::Arc;

use agvlink_core::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::adapter::VehicleAdapter;

/// Device id to adapter table.
///
/// A vehicle is reachable under its own name and under every extra device
/// address configured for it.
#[derive(Default)]
pub struct AdapterDirectory {
    by_device: DashMap<String, Arc<VehicleAdapter>>,
}

impl AdapterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under all of its device ids.
    ///
    /// Each id is claimed through its map entry, so two vehicles racing for
    /// the same id cannot both win. On conflict the ids claimed so far are
    /// released and nothing stays registered.
    pub fn register(&self, adapter: Arc<VehicleAdapter>) -> Result<()> {
        let name = adapter.properties().name.clone();
        let ids: Vec<String> = adapter
            .properties()
            .device_ids()
            .map(str::to_string)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let owner = match self.by_device.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    let owner = entry.get().properties().name.clone();
                    if owner == name {
                        entry.insert(adapter.clone());
                        None
                    } else {
                        Some(owner)
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(adapter.clone());
                    claimed.push(id.clone());
                    None
                }
            };
            if let Some(owner) = owner {
                for claimed_id in &claimed {
                    self.by_device
                        .remove_if(claimed_id, |_, a| Arc::ptr_eq(a, &adapter));
                }
                return Err(Error::Config(format!(
                    "device {} is already served by vehicle {}",
                    id, owner
                )));
            }
        }
        tracing::info!(vehicle = %name, "Adapter registered");
        Ok(())
    }

    /// Remove every device id served by `vehicle`.
    pub fn unregister(&self, vehicle: &str) -> Option<Arc<VehicleAdapter>> {
        let adapter = self.by_device.get(vehicle).map(|a| a.value().clone())?;
        self.by_device
            .retain(|_, a| a.properties().name != adapter.properties().name);
        tracing::info!(vehicle = %vehicle, "Adapter unregistered");
        Some(adapter)
    }

    /// Adapter serving `device_id`.
    pub fn get(&self, device_id: &str) -> Option<Arc<VehicleAdapter>> {
        self.by_device.get(device_id).map(|a| a.value().clone())
    }

    /// Like [`get`](Self::get), failing with `VehicleNotFound`.
    pub fn require(&self, device_id: &str) -> Result<Arc<VehicleAdapter>> {
        self.get(device_id)
            .ok_or_else(|| Error::VehicleNotFound(device_id.to_string()))
    }

    /// Each registered adapter once.
    pub fn adapters(&self) -> Vec<Arc<VehicleAdapter>> {
        let mut seen = HashSet::new();
        self.by_device
            .iter()
            .filter(|entry| seen.insert(entry.value().properties().name.clone()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered vehicles.
    pub fn len(&self) -> usize {
        self.adapters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }
}
