// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use plexus_common::model::{
    ComponentId, FunctionFingerprint, ProviderId, ReservationId, SessionId,
};
use tracing::debug;

use crate::model::{ComponentDescriptor, ComponentEntry, ComponentState, ComponentView};

#[derive(Default)]
struct FingerprintSlot {
    components: HashMap<ComponentId, ComponentEntry>,
}

/// A component handed off for eviction: the reservation to release and the
/// sandbox to tear down.
#[derive(Debug, Clone)]
pub struct EvictedComponent {
    pub component_id: ComponentId,
    pub reservation_id: ReservationId,
    pub descriptor: ComponentDescriptor,
}

/// Maps function fingerprints to their live components. The map itself is
/// under a read-write lock; each fingerprint's components sit behind their
/// own mutex so state transitions for unrelated functions never contend.
pub struct ComponentPool {
    slots: RwLock<HashMap<FunctionFingerprint, Arc<Mutex<FingerprintSlot>>>>,
    index: RwLock<HashMap<ComponentId, FunctionFingerprint>>,
}

impl ComponentPool {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, fingerprint: &FunctionFingerprint) -> Arc<Mutex<FingerprintSlot>> {
        if let Some(slot) = self.slots.read().unwrap().get(fingerprint) {
            return slot.clone();
        }
        let mut slots = self.slots.write().unwrap();
        slots
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FingerprintSlot::default())))
            .clone()
    }

    fn slot_of(&self, component_id: &ComponentId) -> Option<Arc<Mutex<FingerprintSlot>>> {
        let fingerprint = self.index.read().unwrap().get(component_id).cloned()?;
        self.slots.read().unwrap().get(&fingerprint).cloned()
    }

    pub fn insert(&self, entry: ComponentEntry) {
        self.index
            .write()
            .unwrap()
            .insert(entry.id, entry.fingerprint.clone());
        let slot = self.slot(&entry.fingerprint);
        let mut slot = slot.lock().unwrap();
        slot.components.insert(entry.id, entry);
    }

    /// Attaches the sandbox descriptor once the provider adapter reported
    /// the started component.
    pub fn set_descriptor(&self, component_id: &ComponentId, descriptor: ComponentDescriptor) {
        if let Some(slot) = self.slot_of(component_id) {
            let mut slot = slot.lock().unwrap();
            if let Some(entry) = slot.components.get_mut(component_id) {
                entry.descriptor = descriptor;
            }
        }
    }

    /// Handshake finished: STARTING (or a re-handshaking component) becomes
    /// IDLE. Returns false for unknown components.
    pub fn mark_idle(&self, component_id: &ComponentId) -> bool {
        let Some(slot) = self.slot_of(component_id) else {
            return false;
        };
        let mut slot = slot.lock().unwrap();
        match slot.components.get_mut(component_id) {
            Some(entry) if entry.state == ComponentState::Starting => {
                entry.state = ComponentState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Atomically claims one IDLE component of the fingerprint for a
    /// session, transitioning it to BUSY. Components on providers with
    /// higher headroom should be preferred by the caller; the pool itself
    /// picks the requested component or, if `preferred` is absent or gone,
    /// any idle one (lowest component id, for determinism).
    pub fn checkout_idle(
        &self,
        fingerprint: &FunctionFingerprint,
        preferred: Option<&ComponentId>,
        session: SessionId,
    ) -> Option<ComponentEntry> {
        let slot = self.slot(fingerprint);
        let mut slot = slot.lock().unwrap();

        let chosen = match preferred {
            Some(id)
                if slot
                    .components
                    .get(id)
                    .map(|e| e.state == ComponentState::Idle)
                    .unwrap_or(false) =>
            {
                Some(*id)
            }
            _ => {
                let mut idle: Vec<ComponentId> = slot
                    .components
                    .values()
                    .filter(|e| e.state == ComponentState::Idle)
                    .map(|e| e.id)
                    .collect();
                idle.sort();
                idle.first().copied()
            }
        };

        let id = chosen?;
        let entry = slot.components.get_mut(&id)?;
        entry.state = ComponentState::Busy;
        entry.session = Some(session);
        Some(entry.clone())
    }

    /// Returns a BUSY component to IDLE after its invocation finished.
    pub fn checkin(&self, component_id: &ComponentId) {
        if let Some(slot) = self.slot_of(component_id) {
            let mut slot = slot.lock().unwrap();
            if let Some(entry) = slot.components.get_mut(component_id) {
                if entry.state == ComponentState::Busy {
                    entry.state = ComponentState::Idle;
                    entry.session = None;
                }
            }
        }
    }

    pub fn mark_draining(&self, component_id: &ComponentId) {
        if let Some(slot) = self.slot_of(component_id) {
            let mut slot = slot.lock().unwrap();
            if let Some(entry) = slot.components.get_mut(component_id) {
                if entry.state != ComponentState::Dead {
                    debug!(component = %component_id, "Component draining");
                    entry.state = ComponentState::Draining;
                }
            }
        }
    }

    pub fn mark_dead(&self, component_id: &ComponentId) {
        if let Some(slot) = self.slot_of(component_id) {
            let mut slot = slot.lock().unwrap();
            if let Some(entry) = slot.components.get_mut(component_id) {
                entry.state = ComponentState::Dead;
                entry.session = None;
            }
        }
    }

    pub fn state_of(&self, component_id: &ComponentId) -> Option<ComponentState> {
        let slot = self.slot_of(component_id)?;
        let slot = slot.lock().unwrap();
        slot.components.get(component_id).map(|e| e.state)
    }

    pub fn remove(&self, component_id: &ComponentId) -> Option<ComponentEntry> {
        let slot = self.slot_of(component_id)?;
        let removed = {
            let mut slot = slot.lock().unwrap();
            slot.components.remove(component_id)
        };
        if removed.is_some() {
            self.index.write().unwrap().remove(component_id);
        }
        removed
    }

    /// Read snapshot of one fingerprint's components.
    pub fn views_for(&self, fingerprint: &FunctionFingerprint) -> Vec<ComponentView> {
        let Some(slot) = self.slots.read().unwrap().get(fingerprint).cloned() else {
            return Vec::new();
        };
        let slot = slot.lock().unwrap();
        slot.components.values().map(view_of).collect()
    }

    /// Read snapshot across all fingerprints.
    pub fn views(&self) -> Vec<ComponentView> {
        let slots: Vec<Arc<Mutex<FingerprintSlot>>> =
            self.slots.read().unwrap().values().cloned().collect();
        let mut views = Vec::new();
        for slot in slots {
            let slot = slot.lock().unwrap();
            views.extend(slot.components.values().map(view_of));
        }
        views
    }

    /// Removes and returns components ready for eviction: DEAD ones, plus
    /// DRAINING ones with no outstanding work (no session attached).
    pub fn collect_evictable(&self) -> Vec<EvictedComponent> {
        let slots: Vec<Arc<Mutex<FingerprintSlot>>> =
            self.slots.read().unwrap().values().cloned().collect();
        let mut evicted = Vec::new();
        for slot in slots {
            let mut slot = slot.lock().unwrap();
            let doomed: Vec<ComponentId> = slot
                .components
                .values()
                .filter(|e| {
                    e.state == ComponentState::Dead
                        || (e.state == ComponentState::Draining && e.session.is_none())
                })
                .map(|e| e.id)
                .collect();
            for id in doomed {
                if let Some(entry) = slot.components.remove(&id) {
                    evicted.push(EvictedComponent {
                        component_id: entry.id,
                        reservation_id: entry.reservation_id,
                        descriptor: entry.descriptor,
                    });
                }
            }
        }
        if !evicted.is_empty() {
            let mut index = self.index.write().unwrap();
            for e in &evicted {
                index.remove(&e.component_id);
            }
        }
        evicted
    }

    /// Removes an IDLE component of *any* fingerprint on one of the given
    /// providers so its reservation can be reclaimed for a function that
    /// found no admissible capacity anywhere. Idle components have no
    /// outstanding work, so they are taken out of the pool immediately.
    pub fn reclaim_idle_on(&self, providers: &[ProviderId]) -> Option<EvictedComponent> {
        let slots: Vec<Arc<Mutex<FingerprintSlot>>> =
            self.slots.read().unwrap().values().cloned().collect();
        for slot in slots {
            let mut slot = slot.lock().unwrap();
            let mut idle: Vec<ComponentId> = slot
                .components
                .values()
                .filter(|e| e.state == ComponentState::Idle && providers.contains(&e.provider_id))
                .map(|e| e.id)
                .collect();
            idle.sort();
            if let Some(id) = idle.first() {
                if let Some(entry) = slot.components.remove(id) {
                    self.index.write().unwrap().remove(id);
                    return Some(EvictedComponent {
                        component_id: entry.id,
                        reservation_id: entry.reservation_id,
                        descriptor: entry.descriptor,
                    });
                }
            }
        }
        None
    }

    pub fn mark_provider_dead(&self, provider_id: &ProviderId) {
        let slots: Vec<Arc<Mutex<FingerprintSlot>>> =
            self.slots.read().unwrap().values().cloned().collect();
        for slot in slots {
            let mut slot = slot.lock().unwrap();
            for entry in slot.components.values_mut() {
                if &entry.provider_id == provider_id {
                    entry.state = ComponentState::Dead;
                    entry.session = None;
                }
            }
        }
    }
}

impl Default for ComponentPool {
    fn default() -> Self {
        Self::new()
    }
}

fn view_of(entry: &ComponentEntry) -> ComponentView {
    ComponentView {
        id: entry.id,
        provider_id: entry.provider_id.clone(),
        fingerprint: entry.fingerprint.clone(),
        state: entry.state,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use plexus_common::model::{Language, ProviderId, ReservationId};
    use test_r::test;

    use super::*;

    fn entry(id: ComponentId, fingerprint: &str) -> ComponentEntry {
        ComponentEntry {
            id,
            provider_id: ProviderId::new("prov-1"),
            fingerprint: FunctionFingerprint(fingerprint.to_string()),
            language: Language::Python,
            state: ComponentState::Starting,
            reservation_id: ReservationId::new_v4(),
            descriptor: ComponentDescriptor {
                provider_id: ProviderId::new("prov-1"),
                component_id: id,
                sandbox: "sandbox".to_string(),
            },
            session: None,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn checkout_claims_at_most_one_component() {
        let pool = ComponentPool::new();
        let fingerprint = FunctionFingerprint("fp-a".to_string());
        let id = ComponentId::new_v4();
        pool.insert(entry(id, "fp-a"));
        assert!(pool.mark_idle(&id));

        let session = SessionId::new_v4();
        let first = pool.checkout_idle(&fingerprint, None, session);
        assert!(first.is_some());
        // The same component can not be claimed twice.
        let second = pool.checkout_idle(&fingerprint, None, session);
        assert!(second.is_none());

        pool.checkin(&id);
        assert!(pool.checkout_idle(&fingerprint, None, session).is_some());
    }

    #[test]
    fn draining_without_session_is_evictable() {
        let pool = ComponentPool::new();
        let id = ComponentId::new_v4();
        pool.insert(entry(id, "fp-a"));
        pool.mark_idle(&id);
        pool.mark_draining(&id);

        let evicted = pool.collect_evictable();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].component_id, id);
        assert!(pool.state_of(&id).is_none());
    }

    #[test]
    fn busy_components_survive_eviction_sweeps() {
        let pool = ComponentPool::new();
        let fingerprint = FunctionFingerprint("fp-a".to_string());
        let id = ComponentId::new_v4();
        pool.insert(entry(id, "fp-a"));
        pool.mark_idle(&id);
        pool.checkout_idle(&fingerprint, Some(&id), SessionId::new_v4());

        assert!(pool.collect_evictable().is_empty());
        assert_eq!(pool.state_of(&id), Some(ComponentState::Busy));
    }
}
