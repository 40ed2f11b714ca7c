use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{RegionInfo, RegionPlan, ServerName};

/// Intended destination of every region with an assignment in progress.
///
/// Guarded by its own lock, never held together with the region state lock.
/// Callers that need both take the per-region lock first, then this one.
#[derive(Default)]
pub struct RegionPlans {
    plans: Mutex<HashMap<String, RegionPlan>>,
}

impl RegionPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, region: &RegionInfo) -> Option<RegionPlan> {
        self.plans.lock().get(&region.encoded_name()).cloned()
    }

    pub fn set(&self, plan: RegionPlan) {
        self.plans
            .lock()
            .insert(plan.region.encoded_name(), plan);
    }

    /// Add plans for a batch, keeping any existing plan that already sends
    /// its region to the same destination.
    pub fn set_all(&self, plans: impl IntoIterator<Item = RegionPlan>) {
        let mut current = self.plans.lock();
        for plan in plans {
            let encoded = plan.region.encoded_name();
            match current.get(&encoded) {
                Some(existing) if existing.same_destination(&plan) => {}
                _ => {
                    current.insert(encoded, plan);
                }
            }
        }
    }

    /// Return the existing plan unless `force_new` is set or its destination
    /// is no longer a candidate, in which case `choose` picks a new one.
    /// The lookup and replacement happen under one lock acquisition.
    pub fn get_or_replace(
        &self,
        region: &RegionInfo,
        candidates: &[ServerName],
        force_new: bool,
        choose: impl FnOnce() -> Option<ServerName>,
    ) -> Option<(RegionPlan, bool)> {
        let encoded = region.encoded_name();
        let mut plans = self.plans.lock();
        if let Some(existing) = plans.get(&encoded) {
            let usable = existing
                .destination
                .as_ref()
                .is_some_and(|d| candidates.contains(d));
            if !force_new && usable {
                return Some((existing.clone(), false));
            }
        }
        let source = plans.get(&encoded).and_then(|p| p.source.clone());
        let plan = RegionPlan::new(region.clone(), source, choose()?);
        plans.insert(encoded, plan.clone());
        Some((plan, true))
    }

    pub fn remove(&self, region: &RegionInfo) -> Option<RegionPlan> {
        self.plans.lock().remove(&region.encoded_name())
    }

    /// Drop every plan headed for `server`, returning the affected regions.
    pub fn remove_for_destination(&self, server: &ServerName) -> Vec<RegionInfo> {
        let mut plans = self.plans.lock();
        let doomed: Vec<String> = plans
            .iter()
            .filter(|(_, p)| p.destination.as_ref() == Some(server))
            .map(|(encoded, _)| encoded.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|encoded| plans.remove(&encoded).map(|p| p.region))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.lock().is_empty()
    }
}
