//! Admission control over a backend's logical resources.

use super::BackendError;
use crate::config::ResourceConfig;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ResourcePool {
    backend: String,
    limits: BTreeMap<String, ResourceConfig>,
    /// May exceed capacity while blocked jobs reclaim what they lent.
    used: BTreeMap<String, u64>,
}

impl ResourcePool {
    pub fn new(backend: &str, limits: BTreeMap<String, ResourceConfig>) -> Self {
        ResourcePool {
            backend: backend.to_string(),
            limits,
            used: BTreeMap::new(),
        }
    }

    /// Round a request up to the precision of each resource, and check that
    /// it could ever be admitted.
    pub fn normalize(&self, req: &BTreeMap<String, u64>) -> Result<BTreeMap<String, u64>, BackendError> {
        let mut out = BTreeMap::new();
        for (name, &asked) in req {
            if asked == 0 {
                continue;
            }
            let Some(limit) = self.limits.get(name) else {
                return Err(BackendError::UnknownResource {
                    backend: self.backend.clone(),
                    resource: name.clone(),
                });
            };
            let amount = match limit.precision {
                0 | 1 => asked,
                p => asked.div_ceil(p) * p,
            };
            if amount > limit.capacity {
                return Err(BackendError::TooBig {
                    backend: self.backend.clone(),
                    resource: name.clone(),
                    asked: amount,
                    capacity: limit.capacity,
                });
            }
            out.insert(name.clone(), amount);
        }
        Ok(out)
    }

    pub fn fits(&self, req: &BTreeMap<String, u64>) -> bool {
        req.iter().all(|(name, &amount)| {
            let used = self.used.get(name).copied().unwrap_or(0);
            let cap = self.limits.get(name).map_or(0, |l| l.capacity);
            used + amount <= cap
        })
    }

    pub fn acquire(&mut self, req: &BTreeMap<String, u64>) {
        for (name, &amount) in req {
            *self.used.entry(name.clone()).or_default() += amount;
        }
    }

    pub fn release(&mut self, req: &BTreeMap<String, u64>) {
        for (name, &amount) in req {
            if let Some(u) = self.used.get_mut(name) {
                *u = u.saturating_sub(amount);
            }
        }
    }

    pub fn used(&self, name: &str) -> u64 {
        self.used.get(name).copied().unwrap_or(0)
    }
}
