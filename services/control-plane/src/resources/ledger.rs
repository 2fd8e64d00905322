//! In-memory resource bookkeeping.
//!
//! Every batch operation runs in two passes: the first validates each line
//! against the current state without touching it, the second applies them.
//! A failure in the second pass means the first pass let through something
//! it should not have and is reported as an invariant violation.

use std::collections::{BTreeMap, BTreeSet};

use super::{
    Grant, IndexBitmap, Provider, ProviderDecl, ProviderRef, ResourceError, ResourceRequest,
    ResourceUser, UnitKind,
};

/// Result of declaring a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    /// An existing provider's total changed.
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    resources: BTreeMap<String, BTreeMap<String, Provider>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, resource_type: &str, provider: &str) -> Option<&Provider> {
        self.resources.get(resource_type)?.get(provider)
    }

    /// All providers of a type, ordered by provider id.
    pub fn providers(&self, resource_type: &str) -> BTreeMap<String, Provider> {
        self.resources
            .get(resource_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    fn lookup(&self, resource_type: &str, provider: &str) -> Result<&Provider, ResourceError> {
        let providers = self
            .resources
            .get(resource_type)
            .ok_or_else(|| ResourceError::UnknownResourceType(resource_type.to_string()))?;
        providers
            .get(provider)
            .ok_or_else(|| ResourceError::UnknownProvider {
                resource_type: resource_type.to_string(),
                provider: provider.to_string(),
            })
    }

    fn lookup_mut(
        &mut self,
        resource_type: &str,
        provider: &str,
    ) -> Result<&mut Provider, ResourceError> {
        self.resources
            .get_mut(resource_type)
            .and_then(|providers| providers.get_mut(provider))
            .ok_or_else(|| {
                ResourceError::InvariantViolation(format!(
                    "provider {provider} of {resource_type} vanished between validation and mutation"
                ))
            })
    }

    // =========================================================================
    // Providers
    // =========================================================================

    /// Declare providers. New ones are created; existing ones get their
    /// total updated as long as it stays at or above what is in use.
    pub fn add_providers(
        &mut self,
        decls: &[ProviderDecl],
    ) -> Result<Vec<AddOutcome>, ResourceError> {
        let mut batch: BTreeMap<(&str, &str), UnitKind> = BTreeMap::new();
        for decl in decls {
            if let Some(existing) = self.provider(&decl.resource_type, &decl.provider) {
                validate_update(existing, decl)?;
            }
            let key = (decl.resource_type.as_str(), decl.provider.as_str());
            if let Some(&first) = batch.get(&key) {
                return Err(ResourceError::DuplicateProvider {
                    resource_type: decl.resource_type.clone(),
                    provider: decl.provider.clone(),
                    existing: first,
                });
            }
            batch.insert(key, decl.unit_kind);
        }

        let mut outcomes = Vec::with_capacity(decls.len());
        for decl in decls {
            let providers = self.resources.entry(decl.resource_type.clone()).or_default();
            let outcome = match providers.get_mut(&decl.provider) {
                None => {
                    providers.insert(decl.provider.clone(), Provider::new(decl));
                    AddOutcome::Created
                }
                Some(existing) if existing.total == decl.total => AddOutcome::Unchanged,
                Some(existing) => {
                    if existing.unit_kind == UnitKind::Discrete {
                        existing.bitmap.resize(decl.total).map_err(|index| {
                            ResourceError::InvariantViolation(format!(
                                "index {index} of {} on {} lost while resizing",
                                decl.resource_type, decl.provider
                            ))
                        })?;
                    }
                    existing.total = decl.total;
                    existing.free = existing.total - existing.used;
                    AddOutcome::Updated
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Remove providers. Removing one that still has users is an invariant
    /// violation: callers must free every user first.
    pub fn remove_providers(
        &mut self,
        refs: &[ProviderRef],
    ) -> Result<Vec<Provider>, ResourceError> {
        for r in refs {
            let provider = self.lookup(&r.resource_type, &r.provider)?;
            if provider.has_users() {
                return Err(ResourceError::InvariantViolation(format!(
                    "removing provider {} of {} with {} active users",
                    r.provider,
                    r.resource_type,
                    provider.users.len()
                )));
            }
        }

        let mut removed = Vec::with_capacity(refs.len());
        for r in refs {
            let Some(providers) = self.resources.get_mut(&r.resource_type) else {
                continue;
            };
            if let Some(provider) = providers.remove(&r.provider) {
                removed.push(provider);
            }
            if providers.is_empty() {
                self.resources.remove(&r.resource_type);
            }
        }
        Ok(removed)
    }

    /// Remove every provider of `provider` that has no users, across all
    /// resource types. Busy providers are left in place.
    pub fn remove_idle_providers(&mut self, provider: &str) -> Vec<Provider> {
        let mut removed = Vec::new();
        self.resources.retain(|_, providers| {
            if providers.get(provider).is_some_and(|p| !p.has_users()) {
                removed.extend(providers.remove(provider));
            }
            !providers.is_empty()
        });
        removed
    }

    /// Insert a provider loaded from persistence, rebuilding its bitmap and
    /// checking that its numbers add up.
    pub fn restore_provider(&mut self, mut provider: Provider) -> Result<(), ResourceError> {
        if provider.unit_kind == UnitKind::Discrete {
            let mut bitmap = IndexBitmap::new(provider.total);
            for (user, held) in &provider.users {
                for &index in &held.indexes {
                    if !bitmap.set(index) {
                        return Err(ResourceError::InvariantViolation(format!(
                            "index {index} held by {user} on {} is out of range or shared",
                            provider.provider
                        )));
                    }
                }
            }
            provider.bitmap = bitmap;
        }
        check_provider(&provider)?;

        self.resources
            .entry(provider.resource_type.clone())
            .or_default()
            .insert(provider.provider.clone(), provider);
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Allocate every line or none.
    ///
    /// A user that already holds resources from a provider gets its existing
    /// grant back and consumes nothing more.
    pub fn alloc(&mut self, requests: &[ResourceRequest]) -> Result<Vec<Grant>, ResourceError> {
        let mut pending: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();

        for req in requests {
            let provider = self.lookup(&req.resource_type, &req.provider)?;
            if provider.users.contains_key(&req.user_key)
                || !seen.insert((
                    req.resource_type.as_str(),
                    req.provider.as_str(),
                    req.user_key.as_str(),
                ))
            {
                continue;
            }
            let demand = pending
                .entry((req.resource_type.as_str(), req.provider.as_str()))
                .or_default();
            *demand = demand.saturating_add(req.amount);
            if *demand > provider.free {
                return Err(ResourceError::Insufficient {
                    resource_type: req.resource_type.clone(),
                    provider: req.provider.clone(),
                    requested: *demand,
                    free: provider.free,
                });
            }
        }

        let mut grants = Vec::with_capacity(requests.len());
        for req in requests {
            let provider = self.lookup_mut(&req.resource_type, &req.provider)?;
            let grant = grant(provider, &req.user_key, req.amount).ok_or_else(|| {
                ResourceError::InvariantViolation(format!(
                    "validated allocation of {} {} on {} for {} failed",
                    req.amount, req.resource_type, req.provider, req.user_key
                ))
            })?;
            grants.push(grant);
        }
        Ok(grants)
    }

    /// Release what each line's user holds. Every line must name a user that
    /// holds something; otherwise nothing is released.
    pub fn free(&mut self, requests: &[ResourceRequest]) -> Result<Vec<Grant>, ResourceError> {
        let mut lines: Vec<&ResourceRequest> = Vec::with_capacity(requests.len());
        let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();

        for req in requests {
            let provider = self.lookup(&req.resource_type, &req.provider)?;
            if !provider.users.contains_key(&req.user_key) {
                return Err(ResourceError::NotAllocated {
                    resource_type: req.resource_type.clone(),
                    provider: req.provider.clone(),
                    user_key: req.user_key.clone(),
                });
            }
            let key = (
                req.resource_type.as_str(),
                req.provider.as_str(),
                req.user_key.as_str(),
            );
            if seen.insert(key) {
                lines.push(req);
            }
        }

        let mut released = Vec::with_capacity(lines.len());
        for req in lines {
            let provider = self.lookup_mut(&req.resource_type, &req.provider)?;
            let grant = release(provider, &req.user_key).ok_or_else(|| {
                ResourceError::InvariantViolation(format!(
                    "validated release of {} on {} for {} failed",
                    req.resource_type, req.provider, req.user_key
                ))
            })?;
            released.push(grant);
        }
        Ok(released)
    }

    /// Verify every provider's bookkeeping.
    pub fn check(&self) -> Result<(), ResourceError> {
        self.resources
            .values()
            .flat_map(BTreeMap::values)
            .try_for_each(check_provider)
    }
}

fn validate_update(existing: &Provider, decl: &ProviderDecl) -> Result<(), ResourceError> {
    if existing.unit_kind != decl.unit_kind {
        return Err(ResourceError::DuplicateProvider {
            resource_type: decl.resource_type.clone(),
            provider: decl.provider.clone(),
            existing: existing.unit_kind,
        });
    }
    let highest_index = existing.bitmap.iter_set().last().map(|i| i + 1).unwrap_or(0);
    if decl.total < existing.used || decl.total < highest_index {
        return Err(ResourceError::BelowUsage {
            resource_type: decl.resource_type.clone(),
            provider: decl.provider.clone(),
            total: decl.total,
            used: existing.used,
        });
    }
    Ok(())
}

fn to_grant(provider: &Provider, user_key: &str, held: &ResourceUser) -> Grant {
    Grant {
        resource_type: provider.resource_type.clone(),
        provider: provider.provider.clone(),
        user_key: user_key.to_string(),
        amount: held.used,
        indexes: held.indexes.clone(),
    }
}

fn grant(provider: &mut Provider, user_key: &str, amount: u64) -> Option<Grant> {
    if let Some(held) = provider.users.get(user_key) {
        return Some(to_grant(provider, user_key, held));
    }
    if provider.free < amount {
        return None;
    }

    let indexes = match provider.unit_kind {
        UnitKind::Fluid => Vec::new(),
        UnitKind::Discrete => provider.bitmap.take_lowest(amount)?,
    };
    provider.used += amount;
    provider.free -= amount;
    let held = ResourceUser {
        used: amount,
        indexes,
    };
    let grant = to_grant(provider, user_key, &held);
    provider.users.insert(user_key.to_string(), held);
    Some(grant)
}

fn release(provider: &mut Provider, user_key: &str) -> Option<Grant> {
    let held = provider.users.remove(user_key)?;
    for &index in &held.indexes {
        if !provider.bitmap.clear(index) {
            return None;
        }
    }
    provider.used = provider.used.checked_sub(held.used)?;
    provider.free += held.used;
    Some(to_grant(provider, user_key, &held))
}

fn check_provider(p: &Provider) -> Result<(), ResourceError> {
    let violation = |what: String| -> Result<(), ResourceError> {
        Err(ResourceError::InvariantViolation(format!(
            "{} on {}: {what}",
            p.resource_type, p.provider
        )))
    };

    if p.used.checked_add(p.free) != Some(p.total) {
        return violation(format!(
            "free {} + used {} != total {}",
            p.free, p.used, p.total
        ));
    }
    let users_total: u64 = p.users.values().map(|u| u.used).sum();
    if users_total != p.used {
        return violation(format!("users hold {users_total}, used is {}", p.used));
    }

    if p.unit_kind == UnitKind::Discrete {
        let indexes: u64 = p.users.values().map(|u| u.indexes.len() as u64).sum();
        if indexes != p.bitmap.count_ones() {
            return violation(format!(
                "users hold {indexes} indexes, bitmap has {} set",
                p.bitmap.count_ones()
            ));
        }
        for (user, held) in &p.users {
            if held.indexes.len() as u64 != held.used {
                return violation(format!(
                    "{user} uses {} but holds {} indexes",
                    held.used,
                    held.indexes.len()
                ));
            }
            if let Some(index) = held.indexes.iter().find(|&&i| !p.bitmap.is_set(i)) {
                return violation(format!("{user} holds index {index} that is not set"));
            }
        }
    }
    Ok(())
}
