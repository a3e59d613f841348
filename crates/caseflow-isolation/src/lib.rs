//! caseflow-isolation
//!
//! Tenant isolation filter.
//!
//! Responsibilities:
//! - Tenant scope construction from config (country of the connected client)
//! - Type-level scoping of every store query: store methods accept only
//!   [`Scoped<Q>`], and a `Scoped` cannot exist without a validated country
//! - Row guards that refuse (and log) any case whose country differs from the
//!   requesting scope
//! - Minimal tenant-keyed map to keep per-tenant state from bleeding

use anyhow::{Context, Result};
use caseflow_schemas::{Case, CaseChangeEvent, Country};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TenantViolation
// ---------------------------------------------------------------------------

/// A cross-tenant access was attempted. Always a programming error: never
/// retried, never shown to the user as a recoverable condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantViolation {
    #[error("TENANT_VIOLATION: query has no valid country predicate (got '{raw}')")]
    MissingCountry { raw: String },

    #[error("TENANT_VIOLATION: {what} belongs to tenant '{found}' but scope is '{expected}'")]
    CrossTenant {
        expected: Country,
        found: Country,
        what: String,
    },
}

/// Country codes are 2–3 ASCII letters after normalisation.
fn is_valid_country(c: &Country) -> bool {
    let s = c.as_str();
    (2..=3).contains(&s.len()) && s.chars().all(|ch| ch.is_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// TenantScope
// ---------------------------------------------------------------------------

/// The tenant a client (or request) is allowed to see.
///
/// The `_priv` field prevents struct-literal construction: the only ways in
/// are [`TenantScope::new`] and [`TenantScope::from_config_json`], both of
/// which validate the country.
#[allow(clippy::manual_non_exhaustive)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScope {
    country: Country,
    _priv: (),
}

impl TenantScope {
    pub fn new(country: impl AsRef<str>) -> Result<Self, TenantViolation> {
        let raw = country.as_ref().to_string();
        let country = Country::new(&raw);
        if !is_valid_country(&country) {
            tracing::error!(raw = %raw, "refusing tenant scope without a valid country");
            return Err(TenantViolation::MissingCountry { raw });
        }
        Ok(Self { country, _priv: () })
    }

    /// Build from canonical config JSON (produced by caseflow-config).
    ///
    /// Required: `tenant.country`.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let country = cfg
            .pointer("/tenant/country")
            .and_then(Value::as_str)
            .context("config missing tenant.country")?;
        Ok(Self::new(country)?)
    }

    pub fn country(&self) -> &Country {
        &self.country
    }

    /// Attach this scope to a query.
    pub fn scope<Q>(&self, query: Q) -> Scoped<Q> {
        Scoped {
            country: self.country.clone(),
            query,
            _priv: (),
        }
    }

    /// Refuse a case row from another tenant. Logged at error level.
    pub fn guard_case(&self, case: &Case) -> Result<(), TenantViolation> {
        self.guard_country(&case.country, || format!("case {}", case.case_id))
    }

    /// Refuse a change-feed event from another tenant. Logged at error level.
    pub fn guard_event(&self, ev: &CaseChangeEvent) -> Result<(), TenantViolation> {
        self.guard_country(&ev.country, || format!("change event for case {}", ev.case_id))?;
        if let Some(case) = ev.case() {
            self.guard_case(case)?;
        }
        Ok(())
    }

    fn guard_country(
        &self,
        found: &Country,
        what: impl FnOnce() -> String,
    ) -> Result<(), TenantViolation> {
        if *found == self.country {
            return Ok(());
        }
        let what = what();
        tracing::error!(
            expected = %self.country,
            found = %found,
            what = %what,
            "TENANT_VIOLATION refused"
        );
        Err(TenantViolation::CrossTenant {
            expected: self.country.clone(),
            found: found.clone(),
            what,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoped<Q>
// ---------------------------------------------------------------------------

/// A query carrying its mandatory country predicate.
#[allow(clippy::manual_non_exhaustive)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoped<Q> {
    country: Country,
    query: Q,
    _priv: (),
}

impl<Q> Scoped<Q> {
    pub fn country(&self) -> &Country {
        &self.country
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    /// The scope this query was built from. Infallible: a `Scoped` only
    /// exists with a validated country.
    pub fn tenant(&self) -> TenantScope {
        TenantScope {
            country: self.country.clone(),
            _priv: (),
        }
    }

    pub fn into_parts(self) -> (Country, Q) {
        (self.country, self.query)
    }

    /// Same country, different query (e.g. a follow-up read after a write).
    pub fn map<R>(&self, f: impl FnOnce(&Q) -> R) -> Scoped<R> {
        Scoped {
            country: self.country.clone(),
            query: f(&self.query),
            _priv: (),
        }
    }

    /// Refuse a row that does not belong to this query's tenant.
    pub fn guard_case(&self, case: &Case) -> Result<(), TenantViolation> {
        if case.country == self.country {
            return Ok(());
        }
        tracing::error!(
            expected = %self.country,
            found = %case.country,
            case_id = %case.case_id,
            "TENANT_VIOLATION refused store row"
        );
        Err(TenantViolation::CrossTenant {
            expected: self.country.clone(),
            found: case.country.clone(),
            what: format!("case {}", case.case_id),
        })
    }
}

/// Scope `query` to `country`. Fails for an empty or malformed country; there
/// is no way to obtain a `Scoped` that skips this check.
pub fn scope<Q>(query: Q, country: &Country) -> Result<Scoped<Q>, TenantViolation> {
    let tenant = TenantScope::new(country.as_str())?;
    Ok(tenant.scope(query))
}

// ---------------------------------------------------------------------------
// TenantMap<T>
// ---------------------------------------------------------------------------

/// Tenant-keyed map; every access goes through a [`TenantScope`].
#[derive(Clone, Debug)]
pub struct TenantMap<T> {
    inner: BTreeMap<Country, T>,
}

impl<T> Default for TenantMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TenantMap<T> {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    pub fn get(&self, tenant: &TenantScope) -> Option<&T> {
        self.inner.get(tenant.country())
    }

    pub fn get_mut(&mut self, tenant: &TenantScope) -> Option<&mut T> {
        self.inner.get_mut(tenant.country())
    }

    pub fn get_or_default(&mut self, tenant: &TenantScope) -> &mut T
    where
        T: Default,
    {
        self.inner.entry(tenant.country().clone()).or_default()
    }

    pub fn get_or_insert_with(&mut self, tenant: &TenantScope, f: impl FnOnce() -> T) -> &mut T {
        self.inner.entry(tenant.country().clone()).or_insert_with(f)
    }

    pub fn insert(&mut self, tenant: &TenantScope, value: T) {
        self.inner.insert(tenant.country().clone(), value);
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Country> {
        self.inner.keys()
    }
}
