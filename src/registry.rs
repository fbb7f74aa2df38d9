//! Static registry of priced resources.
//!
//! The registry is the single source of payment terms: it maps a resource
//! identifier to its price, description, and seeded engagement count. It is
//! built once at startup from configuration and is read-only afterwards, so
//! it is freely shared across concurrent requests.
//!
//! Only registered, non-free resources are gated. An unknown identifier is
//! `None`, never an error: the gate treats such requests as unprotected and
//! passes them through.

use crate::util::{MoneyAmount, MoneyAmountError};
use std::collections::HashMap;

/// One priced resource.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// Unique resource identifier.
    pub id: String,
    /// Price as configured, e.g. `0.05`. Zero marks a free resource.
    pub price: MoneyAmount,
    /// Price in the asset's minor units, precomputed at load time so every
    /// challenge for this resource carries the identical amount.
    pub amount: u128,
    /// Human-readable description, shown in challenges.
    pub description: String,
    /// Seeded engagement count the live counter adds on top of.
    pub base_claps: u64,
}

impl ResourceEntry {
    /// A zero-priced resource is never gated and never enters the payment
    /// state machine.
    pub fn is_free(&self) -> bool {
        self.price.is_zero()
    }
}

/// Errors raised while building the registry from configuration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate resource id {0:?}")]
    DuplicateId(String),
    #[error("invalid price for resource {id:?}")]
    InvalidPrice {
        id: String,
        #[source]
        source: MoneyAmountError,
    },
}

/// Immutable mapping from resource identifier to payment terms.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: Vec<ResourceEntry>,
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    /// Builds a registry, scaling each price to minor units of an asset
    /// with `decimals` decimal places.
    ///
    /// Prices are validated and converted here, once; lookups never
    /// recompute amounts.
    pub fn build<I>(entries: I, decimals: u32) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, MoneyAmount, String, u64)>,
    {
        let mut registry = ResourceRegistry::default();
        for (id, price, description, base_claps) in entries {
            if registry.index.contains_key(&id) {
                return Err(RegistryError::DuplicateId(id));
            }
            let amount = price
                .as_minor_units(decimals)
                .map_err(|source| RegistryError::InvalidPrice {
                    id: id.clone(),
                    source,
                })?;
            registry.index.insert(id.clone(), registry.entries.len());
            registry.entries.push(ResourceEntry {
                id,
                price,
                amount,
                description,
                base_claps,
            });
        }
        Ok(registry)
    }

    /// Looks up a resource by identifier. Unknown identifiers are `None`.
    pub fn lookup(&self, id: &str) -> Option<&ResourceEntry> {
        self.index.get(id).map(|i| &self.entries[*i])
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
