//! Cached read-through lookups: ENS resolve, ENS reverse lookup and
//! marketplace user profiles.
//!
//! Shared protocol: normalize the key, read the cache (honoring the
//! `"null"` negative sentinel), call the upstream on a miss, write back on
//! success. Upstream failures degrade to "unknown" without touching the
//! cache.

use crate::cache::Cache;
use crate::error::Error;
use crate::models::{cache_keys, normalize_address};
use crate::upstream::opensea::{AccountProfile, MarketplaceApi};
use crate::upstream::UpstreamError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cached marker for a confirmed-absent entry.
const NEGATIVE_SENTINEL: &str = "null";

pub struct LookupService {
    cache: Arc<dyn Cache>,
    marketplace: Arc<dyn MarketplaceApi>,
    ens_ttl: Duration,
    user_ttl: Duration,
}

impl LookupService {
    pub fn new(
        cache: Arc<dyn Cache>,
        marketplace: Arc<dyn MarketplaceApi>,
        ens_ttl: Duration,
        user_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            marketplace,
            ens_ttl,
            user_ttl,
        }
    }

    /// ENS name → address.
    pub async fn resolve_ens(&self, name: &str) -> Result<Option<String>, Error> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::InvalidInput("name must not be empty".into()));
        }

        let marketplace = Arc::clone(&self.marketplace);
        let lookup_name = name.clone();
        Ok(self
            .read_through(&cache_keys::ens_resolve(&name), self.ens_ttl, true, || {
                let marketplace = Arc::clone(&marketplace);
                let name = lookup_name.clone();
                async move {
                    Ok(marketplace
                        .account_profile(&name)
                        .await?
                        .map(|profile| profile.address))
                }
            })
            .await)
    }

    /// Address → ENS name.
    pub async fn lookup_ens(&self, address: &str) -> Result<Option<String>, Error> {
        let address = normalize_address(address)
            .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;

        let marketplace = Arc::clone(&self.marketplace);
        let lookup_address = address.clone();
        Ok(self
            .read_through(&cache_keys::ens_lookup(&address), self.ens_ttl, true, || {
                let marketplace = Arc::clone(&marketplace);
                let address = lookup_address.clone();
                async move {
                    Ok(marketplace
                        .account_profile(&address)
                        .await?
                        .and_then(|profile| profile.username))
                }
            })
            .await)
    }

    /// Marketplace user profile for an address.
    pub async fn user_profile(&self, address: &str) -> Result<Option<AccountProfile>, Error> {
        let address = normalize_address(address)
            .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;
        let key = cache_keys::opensea_user(&address);

        if let Ok(Some(payload)) = self.cache.get(&key).await {
            if payload == NEGATIVE_SENTINEL {
                return Ok(None);
            }
            if let Ok(profile) = serde_json::from_str::<AccountProfile>(&payload) {
                return Ok(Some(profile));
            }
        }

        match self.marketplace.account_profile(&address).await {
            Ok(Some(profile)) => {
                if let Ok(payload) = serde_json::to_string(&profile) {
                    if let Err(e) = self.cache.set(&key, &payload, self.user_ttl).await {
                        warn!(key = %key, error = %e, "Profile cache write failed");
                    }
                }
                Ok(Some(profile))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!(address = %address, error = %e, "Profile lookup failed");
                Ok(None)
            }
        }
    }

    /// The shared string-valued protocol. `negative_cache` writes the
    /// sentinel on a confirmed miss so repeat lookups stay local.
    async fn read_through<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        negative_cache: bool,
        fetch: F,
    ) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, UpstreamError>>,
    {
        match self.cache.get(key).await {
            Ok(Some(payload)) if payload == NEGATIVE_SENTINEL => return None,
            Ok(Some(payload)) if !payload.is_empty() => return Some(payload),
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "Lookup cache read failed"),
        }

        match fetch().await {
            Ok(Some(value)) => {
                if let Err(e) = self.cache.set(key, &value, ttl).await {
                    warn!(key = %key, error = %e, "Lookup cache write failed");
                }
                Some(value)
            }
            Ok(None) => {
                if negative_cache {
                    if let Err(e) = self.cache.set(key, NEGATIVE_SENTINEL, ttl).await {
                        warn!(key = %key, error = %e, "Negative cache write failed");
                    }
                }
                None
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Lookup upstream failed");
                None
            }
        }
    }
}
