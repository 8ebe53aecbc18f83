use crate::product::{ProductContext, StoreOverride};
use crate::ReconcileError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use typesafe_repository::async_ops::{List, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

/// The admin store view; it never receives storefront rewrites.
pub const ADMIN_STORE_ID: i64 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Website {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub sort_order: i64,
    pub default_group_id: i64,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreGroup {
    pub id: i64,
    pub website_id: i64,
    pub name: String,
    pub root_category_id: i64,
    pub default_store_id: i64,
}

#[derive(Id, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    #[id]
    pub id: i64,
    pub code: String,
    pub website_id: i64,
    pub group_id: i64,
    pub name: String,
    pub sort_order: i64,
    pub is_active: bool,
}

/// Immutable website -> group -> store snapshot, loaded once per import run.
#[derive(Clone, Debug, Default)]
pub struct StoreHierarchy {
    websites: Vec<Website>,
    groups: HashMap<i64, StoreGroup>,
    stores: BTreeMap<i64, Store>,
}

impl StoreHierarchy {
    pub fn new(websites: Vec<Website>, groups: Vec<StoreGroup>, stores: Vec<Store>) -> Self {
        Self {
            websites,
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
            stores: stores.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn websites(&self) -> &[Website] {
        &self.websites
    }

    pub fn website_by_code(&self, code: &str) -> Option<&Website> {
        self.websites.iter().find(|w| w.code == code)
    }

    pub fn group(&self, id: i64) -> Option<&StoreGroup> {
        self.groups.get(&id)
    }

    pub fn store(&self, id: i64) -> Option<&Store> {
        self.stores.get(&id)
    }

    pub fn store_by_code(&self, code: &str) -> Option<&Store> {
        self.stores.values().find(|s| s.code == code)
    }

    /// Active storefront views of a website, ordered by store id.
    pub fn stores_of_website(&self, website_id: i64) -> impl Iterator<Item = &Store> {
        self.stores
            .values()
            .filter(move |s| s.website_id == website_id)
            .filter(|s| s.is_active && s.id != ADMIN_STORE_ID)
    }
}

/// Effective per-store values of a product.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedStore {
    pub store_id: i64,
    pub root_category_id: i64,
    pub url_key: String,
    pub category_ids: Vec<i64>,
    pub renamed: bool,
}

/// Expands the product's websites into the stores it is visible in, applying
/// store-scoped overrides over the default scope.
pub fn resolve_stores(
    product: &ProductContext,
    hierarchy: &StoreHierarchy,
) -> Result<Vec<ResolvedStore>, ReconcileError> {
    let mut overrides: HashMap<i64, &StoreOverride> = HashMap::new();
    for (code, o) in &product.store_overrides {
        let store = hierarchy
            .store_by_code(code)
            .ok_or_else(|| ReconcileError::UnknownStoreCode(code.clone()))?;
        overrides.insert(store.id, o);
    }

    let mut stores = BTreeMap::new();
    for code in &product.website_codes {
        let website = hierarchy
            .website_by_code(code)
            .ok_or_else(|| ReconcileError::UnknownWebsiteCode(code.clone()))?;
        for store in hierarchy.stores_of_website(website.id) {
            stores.insert(store.id, store);
        }
    }

    let mut resolved = Vec::with_capacity(stores.len());
    for (store_id, store) in stores {
        let Some(group) = hierarchy.group(store.group_id) else {
            log::warn!(
                "Store {} references missing group {}, skipping",
                store.code,
                store.group_id
            );
            continue;
        };
        let o = overrides.get(&store_id);
        let url_key = o
            .and_then(|o| o.url_key.clone())
            .unwrap_or_else(|| product.url_key.clone());
        let category_ids = o
            .and_then(|o| o.category_ids.clone())
            .unwrap_or_else(|| product.category_ids.clone());
        let previous = match o {
            Some(StoreOverride {
                url_key: Some(_),
                previous_url_key,
                ..
            }) => previous_url_key.as_deref(),
            _ => product.previous_url_key.as_deref(),
        };
        let renamed = previous.is_some_and(|p| p != url_key);
        resolved.push(ResolvedStore {
            store_id,
            root_category_id: group.root_category_id,
            url_key,
            category_ids,
            renamed,
        });
    }
    Ok(resolved)
}

#[async_trait]
pub trait StoreRepository:
    Repository<Store, Error = anyhow::Error> + Save<Store> + List<Store> + Send + Sync
{
    async fn save_website(&self, website: Website) -> Result<(), Self::Error>;
    async fn save_group(&self, group: StoreGroup) -> Result<(), Self::Error>;
    async fn load_store_hierarchy(&self) -> Result<StoreHierarchy, Self::Error>;
}
