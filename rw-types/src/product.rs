use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use typesafe_repository::async_ops::Get;
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

/// Store id under which default-scope values are remembered.
pub const DEFAULT_SCOPE: i64 = 0;

#[derive(Id, Clone, Debug, PartialEq, Eq)]
pub struct ProductEntity {
    #[id]
    pub entity_id: i64,
    pub sku: String,
}

/// Store-view scoped values that win over the default scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreOverride {
    pub url_key: Option<String>,
    pub category_ids: Option<Vec<i64>>,
    pub previous_url_key: Option<String>,
}

/// Everything the rewrite engine needs to know about one imported product.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProductContext {
    pub entity_id: i64,
    pub sku: String,
    pub url_key: String,
    pub previous_url_key: Option<String>,
    pub website_codes: Vec<String>,
    pub category_ids: Vec<i64>,
    /// Keyed by store view code.
    pub store_overrides: BTreeMap<String, StoreOverride>,
}

impl ProductContext {
    pub fn new<S: Into<String>>(entity_id: i64, sku: S, url_key: S) -> Self {
        Self {
            entity_id,
            sku: sku.into(),
            url_key: url_key.into(),
            ..Default::default()
        }
    }

    pub fn with_websites(mut self, raw: &str) -> Self {
        self.website_codes = parse_website_codes(raw);
        self
    }

    pub fn with_categories<I: IntoIterator<Item = i64>>(mut self, ids: I) -> Self {
        self.category_ids = ids.into_iter().collect();
        self
    }

    pub fn with_override<S: Into<String>>(mut self, store_code: S, o: StoreOverride) -> Self {
        self.store_overrides.insert(store_code.into(), o);
        self
    }
}

/// Parses the comma separated `product_websites` cell, keeping the first
/// occurrence of each code.
pub fn parse_website_codes(raw: &str) -> Vec<String> {
    let mut codes: Vec<String> = vec![];
    for code in crate::split_list(raw) {
        if !codes.iter().any(|c| c == code) {
            codes.push(code.to_string());
        }
    }
    codes
}

#[async_trait]
pub trait ProductRepository:
    Repository<ProductEntity, Error = anyhow::Error> + Get<ProductEntity> + Send + Sync
{
    /// Returns the entity for `sku`, creating it on first sight.
    async fn ensure_by_sku(&self, sku: &str) -> Result<ProductEntity, Self::Error>;
    /// Last imported url key per store id.
    async fn url_keys(&self, entity_id: i64) -> Result<HashMap<i64, String>, Self::Error>;
    async fn save_url_keys(
        &self,
        entity_id: i64,
        keys: Vec<(i64, String)>,
    ) -> Result<(), Self::Error>;
}
