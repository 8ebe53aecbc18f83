use anyhow::{anyhow, Context};
use async_trait::async_trait;
use derive_more::{Display, Error};
use lazy_regex::regex_captures;
use serde::{Deserialize, Serialize};
use std::fmt;
use typesafe_repository::async_ops::{Get, Save, Select};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;
use typesafe_repository::{SelectBy, Selector};
use uuid::Uuid;

pub mod reconcile;
pub mod service;

pub const ENTITY_TYPE_PRODUCT: &str = "product";
pub const METADATA_CATEGORY_ID: &str = "category_id";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RedirectType {
    None = 0,
    Permanent = 301,
    Temporary = 302,
}

impl RedirectType {
    pub fn code(self) -> i64 {
        self as u16 as i64
    }
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            301 => Some(Self::Permanent),
            302 => Some(Self::Temporary),
            _ => None,
        }
    }
}

/// Rewrite metadata. The only key ever written is `category_id`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RewriteMetadata {
    pub category_id: Option<i64>,
}

impl RewriteMetadata {
    /// Serialized form compatible with stored rewrites.
    pub fn to_db(&self) -> String {
        match self.category_id {
            None => "a:0:{}".to_string(),
            Some(id) => format!(
                "a:1:{{s:{}:\"{}\";i:{id};}}",
                METADATA_CATEGORY_ID.len(),
                METADATA_CATEGORY_ID
            ),
        }
    }

    pub fn from_db(raw: Option<&str>) -> Result<Self, anyhow::Error> {
        let raw = raw.map(str::trim).unwrap_or_default();
        match raw {
            "" | "a:0:{}" | "[]" | "{}" | "null" => return Ok(Self::default()),
            _ => (),
        }
        if let Some((_, int, string)) = regex_captures!(
            r#"^a:1:\{s:11:"category_id";(?:i:(-?\d+)|s:\d+:"(-?\d+)");\}$"#,
            raw
        ) {
            let id = if int.is_empty() { string } else { int };
            return Ok(Self {
                category_id: Some(id.parse()?),
            });
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).with_context(|| format!("Unsupported metadata {raw}"))?;
        let category_id = match value.get(METADATA_CATEGORY_ID) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| anyhow!("Invalid category id in metadata {raw}"))?,
            ),
            Some(serde_json::Value::String(s)) => Some(s.parse()?),
            Some(_) => return Err(anyhow!("Invalid category id in metadata {raw}")),
        };
        Ok(Self { category_id })
    }
}

/// Groups every rewrite row that belongs to one logical slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FamilyKey {
    pub entity_id: i64,
    pub store_id: i64,
    pub category_id: Option<i64>,
}

impl FamilyKey {
    pub fn new(entity_id: i64, store_id: i64, category_id: Option<i64>) -> Self {
        Self {
            entity_id,
            store_id,
            category_id,
        }
    }

    /// Controller target served by the canonical member.
    pub fn target_path(&self) -> String {
        match self.category_id {
            None => format!("catalog/product/view/id/{}", self.entity_id),
            Some(category_id) => format!(
                "catalog/product/view/id/{}/category/{category_id}",
                self.entity_id
            ),
        }
    }

    pub fn metadata(&self) -> RewriteMetadata {
        RewriteMetadata {
            category_id: self.category_id,
        }
    }
}

impl fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "product {} store {}", self.entity_id, self.store_id)?;
        if let Some(category_id) = self.category_id {
            write!(f, " category {category_id}")?;
        }
        Ok(())
    }
}

#[derive(Id, Clone, Debug, PartialEq, Eq)]
#[Id(ref_id, get_id)]
pub struct UrlRewrite {
    #[id]
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: i64,
    pub request_path: String,
    pub target_path: String,
    pub redirect_type: RedirectType,
    pub store_id: i64,
    pub is_autogenerated: bool,
    pub metadata: RewriteMetadata,
    pub description: Option<String>,
}

impl UrlRewrite {
    /// New autogenerated canonical row of `family`.
    pub fn canonical<S: Into<String>>(family: FamilyKey, request_path: S, target_path: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: ENTITY_TYPE_PRODUCT.to_string(),
            entity_id: family.entity_id,
            request_path: request_path.into(),
            target_path: target_path.into(),
            redirect_type: RedirectType::None,
            store_id: family.store_id,
            is_autogenerated: true,
            metadata: family.metadata(),
            description: None,
        }
    }

    pub fn family(&self) -> FamilyKey {
        FamilyKey::new(self.entity_id, self.store_id, self.metadata.category_id)
    }

    pub fn is_canonical(&self) -> bool {
        self.redirect_type == RedirectType::None
    }

    pub fn redirect_to<S: Into<String>>(&mut self, target: S) {
        self.redirect_type = RedirectType::Permanent;
        self.target_path = target.into();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UrlRewriteProductCategory {
    pub url_rewrite_id: Uuid,
    pub product_id: i64,
    pub category_id: i64,
}

pub struct ByFamily(pub FamilyKey);
pub struct ByProduct(pub i64);

impl Selector for ByFamily {}
impl SelectBy<ByFamily> for UrlRewrite {}

impl Selector for ByProduct {}
impl SelectBy<ByProduct> for UrlRewrite {}

/// Row writes of one family, committed as a single atomic unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FamilyChangeSet {
    pub family: FamilyKey,
    pub rewrites: Vec<UrlRewrite>,
    pub links: Vec<UrlRewriteProductCategory>,
}

impl FamilyChangeSet {
    pub fn new(family: FamilyKey) -> Self {
        Self {
            family,
            rewrites: vec![],
            links: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty() && self.links.is_empty()
    }

    /// Queues `row`, replacing an earlier queued version of the same row.
    pub fn upsert(&mut self, row: UrlRewrite) {
        match self.rewrites.iter_mut().find(|r| r.id == row.id) {
            Some(queued) => *queued = row,
            None => self.rewrites.push(row),
        }
    }
}

/// Another row got a request path written by [`UrlRewriteRepository::apply`]
/// first. Nothing of the change set was written.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display("Request path {request_path:?} in store {store_id} is already taken")]
pub struct RequestPathTaken {
    pub store_id: i64,
    pub request_path: String,
}

#[async_trait]
pub trait UrlRewriteRepository:
    Repository<UrlRewrite, Error = anyhow::Error>
    + Get<UrlRewrite>
    + Save<UrlRewrite>
    + Select<UrlRewrite, ByFamily>
    + Select<UrlRewrite, ByProduct>
    + Send
    + Sync
{
    /// Any row, manual or autogenerated, using `request_path` in `store_id`.
    /// Matching is case-sensitive.
    async fn find_by_request_path(
        &self,
        store_id: i64,
        request_path: &str,
    ) -> Result<Option<UrlRewrite>, Self::Error>;
    async fn upsert_product_category_link(
        &self,
        link: UrlRewriteProductCategory,
    ) -> Result<(), Self::Error>;
    async fn product_category_links(
        &self,
        product_id: i64,
    ) -> Result<Vec<UrlRewriteProductCategory>, Self::Error>;
    /// Writes `changes` atomically. Fails with [`RequestPathTaken`] when a
    /// request path is used by a row outside the change set.
    async fn apply(&self, changes: FamilyChangeSet) -> Result<(), Self::Error>;
}
