use crate::ReconcileError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use typesafe_repository::async_ops::{Get, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

#[derive(Id, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[id]
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub url_key: Option<String>,
    pub position: i64,
}

impl Category {
    /// Path segment of this category: its url key, or a slug of its name.
    pub fn segment(&self) -> String {
        match self.url_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => slugify(&self.name),
        }
    }
}

/// Immutable category snapshot, loaded once per import run.
#[derive(Clone, Debug, Default)]
pub struct CategoryTree {
    categories: BTreeMap<i64, Category>,
}

impl CategoryTree {
    pub fn new<I: IntoIterator<Item = Category>>(categories: I) -> Self {
        Self {
            categories: categories.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn get(&self, id: i64) -> Option<&Category> {
        self.categories.get(&id)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Chain from the tree top down to `id`, both included.
    pub fn ancestry(&self, id: i64) -> Result<Vec<&Category>, ReconcileError> {
        let mut chain = vec![];
        let mut next = Some(id);
        while let Some(current) = next {
            if chain.len() > self.categories.len() {
                return Err(ReconcileError::CycleDetected(id));
            }
            let category = self
                .get(current)
                .ok_or(ReconcileError::CategoryNotFound(current))?;
            chain.push(category);
            next = category.parent_id;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Url segments from the first child of `root_id` down to `category_id`.
    ///
    /// Returns `Ok(None)` when the category does not live below `root_id`, and
    /// an empty breadcrumb for the root itself.
    pub fn breadcrumb(
        &self,
        category_id: i64,
        root_id: i64,
    ) -> Result<Option<Vec<String>>, ReconcileError> {
        let chain = self.ancestry(category_id)?;
        let Some(pos) = chain.iter().position(|c| c.id == root_id) else {
            return Ok(None);
        };
        Ok(Some(chain[pos + 1..].iter().map(|c| c.segment()).collect()))
    }

    /// Resolves a `Default Category/Bags` style path of names. The first name
    /// must match a tree top or one of its direct children.
    pub fn find_by_path(&self, path: &str) -> Option<i64> {
        let names: Vec<&str> = path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let (first, rest) = names.split_first()?;
        self.categories
            .values()
            .filter(|c| c.name == *first && self.is_near_top(c))
            .find_map(|start| {
                rest.iter()
                    .try_fold(start.id, |parent, name| self.child_by_name(parent, name))
            })
    }

    fn is_near_top(&self, category: &Category) -> bool {
        match category.parent_id {
            None => true,
            Some(parent) => self.get(parent).is_some_and(|p| p.parent_id.is_none()),
        }
    }

    fn child_by_name(&self, parent: i64, name: &str) -> Option<i64> {
        self.categories
            .values()
            .find(|c| c.parent_id == Some(parent) && c.name == name)
            .map(|c| c.id)
    }
}

/// Joins breadcrumb segments and the product url key into a request path.
pub fn request_path(segments: &[String], url_key: &str, suffix: &str) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push_str(segment);
        path.push('/');
    }
    path.push_str(url_key);
    path.push_str(suffix);
    path
}

pub fn slugify(input: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in input.to_lowercase().chars() {
        let mapped = match ch {
            'а' => "a",
            'б' => "b",
            'в' => "v",
            'г' => "h",
            'ґ' => "g",
            'д' => "d",
            'е' => "e",
            'є' => "ie",
            'ж' => "zh",
            'з' => "z",
            'и' => "y",
            'і' | 'ї' | 'й' => "i",
            'к' => "k",
            'л' => "l",
            'м' => "m",
            'н' => "n",
            'о' => "o",
            'п' => "p",
            'р' => "r",
            'с' => "s",
            'т' => "t",
            'у' => "u",
            'ф' => "f",
            'х' => "kh",
            'ц' => "ts",
            'ч' => "ch",
            'ш' => "sh",
            'щ' => "shch",
            'ю' => "iu",
            'я' => "ia",
            'ы' => "y",
            'э' => "e",
            _ => "",
        };
        if !mapped.is_empty() {
            out.push_str(mapped);
            prev_dash = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_dash = false;
        } else if (ch.is_whitespace() || ch == '-' || ch == '_') && !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[async_trait]
pub trait CategoryRepository:
    Repository<Category, Error = anyhow::Error> + Get<Category> + Save<Category> + Send + Sync
{
    async fn load_category_tree(&self) -> Result<CategoryTree, Self::Error>;
    /// Segments of every ancestor of `id`, tree top first, `id` last.
    async fn load_category_ancestry_chain(&self, id: i64) -> Result<Vec<String>, Self::Error>;
}
