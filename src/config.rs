use anyhow::{anyhow, Context};
use rw_types::url_rewrite::reconcile::RedirectChainPolicy;
use rw_types::url_rewrite::service::RewriteOptions;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportConfig {
    pub database_path: String,
    pub url_suffix: String,
    /// Number of batches reconciled at the same time.
    pub concurrency: usize,
    /// Products per worker batch.
    pub batch_size: usize,
    pub collapse_redirect_chains: bool,
    pub retire_unassigned_categories: bool,
    pub link_root_category: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database_path: "storage/url_rewrite.db".to_string(),
            url_suffix: ".html".to_string(),
            concurrency: 4,
            batch_size: 100,
            collapse_redirect_chains: false,
            retire_unassigned_categories: true,
            link_root_category: false,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let d = Self::default();
        Ok(Self {
            database_path: envmnt::get_or("DATABASE_PATH", &d.database_path),
            url_suffix: envmnt::get_or("URL_SUFFIX", &d.url_suffix),
            concurrency: positive("IMPORT_CONCURRENCY", d.concurrency)?,
            batch_size: positive("IMPORT_BATCH_SIZE", d.batch_size)?,
            collapse_redirect_chains: env_flag(
                "COLLAPSE_REDIRECT_CHAINS",
                d.collapse_redirect_chains,
            ),
            retire_unassigned_categories: env_flag(
                "RETIRE_UNASSIGNED_CATEGORIES",
                d.retire_unassigned_categories,
            ),
            link_root_category: env_flag("LINK_ROOT_CATEGORY", d.link_root_category),
        })
    }

    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            url_suffix: self.url_suffix.clone(),
            chain_policy: if self.collapse_redirect_chains {
                RedirectChainPolicy::Collapse
            } else {
                RedirectChainPolicy::Accumulate
            },
            retire_unassigned_categories: self.retire_unassigned_categories,
            link_root_category: self.link_root_category,
        }
    }
}

fn positive(key: &str, default_value: usize) -> Result<usize, anyhow::Error> {
    if !envmnt::exists(key) {
        return Ok(default_value);
    }
    let value: usize = envmnt::get_parse(key).with_context(|| format!("{key} is not a number"))?;
    if value == 0 {
        return Err(anyhow!("{key} must be greater than zero"));
    }
    Ok(value)
}

pub fn env_flag(key: &str, default_value: bool) -> bool {
    if !envmnt::exists(key) {
        return default_value;
    }
    let raw = envmnt::get_or(key, "");
    match rw_types::parse_flag(&raw) {
        Some(v) => v,
        None => {
            log::warn!("Unrecognized value {raw:?} of {key}, using {default_value}");
            default_value
        }
    }
}
