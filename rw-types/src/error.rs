use crate::url_rewrite::FamilyKey;
use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ReconcileError {
    #[error(ignore)]
    #[display("Unknown website code {_0:?}")]
    UnknownWebsiteCode(String),
    #[error(ignore)]
    #[display("Unknown store view code {_0:?}")]
    UnknownStoreCode(String),
    #[error(ignore)]
    #[display("Category {_0} not found")]
    CategoryNotFound(i64),
    #[error(ignore)]
    #[display("Category path {_0:?} not found")]
    UnknownCategoryPath(String),
    #[error(ignore)]
    #[display("Ancestor chain of category {_0} does not terminate")]
    CycleDetected(i64),
    #[display("Request path {request_path:?} in store {store_id} belongs to a manual rewrite")]
    ManualRewriteConflict {
        store_id: i64,
        request_path: String,
    },
    #[display("Request path {request_path:?} in store {store_id} is already used by {owner}")]
    RequestPathConflict {
        store_id: i64,
        request_path: String,
        owner: FamilyKey,
    },
    #[display("Family {family} has {canonical_count} canonical rewrites")]
    InvariantViolation {
        family: FamilyKey,
        canonical_count: usize,
    },
    #[error(ignore)]
    #[display("Persistence failure: {_0:#}")]
    PersistenceFailure(anyhow::Error),
}

/// How far an error reaches within one product's reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Family,
    Product,
}

impl ReconcileError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::ManualRewriteConflict { .. } | Self::RequestPathConflict { .. } => {
                ErrorScope::Family
            }
            _ => ErrorScope::Product,
        }
    }
}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        Self::PersistenceFailure(err)
    }
}
