use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::BoundedCache;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 200;

/// A logical catalog read. Equal queries always produce the same cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogQuery {
    Listing {
        category: Option<String>,
        limit: usize,
        offset: usize,
    },
    Product {
        id: u64,
    },
    Categories,
    /// Case-insensitive substring match on product titles. An empty `q`
    /// matches every product.
    Search {
        q: String,
        category: Option<String>,
        limit: usize,
        offset: usize,
    },
}

fn normalize_category(category: Option<&str>) -> Option<String> {
    category
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
}

fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

impl CatalogQuery {
    pub fn listing(category: Option<&str>, limit: Option<usize>, offset: Option<usize>) -> Self {
        Self::Listing {
            category: normalize_category(category),
            limit: page_limit(limit),
            offset: offset.unwrap_or(0),
        }
    }

    pub fn search(
        q: Option<&str>,
        category: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Self {
        Self::Search {
            q: q.map(|value| value.trim().to_lowercase()).unwrap_or_default(),
            category: normalize_category(category),
            limit: page_limit(limit),
            offset: offset.unwrap_or(0),
        }
    }

    pub fn cache_key(&self) -> String {
        match self {
            Self::Listing {
                category,
                limit,
                offset,
            } => format!(
                "products:category={}:limit={limit}:offset={offset}",
                category.as_deref().unwrap_or("*")
            ),
            Self::Product { id } => format!("product:{id}"),
            Self::Categories => "categories".to_string(),
            Self::Search {
                q,
                category,
                limit,
                offset,
            } => format!(
                "search:q={q}:category={}:limit={limit}:offset={offset}",
                category.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// The relational catalog store, seen only through a probe and a query call.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn probe(&self) -> Result<()>;

    async fn fetch(&self, query: &CatalogQuery) -> Result<Option<serde_json::Value>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub id: u64,
    pub title: String,
    pub category: String,
    pub price_cents: u64,
    pub stock: u32,
}

pub struct InMemoryCatalog {
    products: Vec<Product>,
    available: AtomicBool,
}

impl InMemoryCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products,
            available: AtomicBool::new(true),
        }
    }

    pub fn sample() -> Self {
        Self::new(vec![
            Product {
                id: 1,
                title: "Smartphone X".to_string(),
                category: "Electronics".to_string(),
                price_cents: 2_500_000,
                stock: 12,
            },
            Product {
                id: 2,
                title: "Wireless Headphones".to_string(),
                category: "Electronics".to_string(),
                price_cents: 350_000,
                stock: 40,
            },
            Product {
                id: 3,
                title: "Designer T-Shirt".to_string(),
                category: "Fashion".to_string(),
                price_cents: 120_000,
                stock: 75,
            },
        ])
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = fs::read(path)
            .await
            .with_context(|| format!("failed to read catalog file {}", path.display()))?;
        let products = serde_json::from_slice::<Vec<Product>>(&payload)
            .with_context(|| format!("invalid catalog file {}", path.display()))?;
        Ok(Self::new(products))
    }

    /// Simulates the backing store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.available.load(Ordering::Relaxed) {
            bail!("catalog store is unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn probe(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn fetch(&self, query: &CatalogQuery) -> Result<Option<serde_json::Value>> {
        self.ensure_available()?;

        let value = match query {
            CatalogQuery::Listing {
                category,
                limit,
                offset,
            } => {
                let matching: Vec<&Product> = self
                    .products
                    .iter()
                    .filter(|product| in_category(product, category.as_deref()))
                    .collect();
                paged(&matching, *limit, *offset)
            }
            CatalogQuery::Search {
                q,
                category,
                limit,
                offset,
            } => {
                let matching: Vec<&Product> = self
                    .products
                    .iter()
                    .filter(|product| in_category(product, category.as_deref()))
                    .filter(|product| product.title.to_lowercase().contains(q.as_str()))
                    .collect();

                let mut page = paged(&matching, *limit, *offset);
                page["query"] = json!(q);
                page
            }
            CatalogQuery::Product { id } => {
                match self.products.iter().find(|product| product.id == *id) {
                    Some(product) => serde_json::to_value(product)?,
                    None => return Ok(None),
                }
            }
            CatalogQuery::Categories => {
                let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
                for product in &self.products {
                    *counts.entry(product.category.as_str()).or_default() += 1;
                }

                let mut categories: Vec<(&str, usize)> = counts.into_iter().collect();
                categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

                let categories: Vec<serde_json::Value> = categories
                    .into_iter()
                    .map(|(category, product_count)| {
                        json!({ "category": category, "product_count": product_count })
                    })
                    .collect();
                json!({ "categories": categories })
            }
        };

        Ok(Some(value))
    }
}

fn in_category(product: &Product, wanted: Option<&str>) -> bool {
    wanted
        .map(|wanted| product.category.eq_ignore_ascii_case(wanted))
        .unwrap_or(true)
}

fn paged(matching: &[&Product], limit: usize, offset: usize) -> serde_json::Value {
    let page: Vec<&Product> = matching.iter().skip(offset).take(limit).copied().collect();

    json!({
        "total": matching.len(),
        "limit": limit,
        "offset": offset,
        "products": page,
    })
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Hit(Bytes),
    Miss(Bytes),
    NotFound,
}

/// Serves `query` from the cache, falling back to the store on a miss.
///
/// The cache lock is released while the store is queried, so two concurrent
/// misses for the same key may both reach the store.
pub async fn read_through(
    cache: &Mutex<BoundedCache>,
    store: &dyn CatalogStore,
    query: &CatalogQuery,
) -> Result<ReadOutcome, CatalogError> {
    let key = query.cache_key();

    let cached = cache.lock().await.get(&key);
    if let Some(cached) = cached {
        return Ok(ReadOutcome::Hit(cached));
    }

    let fetched = store
        .fetch(query)
        .await
        .map_err(|err| CatalogError::Unavailable(format!("{err:#}")))?;
    let Some(value) = fetched else {
        return Ok(ReadOutcome::NotFound);
    };

    let payload = Bytes::from(serde_json::to_vec(&value)?);
    if let Err(err) = cache.lock().await.put(key.as_str(), payload.clone(), None) {
        warn!(key = %key, error = %err, "catalog response not cached");
    }

    Ok(ReadOutcome::Miss(payload))
}
