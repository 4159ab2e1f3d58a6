//! Static per-product configuration: which segments, tags and CRM field
//! mappings apply to a plugin id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read product catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse product catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("plugin id {0} is configured more than once")]
    Duplicate(String),
    #[error("product for plugin id {0} has an empty slug")]
    EmptySlug(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductTags {
    #[serde(default)]
    pub free: Vec<String>,
    #[serde(default)]
    pub premium: Vec<String>,
    #[serde(default)]
    pub misc: Vec<String>,
}

/// Where a CRM field takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// A key of the webhook's `user` object.
    Source(String),
    /// A fixed value.
    Constant(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductConfig {
    pub plugin_id: String,
    /// Prefix for lifecycle tags (`{slug}-installed`, ...).
    pub slug: String,
    #[serde(default)]
    pub segments: Vec<u64>,
    #[serde(default)]
    pub tags: ProductTags,
    /// CRM field name -> value source.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSource>,
}

impl ProductConfig {
    pub fn installed_tag(&self) -> String {
        format!("{}-installed", self.slug)
    }

    pub fn uninstalled_tag(&self) -> String {
        format!("{}-uninstalled", self.slug)
    }

    pub fn activated_tag(&self) -> String {
        format!("{}-activated", self.slug)
    }

    pub fn deactivated_tag(&self) -> String {
        format!("{}-deactivated", self.slug)
    }

    /// CRM field holding the licensing platform's user id, if one is mapped.
    pub fn external_id_field(&self) -> Option<&str> {
        self.fields.iter().find_map(|(field, source)| match source {
            FieldSource::Source(key) if key == "id" => Some(field.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: HashMap<String, ProductConfig>,
}

impl ProductCatalog {
    pub fn new(products: Vec<ProductConfig>) -> Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(products.len());
        for product in products {
            if product.slug.trim().is_empty() {
                return Err(CatalogError::EmptySlug(product.plugin_id));
            }
            let plugin_id = product.plugin_id.clone();
            if map.insert(plugin_id.clone(), product).is_some() {
                return Err(CatalogError::Duplicate(plugin_id));
            }
        }
        Ok(Self { products: map })
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let products: Vec<ProductConfig> = serde_json::from_str(raw)?;
        Self::new(products)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// The products this deployment ships with.
    pub fn builtin() -> Self {
        let products = [("kikote", "8507", 2), ("dps", "11538", 3), ("printus", "12321", 4)]
            .into_iter()
            .map(|(slug, plugin_id, segment)| ProductConfig {
                plugin_id: plugin_id.to_string(),
                slug: slug.to_string(),
                segments: vec![segment],
                tags: ProductTags {
                    free: vec![format!("{slug}-free-user")],
                    premium: vec![format!("{slug}-pro-user")],
                    misc: vec![format!("{slug}-user")],
                },
                fields: BTreeMap::from([
                    ("freemius_id".to_string(), FieldSource::Source("id".to_string())),
                    (format!("{slug}_gross"), FieldSource::Source("gross".to_string())),
                ]),
            })
            .map(|p| (p.plugin_id.clone(), p))
            .collect();
        Self { products }
    }

    pub fn resolve(&self, plugin_id: &str) -> Option<&ProductConfig> {
        self.products.get(plugin_id)
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductConfig> {
        self.products.values()
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
