//! Image catalog module.
//!
//! Controller hosts publish a JSON catalog of machine images: products,
//! each with dated versions, each listing concrete items. The on-disk
//! format is normalized - shared attributes live as high up the tree as
//! possible, and items may reference shared attribute sets through the
//! catalog's alias table. [`resolve`] denormalizes a catalog into flat
//! records by expanding aliases first and then applying the fixed list of
//! inheritance edges, parent before child, so resolution is deterministic
//! regardless of record order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The attributes that propagate down the catalog tree. One field per
/// inheritance edge; a blank child field inherits its parent's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    /// Region the image is served from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Endpoint serving the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// CPU architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,

    /// OS release name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    /// Virtualization type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virt_type: Option<String>,

    /// Root storage type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_store: Option<String>,
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(str::is_empty)
}

impl Attrs {
    /// Fill each blank field from `parent`. The explicit edge list of the
    /// denormalization pass: every propagated attribute is named here.
    fn fill_missing_from(&mut self, parent: &Self) {
        let edges: [(&mut Option<String>, &Option<String>); 6] = [
            (&mut self.region, &parent.region),
            (&mut self.endpoint, &parent.endpoint),
            (&mut self.arch, &parent.arch),
            (&mut self.release, &parent.release),
            (&mut self.virt_type, &parent.virt_type),
            (&mut self.root_store, &parent.root_store),
        ];
        for (child, parent_value) in edges {
            if is_blank(child.as_deref()) && !is_blank(parent_value.as_deref()) {
                child.clone_from(parent_value);
            }
        }
    }
}

/// A parsed image catalog document.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageCatalog {
    /// Catalog-wide attributes, the root of the inheritance chain.
    #[serde(flatten)]
    pub attrs: Attrs,

    /// Alias table: attribute key to alias value to attribute set.
    #[serde(default, rename = "_aliases")]
    pub aliases: BTreeMap<String, BTreeMap<String, Attrs>>,

    /// Products by name.
    pub products: BTreeMap<String, Product>,
}

/// A product entry: one image line across versions.
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    /// Product-level attributes.
    #[serde(flatten)]
    pub attrs: Attrs,

    /// Dated versions by version string.
    pub versions: BTreeMap<String, Version>,
}

/// A dated version of a product.
#[derive(Debug, Clone, Deserialize)]
pub struct Version {
    /// Version-level attributes.
    #[serde(flatten)]
    pub attrs: Attrs,

    /// Concrete items by item key.
    pub items: BTreeMap<String, Item>,
}

/// A concrete image item.
#[derive(Debug, Clone, Deserialize)]
pub struct Item {
    /// The provider image identifier. Defaults to the item key.
    #[serde(default)]
    pub id: String,

    /// Item-level attributes.
    #[serde(flatten)]
    pub attrs: Attrs,

    /// Remaining fields, including alias references.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A fully denormalized image record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// The product the record came from.
    pub product: String,
    /// The version the record came from.
    pub version: String,
    /// The provider image identifier.
    pub image_id: String,
    /// Resolved attributes.
    pub attrs: Attrs,
}

/// Errors from catalog resolution.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The document is not valid JSON for the catalog schema.
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse and denormalize a catalog document into flat image records,
/// sorted by product, version, and item key.
///
/// # Errors
///
/// Returns an error if the document cannot be parsed.
pub fn resolve(document: &str) -> Result<Vec<ImageRecord>, CatalogError> {
    let catalog: ImageCatalog = serde_json::from_str(document)?;
    let mut records = Vec::new();

    for (product_name, product) in &catalog.products {
        let mut product_attrs = product.attrs.clone();
        product_attrs.fill_missing_from(&catalog.attrs);

        for (version_name, version) in &product.versions {
            let mut version_attrs = version.attrs.clone();
            version_attrs.fill_missing_from(&product_attrs);

            for (item_key, item) in &version.items {
                let mut attrs = item.attrs.clone();

                // Aliases first, then inheritance: an alias reference is
                // part of the item itself, so its values take precedence
                // over anything inherited from above.
                for (alias_attr, table) in &catalog.aliases {
                    if let Some(serde_json::Value::String(reference)) = item.extra.get(alias_attr)
                    {
                        if let Some(alias_attrs) = table.get(reference) {
                            attrs.fill_missing_from(alias_attrs);
                        }
                    }
                }
                attrs.fill_missing_from(&version_attrs);

                let image_id = if item.id.is_empty() {
                    item_key.clone()
                } else {
                    item.id.clone()
                };
                records.push(ImageRecord {
                    product: product_name.clone(),
                    version: version_name.clone(),
                    image_id,
                    attrs,
                });
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "region": "us-east-1",
        "endpoint": "https://images.east.example.com",
        "_aliases": {
            "crsn": {
                "uswest": {
                    "region": "us-west-1",
                    "endpoint": "https://images.west.example.com"
                }
            }
        },
        "products": {
            "com.example:server:24.04:amd64": {
                "arch": "amd64",
                "release": "noble",
                "versions": {
                    "20260115": {
                        "virt_type": "kvm",
                        "items": {
                            "east": { "id": "img-111" },
                            "west": { "id": "img-222", "crsn": "uswest" }
                        }
                    }
                }
            }
        }
    }"#;

    fn record<'a>(records: &'a [ImageRecord], id: &str) -> &'a ImageRecord {
        records
            .iter()
            .find(|record| record.image_id == id)
            .expect("record not found")
    }

    #[test]
    fn test_attributes_inherit_down_the_tree() {
        let records = resolve(CATALOG).expect("resolve failed");
        assert_eq!(records.len(), 2);

        let east = record(&records, "img-111");
        assert_eq!(east.attrs.region.as_deref(), Some("us-east-1"));
        assert_eq!(east.attrs.arch.as_deref(), Some("amd64"));
        assert_eq!(east.attrs.release.as_deref(), Some("noble"));
        assert_eq!(east.attrs.virt_type.as_deref(), Some("kvm"));
        assert_eq!(east.product, "com.example:server:24.04:amd64");
        assert_eq!(east.version, "20260115");
    }

    #[test]
    fn test_aliases_expand_before_inheritance() {
        let records = resolve(CATALOG).expect("resolve failed");
        let west = record(&records, "img-222");

        // The alias's region wins over the catalog-level region.
        assert_eq!(west.attrs.region.as_deref(), Some("us-west-1"));
        assert_eq!(
            west.attrs.endpoint.as_deref(),
            Some("https://images.west.example.com")
        );
        // Attributes the alias does not set still inherit normally.
        assert_eq!(west.attrs.arch.as_deref(), Some("amd64"));
        assert_eq!(west.attrs.virt_type.as_deref(), Some("kvm"));
    }

    #[test]
    fn test_explicit_item_attributes_win() {
        let document = r#"{
            "region": "us-east-1",
            "products": {
                "p": {
                    "versions": {
                        "1": {
                            "items": {
                                "i": { "id": "img-1", "region": "eu-central-1" }
                            }
                        }
                    }
                }
            }
        }"#;
        let records = resolve(document).expect("resolve failed");
        assert_eq!(records[0].attrs.region.as_deref(), Some("eu-central-1"));
    }

    #[test]
    fn test_blank_strings_inherit() {
        let document = r#"{
            "arch": "arm64",
            "products": {
                "p": {
                    "versions": {
                        "1": {
                            "items": {
                                "i": { "id": "img-1", "arch": "" }
                            }
                        }
                    }
                }
            }
        }"#;
        let records = resolve(document).expect("resolve failed");
        assert_eq!(records[0].attrs.arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn test_item_key_is_fallback_id() {
        let document = r#"{
            "products": {
                "p": { "versions": { "1": { "items": { "img-key": {} } } } }
            }
        }"#;
        let records = resolve(document).expect("resolve failed");
        assert_eq!(records[0].image_id, "img-key");
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        assert!(matches!(
            resolve("{\"products\": 3}"),
            Err(CatalogError::Parse(_))
        ));
    }
}
