//! Firmware manifest
//!
//! Maps a device's product identifier to its ordered set of
//! (firmware target, image file) pairs. Loaded lazily from YAML, cached for
//! the process lifetime, reloadable only on an explicit force-reload
//! request; the cache is never mutated while a reader holds it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::domain::FirmwareTarget;
use crate::error::{Error, Result};

/// One manifest line: a programmable target and its image file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub target: String,
    pub image: String,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    products: HashMap<String, Vec<ManifestEntry>>,
}

/// Parsed manifest: product identifier → ordered image set.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    products: HashMap<String, Vec<(FirmwareTarget, String)>>,
}

impl Manifest {
    /// Parse manifest YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(yaml)?;
        let products = file
            .products
            .into_iter()
            .map(|(product, entries)| {
                let targets = entries
                    .into_iter()
                    .map(|e| (FirmwareTarget(e.target), e.image))
                    .collect();
                (product, targets)
            })
            .collect();
        Ok(Self { products })
    }

    /// Load and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        let manifest = Self::from_yaml(&yaml)?;
        info!(
            path = %path.display(),
            products = manifest.products.len(),
            "manifest loaded"
        );
        Ok(manifest)
    }

    /// Ordered (target, image file) list for a product.
    pub fn targets_for(&self, product_id: &str) -> Result<&[(FirmwareTarget, String)]> {
        self.products
            .get(product_id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::ManifestEntryNotFound {
                product_id: product_id.to_string(),
            })
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }
}

/// Process-lifetime manifest cache.
pub struct ManifestCache {
    path: PathBuf,
    cached: RwLock<Option<Arc<Manifest>>>,
}

impl ManifestCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: RwLock::new(None),
        }
    }

    /// Build a cache pre-seeded with an already parsed manifest (tests,
    /// embedded defaults).
    pub fn preloaded(manifest: Manifest) -> Self {
        Self {
            path: PathBuf::new(),
            cached: RwLock::new(Some(Arc::new(manifest))),
        }
    }

    /// Get the manifest, loading it on first use.
    pub fn get(&self) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.cached.read().clone() {
            return Ok(manifest);
        }
        let manifest = Arc::new(Manifest::load(&self.path)?);
        *self.cached.write() = Some(manifest.clone());
        Ok(manifest)
    }

    /// Drop the cached copy and reload from disk.
    pub fn force_reload(&self) -> Result<Arc<Manifest>> {
        let manifest = Arc::new(Manifest::load(&self.path)?);
        *self.cached.write() = Some(manifest.clone());
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
products:
  ACME-PS-550:
    - target: primary
      image: acme_ps_550_primary.bin
    - target: secondary
      image: acme_ps_550_secondary.bin
  ACME-PS-700:
    - target: primary
      image: acme_ps_700.bin
"#;

    #[test]
    fn test_parse_and_lookup() {
        let manifest = Manifest::from_yaml(YAML).unwrap();
        assert_eq!(manifest.product_count(), 2);

        let targets = manifest.targets_for("ACME-PS-550").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].0, FirmwareTarget("primary".into()));
        assert_eq!(targets[0].1, "acme_ps_550_primary.bin");
        // order is preserved
        assert_eq!(targets[1].0, FirmwareTarget("secondary".into()));
    }

    #[test]
    fn test_unknown_product_is_lookup_error() {
        let manifest = Manifest::from_yaml(YAML).unwrap();
        let err = manifest.targets_for("NOPE").unwrap_err();
        assert!(err.is_lookup());
    }

    #[test]
    fn test_preloaded_cache_serves_without_disk() {
        let cache = ManifestCache::preloaded(Manifest::from_yaml(YAML).unwrap());
        let manifest = cache.get().unwrap();
        assert!(manifest.targets_for("ACME-PS-700").is_ok());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = Manifest::from_yaml("products: [not, a, map]").unwrap_err();
        assert!(matches!(err, Error::ManifestParse(_)));
    }
}
