//! Defect catalog
//!
//! Maps positional occurrence counts and detection ids to named defect
//! definitions. The catalog is reloaded through a [`CatalogProvider`] on
//! every question; it is never cached across invocations.

use crate::db::StoreSession;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One defect definition as stored in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectDefinition {
    pub id: u32,
    pub class_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_acceptable: bool,
    #[serde(rename = "type", default)]
    pub defect_type: String,
}

/// Which occurrence array or detection block a defect came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectCategory {
    ObjectDetection,
    Ocr,
    Dimensional,
}

impl DefectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectDetection => "object_detection",
            Self::Ocr => "ocr",
            Self::Dimensional => "dimensional",
        }
    }
}

/// A counted, named defect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedDefect {
    pub id: u32,
    pub count: u64,
    pub description: String,
    pub is_acceptable: bool,
    pub category: DefectCategory,
}

/// Label and semantics for a defect id, known or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDefect {
    pub label: String,
    pub description: String,
    pub is_acceptable: bool,
}

/// Id-keyed lookup over one catalog load
#[derive(Debug, Clone, Default)]
pub struct DefectCatalog {
    by_id: HashMap<u32, DefectDefinition>,
}

impl DefectCatalog {
    pub fn from_definitions(definitions: Vec<DefectDefinition>) -> Self {
        Self {
            by_id: definitions.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn lookup(&self, id: u32) -> Option<&DefectDefinition> {
        self.by_id.get(&id)
    }

    /// Unknown ids resolve to a synthesized `Unknown_Defect_{id}` entry
    pub fn resolve(&self, id: u32) -> ResolvedDefect {
        match self.lookup(id) {
            Some(def) => ResolvedDefect {
                label: def.class_name.clone(),
                description: def.description.clone(),
                is_acceptable: def.is_acceptable,
            },
            None => ResolvedDefect {
                label: format!("Unknown_Defect_{id}"),
                description: "Unknown defect type".to_string(),
                is_acceptable: false,
            },
        }
    }

    /// Map an occurrence array, where index `i` counts defect id `i + 1`.
    ///
    /// Zero counts are skipped. Every non-zero entry is emitted; when two ids
    /// share a class name the later one is labelled `{class}_{id}`.
    pub fn map_occurrences(
        &self,
        counts: &[u64],
        category: DefectCategory,
    ) -> BTreeMap<String, MappedDefect> {
        let mut mapped = BTreeMap::new();

        for (index, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let id = index as u32 + 1;
            let resolved = self.resolve(id);

            let label = if mapped.contains_key(&resolved.label) {
                format!("{}_{id}", resolved.label)
            } else {
                resolved.label
            };

            mapped.insert(
                label,
                MappedDefect {
                    id,
                    count,
                    description: resolved.description,
                    is_acceptable: resolved.is_acceptable,
                    category,
                },
            );
        }

        mapped
    }
}

/// Source of a fresh catalog for each question
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn refresh(&self, session: &mut dyn StoreSession) -> Result<DefectCatalog>;
}

/// Loads definitions through the question's store session
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCatalog;

#[async_trait]
impl CatalogProvider for StoreCatalog {
    async fn refresh(&self, session: &mut dyn StoreSession) -> Result<DefectCatalog> {
        let definitions = session.load_defects().await?;
        crate::metrics::record_catalog_size(definitions.len());
        debug!(definitions = definitions.len(), "Defect catalog loaded");
        Ok(DefectCatalog::from_definitions(definitions))
    }
}

/// A constant catalog, independent of the store
#[derive(Debug, Clone, Default)]
pub struct FixedCatalog {
    definitions: Vec<DefectDefinition>,
}

impl FixedCatalog {
    pub fn new(definitions: Vec<DefectDefinition>) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl CatalogProvider for FixedCatalog {
    async fn refresh(&self, _session: &mut dyn StoreSession) -> Result<DefectCatalog> {
        Ok(DefectCatalog::from_definitions(self.definitions.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ProductionStore};

    fn definition(id: u32, class_name: &str, is_acceptable: bool) -> DefectDefinition {
        DefectDefinition {
            id,
            class_name: class_name.to_string(),
            description: format!("{class_name} description"),
            is_acceptable,
            defect_type: "visual".to_string(),
        }
    }

    fn catalog() -> DefectCatalog {
        DefectCatalog::from_definitions(vec![
            definition(1, "Scratch", true),
            definition(2, "Dent", false),
            definition(3, "Crack", false),
        ])
    }

    #[test]
    fn test_index_maps_to_id_plus_one_and_zeros_are_skipped() {
        let mapped = catalog().map_occurrences(&[0, 4, 0], DefectCategory::ObjectDetection);

        assert_eq!(mapped.len(), 1);
        let dent = &mapped["Dent"];
        assert_eq!(dent.id, 2);
        assert_eq!(dent.count, 4);
        assert!(!dent.is_acceptable);
        assert_eq!(dent.category, DefectCategory::ObjectDetection);
    }

    #[test]
    fn test_unknown_ids_are_never_dropped() {
        let mapped = catalog().map_occurrences(&[1, 0, 0, 0, 7], DefectCategory::Ocr);

        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped["Scratch"].count, 1);
        let unknown = &mapped["Unknown_Defect_5"];
        assert_eq!(unknown.id, 5);
        assert_eq!(unknown.count, 7);
        assert_eq!(unknown.description, "Unknown defect type");
        assert!(!unknown.is_acceptable);
    }

    #[test]
    fn test_no_zero_counts_for_any_array() {
        let counts = [0, 3, 0, 0, 1, 0, 2, 0];
        let mapped = catalog().map_occurrences(&counts, DefectCategory::Dimensional);

        assert_eq!(mapped.len(), 3);
        for defect in mapped.values() {
            assert!(defect.count > 0);
            assert_eq!(counts[defect.id as usize - 1], defect.count);
        }
    }

    #[test]
    fn test_shared_class_names_get_suffixed() {
        let catalog = DefectCatalog::from_definitions(vec![
            definition(1, "Burr", false),
            definition(2, "Burr", true),
        ]);
        let mapped = catalog.map_occurrences(&[2, 3], DefectCategory::ObjectDetection);

        assert_eq!(mapped["Burr"].id, 1);
        assert_eq!(mapped["Burr_2"].id, 2);
    }

    #[test]
    fn test_definition_wire_shape() {
        let def: DefectDefinition = serde_json::from_value(serde_json::json!({
            "id": 4,
            "className": "Porosity",
            "description": "Gas pockets",
            "isAcceptable": false,
            "type": "casting"
        }))
        .unwrap();

        assert_eq!(def.defect_type, "casting");
        assert_eq!(def.class_name, "Porosity");
    }

    #[tokio::test]
    async fn test_store_catalog_reloads_each_time() {
        let store = MemoryStore::new().with_defects(vec![definition(1, "Scratch", true)]);
        let mut session = store.connect().await.unwrap();

        let first = StoreCatalog.refresh(session.as_mut()).await.unwrap();
        assert_eq!(first.len(), 1);

        store.set_defects(vec![definition(1, "Scratch", true), definition(2, "Dent", false)]);
        let second = StoreCatalog.refresh(session.as_mut()).await.unwrap();
        assert_eq!(second.len(), 2);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_catalog_ignores_store() {
        let store = MemoryStore::new();
        let mut session = store.connect().await.unwrap();
        let fixed = FixedCatalog::new(vec![definition(9, "Warp", false)]);

        let catalog = fixed.refresh(session.as_mut()).await.unwrap();
        assert_eq!(catalog.resolve(9).label, "Warp");
        session.close().await.unwrap();
    }
}
