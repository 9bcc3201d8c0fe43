use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::limits::{MAX_CATALOG_SIZE, MAX_NAME_LEN, MAX_RESOURCE_ID_LEN};
use crate::model::{Category, Resource, ResourceId};

/// Read-only view of the resources that can be booked. The store asks it
/// whether a resource exists; it never writes to it.
pub trait Catalog: Send + Sync {
    fn resource(&self, id: &ResourceId) -> Option<Resource>;

    /// Every resource, ordered by id.
    fn resources(&self) -> Vec<Resource>;

    fn resource_exists(&self, id: &ResourceId) -> bool {
        self.resource(id).is_some()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate resource id: {0}")]
    DuplicateId(ResourceId),
    #[error("invalid resource {id:?}: {reason}")]
    Invalid { id: String, reason: &'static str },
    #[error("catalog has more than {max} resources")]
    TooLarge { max: usize },
}

/// Catalog fixed at construction time.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    resources: HashMap<ResourceId, Resource>,
}

impl StaticCatalog {
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Result<Self, CatalogError> {
        let mut map = HashMap::new();
        for resource in resources {
            validate(&resource)?;
            if map.len() >= MAX_CATALOG_SIZE {
                return Err(CatalogError::TooLarge {
                    max: MAX_CATALOG_SIZE,
                });
            }
            if map.contains_key(&resource.id) {
                return Err(CatalogError::DuplicateId(resource.id));
            }
            map.insert(resource.id.clone(), resource);
        }
        Ok(Self { resources: map })
    }

    /// Load a JSON array of resources.
    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let resources: Vec<Resource> = serde_json::from_str(text)?;
        Self::new(resources)
    }

    /// The campus rooms and labs available out of the box.
    pub fn campus_defaults() -> Self {
        let seed = [
            ("main-seminar-hall-d", "Main Seminar Hall (D Block)", Category::Room, 150, "AC, Projector"),
            ("fcs-lab-1", "FCS Lab 1", Category::Lab, 30, "Linux, Python Environment"),
            ("central-library-e", "Central Library (E Block)", Category::Lab, 100, "Quiet Zone, WiFi"),
            ("smart-classroom-admin", "Smart Classroom (Admin Block)", Category::Room, 60, "Smart Board"),
            ("ac-classroom", "AC Classroom", Category::Room, 50, "White Board, Fan"),
            ("mini-seminar-hall-b", "Mini Seminar Hall (B Block)", Category::Room, 50, "AC, Smart Board"),
            ("chemistry-lab-1st-year", "Chemistry Lab (1st Year)", Category::Lab, 30, "Basic Instruments"),
        ];
        let resources = seed
            .into_iter()
            .map(|(id, name, category, capacity, requirements)| Resource {
                id: ResourceId::new(id),
                name: name.to_string(),
                category,
                capacity: Some(capacity),
                requirements: split_tags(requirements),
            })
            .map(|r| (r.id.clone(), r))
            .collect();
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn resource(&self, id: &ResourceId) -> Option<Resource> {
        self.resources.get(id).cloned()
    }

    fn resources(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = self.resources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn resource_exists(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }
}

/// Split free-text requirements like `"AC, Projector"` into tags.
pub fn split_tags(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate(resource: &Resource) -> Result<(), CatalogError> {
    let id = resource.id.as_str();
    let invalid = |reason| CatalogError::Invalid {
        id: id.to_string(),
        reason,
    };
    if id.trim().is_empty() {
        return Err(invalid("empty id"));
    }
    if id.len() > MAX_RESOURCE_ID_LEN {
        return Err(invalid("id too long"));
    }
    if resource.name.trim().is_empty() {
        return Err(invalid("empty name"));
    }
    if resource.name.len() > MAX_NAME_LEN {
        return Err(invalid("name too long"));
    }
    Ok(())
}
