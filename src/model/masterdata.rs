//! Master data (vocabulary elements) referenced by events

use serde::{Deserialize, Serialize};

/// Vocabulary type of read points
pub const READ_POINT_TYPE: &str = "urn:epcglobal:epcis:vtype:ReadPoint";
/// Vocabulary type of business locations
pub const BUSINESS_LOCATION_TYPE: &str = "urn:epcglobal:epcis:vtype:BusinessLocation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDataAttribute {
    pub id: String,
    pub value: String,
}

/// One vocabulary element with its attributes and direct children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterData {
    pub md_type: String,
    pub id: String,
    #[serde(default)]
    pub attributes: Vec<MasterDataAttribute>,
    /// Ids of direct children; stored as parent -> child hierarchy links
    #[serde(default)]
    pub children: Vec<String>,
}

impl MasterData {
    pub fn new(md_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            md_type: md_type.into(),
            id: id.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(MasterDataAttribute {
            id: id.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.children.push(child_id.into());
        self
    }
}
