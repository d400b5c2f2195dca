//! Normalized resource documents as handed over by the serializer.
//!
//! The shape follows the usual `{ data, included }` convention. Relationship
//! `data` distinguishes "absent" (nothing known, leave the edge alone) from
//! `null` (known to be empty).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::field_value::Attributes;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceIdentifier {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }

    pub fn local(resource_type: impl Into<String>, lid: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            lid: Some(lid.into()),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.resource_type.is_empty() {
            return Err(CoreError::InvalidDocument(
                "resource identifier without a type".into(),
            ));
        }
        if matches!(self.id.as_deref(), Some("")) {
            return Err(CoreError::InvalidDocument(format!(
                "empty id for resource of type {}",
                self.resource_type
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(ResourceIdentifier),
}

impl Linkage {
    pub fn members(&self) -> &[ResourceIdentifier] {
        match self {
            Linkage::Many(items) => items,
            Linkage::One(item) => std::slice::from_ref(item),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipObject {
    /// `None` when the payload says nothing about membership,
    /// `Some(None)` for an explicit `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<Linkage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<RelationshipLinks>,
}

impl RelationshipObject {
    /// Members named by the payload, or `None` when membership is unknown.
    pub fn members(&self) -> Option<&[ResourceIdentifier]> {
        match &self.data {
            None => None,
            Some(None) => Some(&[]),
            Some(Some(linkage)) => Some(linkage.members()),
        }
    }

    pub fn related_link(&self) -> Option<&str> {
        self.links.as_ref().and_then(|l| l.related.as_deref())
    }
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipObject>,
}

impl ResourceObject {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
            attributes: Attributes::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(ResourceObject),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub data: Option<PrimaryData>,
    #[serde(default)]
    pub included: Vec<ResourceObject>,
}

impl Document {
    pub fn single(resource: ResourceObject) -> Self {
        Self {
            data: Some(PrimaryData::One(resource)),
            included: Vec::new(),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn primary(&self) -> &[ResourceObject] {
        match &self.data {
            None => &[],
            Some(PrimaryData::Many(items)) => items,
            Some(PrimaryData::One(item)) => std::slice::from_ref(item),
        }
    }

    /// Primary resources first, then included ones, in payload order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceObject> {
        self.primary().iter().chain(self.included.iter())
    }
}
