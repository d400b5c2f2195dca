//! Builders for documents and resource objects from `serde_json` values.

use recordcache_core::{
    document::{Document, ResourceIdentifier, ResourceObject},
    field_value::{Attributes, FieldValue},
    CoreError,
};

pub fn document(value: serde_json::Value) -> Result<Document, CoreError> {
    Document::from_json(value)
}

pub fn resource(value: serde_json::Value) -> Result<ResourceObject, CoreError> {
    serde_json::from_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn identifier(resource_type: &str, id: &str) -> ResourceIdentifier {
    ResourceIdentifier::new(resource_type, id)
}

pub fn text_attributes(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(field, value)| (field.to_string(), FieldValue::from(*value)))
        .collect()
}
