//! Schema lookup: which relationship fields a type has, their cardinality,
//! inverse and whether unloaded members are tolerated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    #[serde(rename = "to-one", alias = "belongsTo")]
    ToOne,
    #[serde(rename = "to-many", alias = "hasMany")]
    ToMany,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToOne => "to-one",
            Self::ToMany => "to-many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipSchema {
    pub name: String,
    pub kind: RelationshipKind,
    pub related_type: String,
    pub inverse: Option<String>,
    pub is_async: bool,
}

/// Lookup capability provided by the schema collaborator.
pub trait SchemaSource: Send + Sync {
    fn relationship(&self, resource_type: &str, field: &str) -> Option<RelationshipSchema>;

    fn relationships_for(&self, resource_type: &str) -> Vec<RelationshipSchema>;

    fn attributes_for(&self, resource_type: &str) -> Vec<String>;

    fn has_type(&self, resource_type: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelationshipDecl {
    kind: RelationshipKind,
    #[serde(rename = "type")]
    related_type: String,
    #[serde(default)]
    inverse: Option<String>,
    #[serde(default, rename = "async")]
    is_async: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TypeDecl {
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    relationships: BTreeMap<String, RelationshipDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    types: BTreeMap<String, TypeDecl>,
}

/// In-memory schema built in code or parsed from TOML.
///
/// ```toml
/// [types.user]
/// attributes = ["name"]
///
/// [types.user.relationships.bestFriend]
/// kind = "to-one"
/// type = "user"
/// inverse = "bestFriend"
/// async = false
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    types: BTreeMap<String, TypeDecl>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, CoreError> {
        let file: SchemaFile =
            toml::from_str(source).map_err(|e| CoreError::Config(e.to_string()))?;
        let schema = Self { types: file.types };
        schema.check_inverses()?;
        Ok(schema)
    }

    pub fn resource_type(mut self, name: &str, attributes: &[&str]) -> Self {
        let decl = self.types.entry(name.to_string()).or_default();
        decl.attributes
            .extend(attributes.iter().map(|a| a.to_string()));
        self
    }

    pub fn relationship(
        mut self,
        owner: &str,
        field: &str,
        kind: RelationshipKind,
        related_type: &str,
        inverse: Option<&str>,
        is_async: bool,
    ) -> Self {
        let decl = self.types.entry(owner.to_string()).or_default();
        decl.relationships.insert(
            field.to_string(),
            RelationshipDecl {
                kind,
                related_type: related_type.to_string(),
                inverse: inverse.map(str::to_string),
                is_async,
            },
        );
        self.types.entry(related_type.to_string()).or_default();
        self
    }

    /// Every declared inverse must exist on the related type and point back.
    pub fn check_inverses(&self) -> Result<(), CoreError> {
        for (owner, decl) in &self.types {
            for (field, rel) in &decl.relationships {
                let Some(inverse) = &rel.inverse else {
                    continue;
                };
                let back = self
                    .types
                    .get(&rel.related_type)
                    .and_then(|t| t.relationships.get(inverse))
                    .ok_or_else(|| {
                        CoreError::Schema(format!(
                            "{owner}.{field} names inverse {}.{inverse} which does not exist",
                            rel.related_type
                        ))
                    })?;
                if back.inverse.as_deref() != Some(field.as_str()) || back.related_type != *owner {
                    return Err(CoreError::Schema(format!(
                        "{owner}.{field} and {}.{inverse} are not declared as inverses of each other",
                        rel.related_type
                    )));
                }
            }
        }
        Ok(())
    }

    fn to_schema(field: &str, decl: &RelationshipDecl) -> RelationshipSchema {
        RelationshipSchema {
            name: field.to_string(),
            kind: decl.kind,
            related_type: decl.related_type.clone(),
            inverse: decl.inverse.clone(),
            is_async: decl.is_async,
        }
    }
}

impl SchemaSource for StaticSchema {
    fn relationship(&self, resource_type: &str, field: &str) -> Option<RelationshipSchema> {
        self.types
            .get(resource_type)?
            .relationships
            .get(field)
            .map(|decl| Self::to_schema(field, decl))
    }

    fn relationships_for(&self, resource_type: &str) -> Vec<RelationshipSchema> {
        self.types
            .get(resource_type)
            .map(|t| {
                t.relationships
                    .iter()
                    .map(|(field, decl)| Self::to_schema(field, decl))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn attributes_for(&self, resource_type: &str) -> Vec<String> {
        self.types
            .get(resource_type)
            .map(|t| t.attributes.clone())
            .unwrap_or_default()
    }

    fn has_type(&self, resource_type: &str) -> bool {
        self.types.contains_key(resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOG: &str = r#"
        [types.user]
        attributes = ["name"]

        [types.user.relationships.posts]
        kind = "to-many"
        type = "post"
        inverse = "author"

        [types.post]
        attributes = ["title"]

        [types.post.relationships.author]
        kind = "to-one"
        type = "user"
        inverse = "posts"
        async = true
    "#;

    #[test]
    fn parses_toml_schema() {
        let schema = StaticSchema::from_toml_str(BLOG).unwrap();
        let author = SchemaSource::relationship(&schema, "post", "author").unwrap();
        assert_eq!(author.kind, RelationshipKind::ToOne);
        assert_eq!(author.inverse.as_deref(), Some("posts"));
        assert!(author.is_async);
        assert_eq!(schema.attributes_for("user"), vec!["name".to_string()]);
        assert_eq!(schema.relationships_for("user").len(), 1);
    }

    #[test]
    fn rejects_one_sided_inverse() {
        let schema = StaticSchema::new()
            .relationship("user", "posts", RelationshipKind::ToMany, "post", Some("author"), false)
            .relationship("post", "author", RelationshipKind::ToOne, "user", None, false);
        assert!(schema.check_inverses().is_err());
    }

    #[test]
    fn builder_registers_related_type() {
        let schema = StaticSchema::new().relationship(
            "user",
            "avatar",
            RelationshipKind::ToOne,
            "image",
            None,
            true,
        );
        assert!(schema.has_type("image"));
        assert!(SchemaSource::relationship(&schema, "user", "missing").is_none());
    }
}
