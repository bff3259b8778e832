//! Grants
//!
//! A grant is a capability record: which actions, on which types and fields,
//! for which group. Grants without a group apply to everyone.

use super::model::{attr_bool, model_id, rel_id, rel_ids};
use crate::error::Result;
use crate::session::{UserRealms, EVERYONE};
use crate::storage::document::Resource;

/// Capability flags of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CreateResource,
    ReadResource,
    UpdateResource,
    DeleteResource,
    ReadFields,
    WriteFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: String,
    pub may_create_resource: bool,
    pub may_read_resource: bool,
    pub may_update_resource: bool,
    pub may_delete_resource: bool,
    pub may_read_fields: bool,
    pub may_write_fields: bool,
    /// Types this grant covers; None = all types
    pub types: Option<Vec<String>>,
    /// Fields this grant covers; None or empty = all fields
    pub fields: Option<Vec<String>>,
    /// Group this grant is for; None = everyone
    pub group_id: Option<String>,
}

impl Grant {
    pub fn from_model(model: &Resource) -> Result<Self> {
        Ok(Self {
            id: model_id(model)?.to_string(),
            may_create_resource: attr_bool(model, "may-create-resource", false),
            may_read_resource: attr_bool(model, "may-read-resource", false),
            may_update_resource: attr_bool(model, "may-update-resource", false),
            may_delete_resource: attr_bool(model, "may-delete-resource", false),
            may_read_fields: attr_bool(model, "may-read-fields", false),
            may_write_fields: attr_bool(model, "may-write-fields", false),
            types: rel_ids(model, "types"),
            fields: rel_ids(model, "fields"),
            group_id: rel_id(model, "who"),
        })
    }

    /// A grant for everyone with no capabilities, for builder-style setup
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            may_create_resource: false,
            may_read_resource: false,
            may_update_resource: false,
            may_delete_resource: false,
            may_read_fields: false,
            may_write_fields: false,
            types: None,
            fields: None,
            group_id: None,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::CreateResource => self.may_create_resource,
            Capability::ReadResource => self.may_read_resource,
            Capability::UpdateResource => self.may_update_resource,
            Capability::DeleteResource => self.may_delete_resource,
            Capability::ReadFields => self.may_read_fields,
            Capability::WriteFields => self.may_write_fields,
        }
    }

    /// The realm this grant gives capabilities to
    pub fn realm(&self) -> &str {
        self.group_id.as_deref().unwrap_or(EVERYONE)
    }

    pub fn applies_to_type(&self, kind: &str) -> bool {
        match &self.types {
            None => true,
            Some(types) => types.iter().any(|t| t == kind),
        }
    }

    /// True when the grant names no fields, i.e. covers all of them
    pub fn covers_all_fields(&self) -> bool {
        self.fields.as_ref().map(|f| f.is_empty()).unwrap_or(true)
    }

    pub fn covers_field(&self, field: &str) -> bool {
        self.covers_all_fields()
            || self
                .fields
                .as_ref()
                .map(|f| f.iter().any(|name| name == field))
                .unwrap_or(false)
    }

    /// Does this grant apply to `document` for a requester in `user_realms`?
    pub fn matches(&self, document: &Resource, user_realms: &UserRealms) -> bool {
        if !self.applies_to_type(&document.kind) {
            return false;
        }
        match &self.group_id {
            None => true,
            Some(group) => user_realms.contains(group),
        }
    }
}

/// First grant, in declaration order, that has `capability` and matches
pub fn find_matching<'a>(
    grants: &'a [Grant],
    capability: Capability,
    document: &Resource,
    user_realms: &UserRealms,
) -> Option<&'a Grant> {
    for grant in grants {
        if grant.allows(capability) && grant.matches(document, user_realms) {
            return Some(grant);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn realms(names: &[&str]) -> UserRealms {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_groupless_grant_matches_everyone() {
        let mut grant = Grant::new("g");
        grant.may_read_resource = true;
        let doc = Resource::new("articles", Some("1".into()));
        assert!(grant.matches(&doc, &realms(&[])));
        assert!(grant.matches(&doc, &realms(&["editors"])));
        assert_eq!(grant.realm(), EVERYONE);
    }

    #[test]
    fn test_group_and_type_scoping() {
        let model: Resource = serde_json::from_value(json!({
            "type": "grants",
            "id": "editors-write",
            "attributes": {"may-update-resource": true},
            "relationships": {
                "types": {"data": [{"type": "content-types", "id": "articles"}]},
                "who": {"data": {"type": "groups", "id": "editors"}}
            }
        }))
        .unwrap();
        let grant = Grant::from_model(&model).unwrap();
        let article = Resource::new("articles", Some("1".into()));
        let event = Resource::new("events", Some("1".into()));
        assert!(grant.matches(&article, &realms(&["editors"])));
        assert!(!grant.matches(&article, &realms(&[EVERYONE])));
        assert!(!grant.matches(&event, &realms(&["editors"])));
    }

    #[test]
    fn test_field_coverage() {
        let mut grant = Grant::new("g");
        assert!(grant.covers_field("anything"));
        grant.fields = Some(vec![]);
        assert!(grant.covers_all_fields());
        grant.fields = Some(vec!["title".into()]);
        assert!(grant.covers_field("title"));
        assert!(!grant.covers_field("body"));
    }

    #[test]
    fn test_first_match_wins() {
        let mut a = Grant::new("a");
        a.may_read_resource = true;
        a.group_id = Some("editors".into());
        let mut b = Grant::new("b");
        b.may_read_resource = true;
        let mut c = Grant::new("c");
        c.may_read_resource = true;
        let grants = vec![a, b, c];
        let doc = Resource::new("articles", None);
        let found = find_matching(&grants, Capability::ReadResource, &doc, &realms(&[])).unwrap();
        assert_eq!(found.id, "b");
    }

    #[test]
    fn test_missing_id_fails() {
        let model = Resource::new("grants", None);
        assert!(Grant::from_model(&model).is_err());
    }
}
