//! Read realms of a content type
//!
//! Derived once from the type's grants so that read checks are set lookups.

use super::grant::Grant;
use crate::session::UserRealms;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Realms {
    /// Realms that may read resources of the type
    pub resource_readers: BTreeSet<String>,
    /// Realms that may read every field
    pub all_field_readers: BTreeSet<String>,
    /// Field name -> realms that may read it
    pub field_readers: HashMap<String, BTreeSet<String>>,
}

impl Realms {
    pub fn from_grants(grants: &[Grant]) -> Self {
        let mut realms = Self::default();
        for grant in grants {
            let realm = grant.realm().to_string();
            if grant.may_read_resource {
                realms.resource_readers.insert(realm.clone());
            }
            if !grant.may_read_fields {
                continue;
            }
            match &grant.fields {
                Some(fields) if !fields.is_empty() => {
                    for field in fields {
                        realms
                            .field_readers
                            .entry(field.clone())
                            .or_default()
                            .insert(realm.clone());
                    }
                }
                _ => {
                    realms.all_field_readers.insert(realm);
                }
            }
        }
        realms
    }

    pub fn may_read_resource(&self, user_realms: &UserRealms) -> bool {
        !self.resource_readers.is_disjoint(user_realms)
    }

    pub fn may_read_all_fields(&self, user_realms: &UserRealms) -> bool {
        !self.all_field_readers.is_disjoint(user_realms)
    }

    pub fn may_read_field(&self, field: &str, user_realms: &UserRealms) -> bool {
        self.may_read_all_fields(user_realms)
            || self
                .field_readers
                .get(field)
                .map(|readers| !readers.is_disjoint(user_realms))
                .unwrap_or(false)
    }
}
