//! Contact groups and originating extensions known to the service.
//!
//! Both are seeded from configuration. Groups can also be created at runtime;
//! extensions are fixed for the life of the process.

use std::collections::HashMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::core::model::{ContactGroup, Extension};
use crate::errors::{CallError, CallResult};
use crate::utils::validate_phone_number;

pub struct Directory {
    groups: DashMap<String, ContactGroup>,
    extensions: HashMap<String, Extension>,
}

impl Directory {
    pub fn new(groups: Vec<ContactGroup>, extensions: Vec<Extension>) -> CallResult<Self> {
        let mut directory = Self {
            groups: DashMap::new(),
            extensions: HashMap::new(),
        };
        for extension in extensions {
            if directory.extensions.contains_key(&extension.number) {
                return Err(CallError::InvalidRequest(format!(
                    "duplicate extension number: {}",
                    extension.number
                )));
            }
            directory
                .extensions
                .insert(extension.number.clone(), extension);
        }
        for group in groups {
            directory.add_group(group)?;
        }
        Ok(directory)
    }

    /// Register a group. Member numbers are validated and normalized;
    /// duplicates within the list are kept.
    pub fn add_group(&self, group: ContactGroup) -> CallResult<ContactGroup> {
        let name = group.name.trim().to_string();
        if name.is_empty() {
            return Err(CallError::InvalidRequest("group name is empty".to_string()));
        }

        let numbers = group
            .numbers
            .iter()
            .map(|number| {
                validate_phone_number(number)
                    .map_err(|e| CallError::InvalidRequest(format!("group {name}: {e}")))
            })
            .collect::<CallResult<Vec<_>>>()?;

        let group = ContactGroup {
            name: name.clone(),
            numbers,
            caller_id: group.caller_id.filter(|c| !c.trim().is_empty()),
        };

        match self.groups.entry(name.clone()) {
            Entry::Occupied(_) => Err(CallError::InvalidRequest(format!(
                "group {name} already exists"
            ))),
            Entry::Vacant(slot) => {
                info!(group = %name, members = group.numbers.len(), "Registered contact group");
                slot.insert(group.clone());
                Ok(group)
            }
        }
    }

    pub fn group(&self, name: &str) -> CallResult<ContactGroup> {
        self.groups
            .get(name)
            .map(|group| group.value().clone())
            .ok_or_else(|| CallError::UnknownGroup(name.to_string()))
    }

    /// All groups, sorted by name.
    pub fn groups(&self) -> Vec<ContactGroup> {
        let mut groups: Vec<ContactGroup> = self
            .groups
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub fn extension(&self, number: &str) -> CallResult<&Extension> {
        self.extensions
            .get(number)
            .ok_or_else(|| CallError::UnknownExtension(number.to_string()))
    }
}
