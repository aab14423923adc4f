// src/handle/store.rs

//! Process-wide object type cache.
//!
//! Maps the numeric object type index the kernel ships on handle events to
//! the object manager's type name. Type indices are stable for a boot
//! session, so entries are never evicted and a re-registration simply
//! overwrites.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

#[derive(Debug, Default)]
pub struct ObjectTypeStore {
    types: RwLock<HashMap<u16, String>>,
}

impl ObjectTypeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_id(&self, type_id: u16) -> Option<String> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned()
    }

    pub fn register_type(&self, type_id: u16, name: impl Into<String>) {
        let name = name.into();
        log::debug!("registering object type {type_id} => {name}");
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_id, name);
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
