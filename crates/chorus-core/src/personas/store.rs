//! Loaded-once persona lookup

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::collaborators::ConfigSource;
use crate::error::RegistryError;

use super::definition::{PersonaDefinition, PersonaRecord};

/// Immutable set of personas, built at startup and shared by reference
#[derive(Debug, Default)]
pub struct PersonaStore {
    personas: HashMap<String, PersonaDefinition>,
    order: Vec<String>,
}

impl PersonaStore {
    /// Build from records. Malformed or duplicate records are skipped with a warning.
    pub fn load(records: impl IntoIterator<Item = PersonaRecord>) -> Self {
        let mut store = Self::default();
        for record in records {
            let key = record.key.clone();
            match PersonaDefinition::from_record(record).and_then(|p| store.insert(p)) {
                Ok(()) => debug!("PersonaStore: loaded persona '{}'", key),
                Err(e) => warn!("PersonaStore: skipping persona record: {}", e),
            }
        }
        info!("PersonaStore: {} personas loaded", store.len());
        store
    }

    /// Build from whatever the configuration loader supplies
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        Ok(Self::load(source.persona_records()?))
    }

    fn insert(&mut self, persona: PersonaDefinition) -> Result<(), RegistryError> {
        if self.personas.contains_key(&persona.key) {
            return Err(RegistryError::DuplicatePersona(persona.key));
        }
        self.order.push(persona.key.clone());
        self.personas.insert(persona.key.clone(), persona);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PersonaDefinition> {
        self.personas.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.personas.contains_key(key)
    }

    /// Personas in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &PersonaDefinition> {
        self.order.iter().filter_map(|k| self.personas.get(k))
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
