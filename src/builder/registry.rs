use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::engine::Builder;
use crate::errors::BuilderError;

/// The builders hosted by this process, by name.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: DashMap<String, Arc<Builder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a builder. Names are unique; a second builder with the same
    /// name is rejected.
    pub fn add(&self, builder: Arc<Builder>) -> Result<(), BuilderError> {
        match self.builders.entry(builder.name().to_string()) {
            Entry::Occupied(entry) => Err(BuilderError::InvalidSettings(format!(
                "builder '{}' is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(builder);
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Builder>> {
        self.builders.remove(name).map(|(_, builder)| builder)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Builder>, BuilderError> {
        self.builders
            .get(name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| BuilderError::UnknownBuilder(name.to_string()))
    }

    /// Builder names in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<Builder>> {
        let mut all: Vec<Arc<Builder>> = self.builders.iter().map(|b| Arc::clone(b.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn start_all(&self) -> Result<(), BuilderError> {
        for builder in self.all() {
            builder.start()?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for builder in self.all() {
            builder.stop().await;
        }
    }
}
