//! A database: a named map of collections.

use crate::collection::Collection;
use crate::manager::{Ack, CommandLog};
use crate::validate_name;
use scintirete_core::{AofCommand, CollectionConfig, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct Database {
    name: String,
    collections: Arc<RwLock<HashMap<String, Arc<Collection>>>>,
}

impl Database {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn collections_arc(&self) -> Arc<RwLock<HashMap<String, Arc<Collection>>>> {
        Arc::clone(&self.collections)
    }

    pub async fn create_collection(
        &self,
        name: &str,
        config: CollectionConfig,
        log: Option<&CommandLog>,
    ) -> Result<Ack> {
        validate_name("collection", name)?;
        let collection = Collection::new(self.name.clone(), name.to_string(), config)?;

        let mut map = self.collections.write().await;
        if map.contains_key(name) {
            return Err(Error::AlreadyExists(format!("collection '{name}'")));
        }
        let ack = match log {
            Some(log) => log.submit(AofCommand::CreateCollection {
                db: self.name.clone(),
                name: name.to_string(),
                config,
            })?,
            None => Ack::none(),
        };
        map.insert(name.to_string(), Arc::new(collection));
        Ok(ack)
    }

    /// Removes the collection; its storage is released once in-flight
    /// readers drop their handles.
    pub async fn drop_collection(&self, name: &str, log: Option<&CommandLog>) -> Result<Ack> {
        let mut map = self.collections.write().await;
        if !map.contains_key(name) {
            return Err(Error::NotFound(format!("collection '{name}'")));
        }
        let ack = match log {
            Some(log) => log.submit(AofCommand::DropCollection {
                db: self.name.clone(),
                name: name.to_string(),
            })?,
            None => Ack::none(),
        };
        map.remove(name);
        Ok(ack)
    }

    pub async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }

    /// Collections sorted by name.
    pub async fn list_collections(&self) -> Vec<Arc<Collection>> {
        let map = self.collections.read().await;
        let mut collections: Vec<Arc<Collection>> = map.values().cloned().collect();
        collections.sort_by(|a, b| a.name().cmp(b.name()));
        collections
    }

    /// Installs a collection reconstructed during recovery.
    pub(crate) async fn adopt(&self, collection: Collection) -> Result<()> {
        let mut map = self.collections.write().await;
        let name = collection.name().to_string();
        if map.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("collection '{name}'")));
        }
        map.insert(name, Arc::new(collection));
        Ok(())
    }
}
