use crate::database::Database;
use crate::endpoint::Endpoint;
use crate::error::{DtsError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Name-keyed lookup for the configured databases and endpoints.
///
/// Built once at startup and shared read-only between the task supervisor
/// and the HTTP layer.
#[derive(Default)]
pub struct Registry {
    databases: HashMap<String, Arc<dyn Database>>,
    endpoints: HashMap<String, Arc<dyn Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&mut self, name: impl Into<String>, database: Arc<dyn Database>) {
        self.databases.insert(name.into(), database);
    }

    pub fn add_endpoint(&mut self, name: impl Into<String>, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(name.into(), endpoint);
    }

    pub fn database(&self, name: &str) -> Result<Arc<dyn Database>> {
        self.databases
            .get(name)
            .cloned()
            .ok_or_else(|| DtsError::DatabaseNotFound(name.to_string()))
    }

    pub fn endpoint(&self, name: &str) -> Result<Arc<dyn Endpoint>> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| DtsError::EndpointNotFound(name.to_string()))
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn database_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.databases.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &Arc<dyn Endpoint>)> {
        self.endpoints.iter().map(|(k, v)| (k.as_str(), v))
    }
}
