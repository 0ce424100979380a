//! Persisted clouds.
//!
//! The store is a YAML file mapping cloud names to their dumped state, plus
//! the name of the current cloud.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::cloud::Cloud;
use crate::error::InfraError;
use crate::sync::LockedFile;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudStore {
    #[serde(default)]
    pub clouds: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cloud: Option<String>,
}

/// `~/.fx/clouds.yaml`.
pub fn default_path() -> Result<PathBuf, InfraError> {
    let home = dirs::home_dir()
        .ok_or_else(|| InfraError::Config("could not determine the home directory".to_string()))?;
    Ok(home.join(".fx").join("clouds.yaml"))
}

impl CloudStore {
    /// Reads the store behind `locked`. A missing file is an empty store.
    pub fn read(locked: &LockedFile) -> Result<Self, InfraError> {
        match locked.read_handle()? {
            Some(file) => {
                let store: Option<Self> = serde_yaml::from_reader(file)?;
                Ok(store.unwrap_or_default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn write(&self, locked: &LockedFile) -> Result<(), InfraError> {
        serde_yaml::to_writer(locked.write_handle()?, self)?;
        Ok(())
    }

    /// Locks, reads, and unlocks the store at `path`.
    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let locked = LockedFile::acquire(path).await?;
        Self::read(&locked)
    }

    /// Stores `cloud` under `name` and makes it the current cloud.
    pub fn add_cloud(&mut self, name: &str, cloud: &Cloud) -> Result<(), InfraError> {
        self.clouds.insert(name.to_string(), cloud.to_value()?);
        self.current_cloud = Some(name.to_string());
        Ok(())
    }

    /// Fails if a cloud called `name` is already stored.
    pub fn check_unused(&self, name: &str) -> Result<(), InfraError> {
        if self.clouds.contains_key(name) {
            return Err(InfraError::Config(format!(
                "a cloud named '{}' already exists, delete it or pick another name",
                name
            )));
        }
        Ok(())
    }

    pub fn use_cloud(&mut self, name: &str) -> Result<(), InfraError> {
        if !self.clouds.contains_key(name) {
            return Err(InfraError::Config(format!("no cloud named '{}'", name)));
        }
        self.current_cloud = Some(name.to_string());
        Ok(())
    }

    /// Resolves `name`, defaulting to the current cloud.
    pub fn resolve<'s>(&'s self, name: Option<&'s str>) -> Result<(&'s str, &'s Value), InfraError> {
        let name = name
            .or(self.current_cloud.as_deref())
            .ok_or_else(|| InfraError::Config("no current cloud selected".to_string()))?;
        let state = self
            .clouds
            .get(name)
            .ok_or_else(|| InfraError::Config(format!("no cloud named '{}'", name)))?;
        Ok((name, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cloud::CloudType;

    #[tokio::test]
    async fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CloudStore::load(&dir.path().join("clouds.yaml")).await.unwrap();
        assert_eq!(store, CloudStore::default());
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clouds.yaml");

        {
            let locked = LockedFile::acquire(&path).await.unwrap();
            let mut store = CloudStore::read(&locked).unwrap();
            let cloud = Cloud::new(CloudType::K8s, vec![]).unwrap();
            store.add_cloud("prod", &cloud).unwrap();
            store.write(&locked).unwrap();
        }

        let store = CloudStore::load(&path).await.unwrap();
        assert_eq!(store.current_cloud.as_deref(), Some("prod"));
        let (name, state) = store.resolve(None).unwrap();
        assert_eq!(name, "prod");
        let cloud = Cloud::load(state).unwrap();
        assert_eq!(cloud.kind(), Some(CloudType::K8s));
    }

    #[test]
    fn test_existing_cloud_name_is_taken() {
        let mut store = CloudStore::default();
        assert!(store.check_unused("prod").is_ok());

        let cloud = Cloud::new(CloudType::Docker, vec![]).unwrap();
        store.add_cloud("prod", &cloud).unwrap();
        assert!(matches!(
            store.check_unused("prod"),
            Err(InfraError::Config(_))
        ));
        assert!(store.check_unused("staging").is_ok());
    }

    #[test]
    fn test_use_unknown_cloud() {
        let mut store = CloudStore::default();
        assert!(store.use_cloud("nope").is_err());
        assert!(store.resolve(None).is_err());
    }
}
