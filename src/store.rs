//! Per-cluster in-memory object store
//!
//! Each simulated cluster gets an isolated "resource group": a namespaced
//! collection of typed objects with the usual get/create/update/delete/list
//! verbs and not-found / already-exists signaling. Objects are stored as
//! JSON documents keyed by kind, namespace and name, so any `k8s-openapi`
//! type round-trips through the store.
//!
//! The store keeps a monotonically increasing revision that bumps on every
//! mutation. Writers that derive state from a scan (etcd membership
//! assignment) list with the revision and create conditionally on it, so a
//! concurrent mutation surfaces as a [`StoreError::Conflict`] instead of a
//! silently duplicated member or a second leader.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{Metadata, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the per-cluster store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist
    #[error("{kind} {key} not found")]
    NotFound {
        /// Kind of the missing object
        kind: &'static str,
        /// Namespace-qualified name of the missing object
        key: String,
    },

    /// An object with the same kind, namespace and name already exists
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Kind of the conflicting object
        kind: &'static str,
        /// Namespace-qualified name of the conflicting object
        key: String,
    },

    /// The store was mutated after the revision the write was conditioned on
    #[error("{kind} {key} rejected: store revision moved past {expected}")]
    Conflict {
        /// Kind of the object being written
        kind: &'static str,
        /// Namespace-qualified name of the object being written
        key: String,
        /// Revision the write was conditioned on
        expected: u64,
    },

    /// The object carries no name in its metadata
    #[error("cannot store {kind} without a name")]
    MissingName {
        /// Kind of the unnamed object
        kind: &'static str,
    },

    /// The object could not be encoded for storage
    #[error("failed to encode {kind}: {source}")]
    Encode {
        /// Kind of the object
        kind: &'static str,
        /// Underlying serialization error
        #[source]
        source: serde_json::Error,
    },

    /// A stored document could not be decoded into the requested type
    #[error("failed to decode {kind} {key}: {source}")]
    Decode {
        /// Kind of the object
        kind: &'static str,
        /// Namespace-qualified name of the object
        key: String,
        /// Underlying deserialization error
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Whether this error is a not-found signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Whether this error is an already-exists signal
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// Whether this error is a conditional-write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: &'static str,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn display(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Default)]
struct Shelf {
    revision: u64,
    objects: BTreeMap<ObjectKey, serde_json::Value>,
}

/// An isolated collection of simulated objects backing one cluster
#[derive(Debug, Default)]
pub struct ResourceGroup {
    inner: RwLock<Shelf>,
}

impl ResourceGroup {
    fn write(&self) -> RwLockWriteGuard<'_, Shelf> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_for<T: Resource>(meta: &ObjectMeta) -> Result<ObjectKey, StoreError> {
        let name = meta
            .name
            .clone()
            .ok_or(StoreError::MissingName { kind: T::KIND })?;
        Ok(ObjectKey {
            kind: T::KIND,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name,
        })
    }

    fn lookup_key<T: Resource>(namespace: &str, name: &str) -> ObjectKey {
        ObjectKey {
            kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Current revision of the group; bumps on every mutation
    pub fn revision(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision
    }

    /// Number of objects in the group, across all kinds
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .objects
            .len()
    }

    /// Whether the group holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the object with the given namespace and name
    pub fn get<T>(&self, namespace: &str, name: &str) -> Result<T, StoreError>
    where
        T: Resource + DeserializeOwned,
    {
        let key = Self::lookup_key::<T>(namespace, name);
        let shelf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let value = shelf.objects.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            key: key.display(),
        })?;
        serde_json::from_value(value.clone()).map_err(|source| StoreError::Decode {
            kind: T::KIND,
            key: key.display(),
            source,
        })
    }

    /// Create the object, failing if it already exists
    pub fn create<T>(&self, obj: &T) -> Result<(), StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + Serialize,
    {
        self.insert(obj, None)
    }

    /// Create the object only if the group revision still matches `expected`
    ///
    /// Used by writers whose content was derived from a scan of the group:
    /// a revision moved by a concurrent writer fails the create with
    /// [`StoreError::Conflict`] so the whole invocation can be retried.
    pub fn create_if_revision<T>(&self, obj: &T, expected: u64) -> Result<(), StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + Serialize,
    {
        self.insert(obj, Some(expected))
    }

    fn insert<T>(&self, obj: &T, expected: Option<u64>) -> Result<(), StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + Serialize,
    {
        let key = Self::key_for::<T>(obj.metadata())?;
        let value = serde_json::to_value(obj).map_err(|source| StoreError::Encode {
            kind: T::KIND,
            source,
        })?;

        let mut shelf = self.write();
        if let Some(expected) = expected {
            if shelf.revision != expected {
                return Err(StoreError::Conflict {
                    kind: T::KIND,
                    key: key.display(),
                    expected,
                });
            }
        }
        if shelf.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: key.display(),
            });
        }
        shelf.revision += 1;
        shelf.objects.insert(key, value);
        Ok(())
    }

    /// Replace an existing object, failing if it does not exist
    pub fn update<T>(&self, obj: &T) -> Result<(), StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + Serialize,
    {
        let key = Self::key_for::<T>(obj.metadata())?;
        let value = serde_json::to_value(obj).map_err(|source| StoreError::Encode {
            kind: T::KIND,
            source,
        })?;

        let mut shelf = self.write();
        if !shelf.objects.contains_key(&key) {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.display(),
            });
        }
        shelf.revision += 1;
        shelf.objects.insert(key, value);
        Ok(())
    }

    /// Delete the object with the given namespace and name
    pub fn delete<T>(&self, namespace: &str, name: &str) -> Result<(), StoreError>
    where
        T: Resource,
    {
        let key = Self::lookup_key::<T>(namespace, name);
        let mut shelf = self.write();
        if shelf.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.display(),
            });
        }
        shelf.revision += 1;
        Ok(())
    }

    /// List objects of one kind in a namespace, filtered by a label selector
    ///
    /// Every `(key, value)` pair in the selector must match the object's
    /// labels; an empty selector matches everything.
    pub fn list<T>(&self, namespace: &str, selector: &[(&str, &str)]) -> Result<Vec<T>, StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + DeserializeOwned,
    {
        self.list_with_revision(namespace, selector).map(|(items, _)| items)
    }

    /// Like [`ResourceGroup::list`], also returning the group revision the
    /// listing was taken at, for use with
    /// [`ResourceGroup::create_if_revision`]
    pub fn list_with_revision<T>(
        &self,
        namespace: &str,
        selector: &[(&str, &str)],
    ) -> Result<(Vec<T>, u64), StoreError>
    where
        T: Resource + Metadata<Ty = ObjectMeta> + DeserializeOwned,
    {
        let shelf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut items = Vec::new();
        for (key, value) in &shelf.objects {
            if key.kind != T::KIND || key.namespace != namespace {
                continue;
            }
            let obj: T =
                serde_json::from_value(value.clone()).map_err(|source| StoreError::Decode {
                    kind: T::KIND,
                    key: key.display(),
                    source,
                })?;
            if matches_selector(obj.metadata(), selector) {
                items.push(obj);
            }
        }
        Ok((items, shelf.revision))
    }
}

fn matches_selector(meta: &ObjectMeta, selector: &[(&str, &str)]) -> bool {
    selector.iter().all(|(k, v)| {
        meta.labels
            .as_ref()
            .and_then(|labels| labels.get(*k))
            .map(|value| value == v)
            == Some(true)
    })
}

/// Registry mapping resource-group names to store instances
///
/// One group backs all machines of one simulated cluster; groups are
/// created on first access and dropped explicitly when the cluster goes
/// away.
#[derive(Debug, Default)]
pub struct ResourceGroupRegistry {
    groups: DashMap<String, Arc<ResourceGroup>>,
}

impl ResourceGroupRegistry {
    /// Get the group with the given name, creating it if absent
    pub fn get_or_create(&self, name: &str) -> Arc<ResourceGroup> {
        self.groups
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Get the group with the given name, if present
    pub fn get(&self, name: &str) -> Option<Arc<ResourceGroup>> {
        self.groups.get(name).map(|g| g.clone())
    }

    /// Drop the group with the given name and all its objects
    pub fn remove(&self, name: &str) {
        self.groups.remove(name);
    }
}
