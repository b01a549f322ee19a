//! Kubernetes-backed object store

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, Preconditions,
    WatchEvent, WatchParams,
};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use syncagent_common::kube_utils::{ensure_namespace, is_conflict, is_not_found};
use syncagent_common::{Error, Result, FIELD_MANAGER};
use tracing::debug;

use super::{EventStream, ObjectList, ObjectStore, StoreEvent};
use crate::identity::ObjectName;
use crate::resource::ResourceType;

/// Watch timeout (seconds) - must be less than client read_timeout (30s)
///
/// Forces the API server to close idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// [`ObjectStore`] over `Api<DynamicObject>` for a discovered resource type
pub struct KubeStore {
    client: Client,
    resource: ResourceType,
    api_resource: ApiResource,
    label_selector: Option<String>,
    description: String,
    namespace_labels: BTreeMap<String, String>,
}

impl KubeStore {
    /// Create a store for `resource` in the cluster behind `client`
    pub fn new(client: Client, resource: ResourceType, description: impl Into<String>) -> Self {
        let api_resource = resource.api_resource();
        Self {
            client,
            resource,
            api_resource,
            label_selector: None,
            description: description.into(),
            namespace_labels: BTreeMap::new(),
        }
    }

    /// Restrict list and watch to objects matching a label selector
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Labels put on namespaces created by [`ObjectStore::ensure_namespace`]
    pub fn with_namespace_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.namespace_labels = labels;
        self
    }

    fn all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.api_resource)
    }

    fn scoped(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.resource.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &self.api_resource)
            }
            _ => self.all(),
        }
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }

    fn watch_params(&self) -> WatchParams {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        match &self.label_selector {
            Some(selector) => params.labels(selector),
            None => params,
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Map a write error, turning 409 into a version conflict on `object`
fn write_error(err: kube::Error, object: &str) -> Error {
    if is_conflict(&err) {
        Error::conflict(object, err.to_string())
    } else {
        err.into()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn list(&self) -> Result<ObjectList> {
        let list = self.all().list(&self.list_params()).await?;
        Ok(ObjectList {
            items: list.items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream> {
        let stream = self
            .all()
            .watch(&self.watch_params(), resource_version)
            .await?;
        Ok(stream
            .map_err(Error::from)
            .and_then(|event| async move {
                match event {
                    WatchEvent::Added(obj) => Ok(StoreEvent::Added(obj)),
                    WatchEvent::Modified(obj) => Ok(StoreEvent::Modified(obj)),
                    WatchEvent::Deleted(obj) => Ok(StoreEvent::Deleted(obj)),
                    WatchEvent::Bookmark(bookmark) => Ok(StoreEvent::Bookmark(
                        bookmark.metadata.resource_version,
                    )),
                    // 410 Gone and friends: the caller relists
                    WatchEvent::Error(status) => Err(Error::from(kube::Error::Api(status))),
                }
            })
            .boxed())
    }

    async fn get(&self, name: &ObjectName) -> Result<Option<DynamicObject>> {
        Ok(self
            .scoped(name.namespace.as_deref())
            .get_opt(&name.name)
            .await?)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = ObjectName::of(obj);
        self.scoped(name.namespace.as_deref())
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| write_error(e, &name.to_string()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = ObjectName::of(obj);
        self.scoped(name.namespace.as_deref())
            .replace(&name.name, &Self::post_params(), obj)
            .await
            .map_err(|e| write_error(e, &name.to_string()))
    }

    async fn patch_status(
        &self,
        name: &ObjectName,
        resource_version: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let body = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": patch,
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.scoped(name.namespace.as_deref())
            .patch_status(&name.name, &params, &Patch::Merge(&body))
            .await
            .map_err(|e| write_error(e, &name.to_string()))
    }

    async fn delete(&self, name: &ObjectName, resource_version: Option<String>) -> Result<()> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        match self
            .scoped(name.namespace.as_deref())
            .delete(&name.name, &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(object = %name, "already deleted");
                Ok(())
            }
            Err(e) => Err(write_error(e, &name.to_string())),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if !self.resource.namespaced {
            return Ok(());
        }
        ensure_namespace(&self.client, namespace, self.namespace_labels.clone()).await
    }
}
