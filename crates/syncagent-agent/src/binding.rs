//! APIExport resolution
//!
//! The agent synchronizes every resource type the APIExport publishes. The
//! export lists `APIResourceSchema` names of the form
//! `<prefix>.<resource>.<group>`; each is resolved to a concrete
//! [`ResourceType`] through discovery in an upstream workspace.

use kube::api::{Api, DynamicObject};
use kube::discovery::{ApiResource, Discovery};
use kube::Client;
use syncagent_common::kube_utils::is_not_found;
use syncagent_common::{Error, Result};
use syncagent_sync::ResourceType;
use tracing::{debug, info};

const APIEXPORT_GROUP: &str = "apis.kcp.io";
const APIEXPORT_VERSION: &str = "v1alpha1";

/// Group name kcp uses in schema names for the core API group
const CORE_GROUP_ALIAS: &str = "core";

/// A resource named by an APIResourceSchema
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaRef {
    /// Full schema name
    pub schema: String,
    /// Plural resource name
    pub resource: String,
    /// API group ("" for core)
    pub group: String,
}

/// Split `<prefix>.<resource>.<group>`
///
/// The group may itself contain dots; `core` stands for the core group.
pub fn parse_schema_name(name: &str) -> Result<SchemaRef> {
    let mut parts = name.splitn(3, '.');
    let (prefix, resource, group) = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(r), Some(g)) if !p.is_empty() && !r.is_empty() && !g.is_empty() => {
            (p, r, g)
        }
        _ => {
            return Err(Error::config(format!(
                "invalid APIResourceSchema name {name:?}: expected <prefix>.<resource>.<group>"
            )))
        }
    };
    debug!(schema = %name, prefix = %prefix, "parsed resource schema name");

    Ok(SchemaRef {
        schema: name.to_string(),
        resource: resource.to_string(),
        group: if group == CORE_GROUP_ALIAS {
            String::new()
        } else {
            group.to_string()
        },
    })
}

/// Schema references listed by an APIExport object
pub fn schemas_from_export(export: &DynamicObject) -> Result<Vec<SchemaRef>> {
    let name = export.metadata.name.as_deref().unwrap_or_default();
    let schemas = export
        .data
        .get("spec")
        .and_then(|spec| spec.get("latestResourceSchemas"))
        .and_then(|s| s.as_array())
        .ok_or_else(|| {
            Error::config(format!("APIExport {name} has no spec.latestResourceSchemas"))
        })?;

    let refs = schemas
        .iter()
        .map(|s| {
            s.as_str()
                .ok_or_else(|| {
                    Error::config(format!("APIExport {name} lists a non-string schema: {s}"))
                })
                .and_then(parse_schema_name)
        })
        .collect::<Result<Vec<_>>>()?;

    if refs.is_empty() {
        return Err(Error::config(format!(
            "APIExport {name} does not publish any resource schema"
        )));
    }
    Ok(refs)
}

fn apiexport_resource() -> ApiResource {
    ApiResource {
        group: APIEXPORT_GROUP.to_string(),
        version: APIEXPORT_VERSION.to_string(),
        api_version: format!("{APIEXPORT_GROUP}/{APIEXPORT_VERSION}"),
        kind: "APIExport".to_string(),
        plural: "apiexports".to_string(),
    }
}

/// Fetch the APIExport from the workspace `kcp` addresses
pub async fn fetch_export(kcp: &Client, name: &str) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::all_with(kcp.clone(), &apiexport_resource());
    match api.get(name).await {
        Ok(export) => Ok(export),
        Err(e) if is_not_found(&e) => Err(Error::config(format!("APIExport {name} not found"))),
        Err(e) => Err(Error::config(format!("failed to read APIExport {name}: {e}"))),
    }
}

/// Resolve a schema to the resource type served in the workspace behind `client`
pub async fn discover(client: &Client, schema: &SchemaRef) -> Result<ResourceType> {
    let discovery = Discovery::new(client.clone())
        .filter(&[schema.group.as_str()])
        .run()
        .await
        .map_err(|e| Error::config(format!("discovery for {} failed: {e}", schema.schema)))?;

    let resource = discovery
        .groups()
        .filter(|g| g.name() == schema.group)
        .flat_map(|g| g.recommended_resources())
        .find(|(ar, _)| ar.plural == schema.resource)
        .map(|(ar, caps)| ResourceType::from_discovery(&ar, &caps));
    resource.ok_or_else(|| {
        Error::config(format!(
            "resource {} from schema {} is not served upstream",
            schema.resource, schema.schema
        ))
    })
}

/// Resolve every resource type an APIExport publishes
pub async fn resolve(
    kcp: &Client,
    upstream: &Client,
    export_name: &str,
) -> Result<Vec<ResourceType>> {
    let export = fetch_export(kcp, export_name).await?;
    let schemas = schemas_from_export(&export)?;

    let mut resources = Vec::with_capacity(schemas.len());
    for schema in &schemas {
        let resource = discover(upstream, schema).await?;
        info!(
            apiexport = %export_name,
            schema = %schema.schema,
            resource = %resource,
            namespaced = resource.namespaced,
            status = resource.has_status,
            "Resolved resource binding"
        );
        resources.push(resource);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn export(spec: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new("things.dummy", &apiexport_resource());
        obj.data = json!({ "spec": spec });
        obj
    }

    mod schema_names {
        use super::*;

        #[test]
        fn group_keeps_its_dots() {
            let s = parse_schema_name("v240101-7d8f.things.dummy.kcp.io").unwrap();
            assert_eq!(s.resource, "things");
            assert_eq!(s.group, "dummy.kcp.io");
        }

        #[test]
        fn core_alias_maps_to_empty_group() {
            let s = parse_schema_name("today.configmaps.core").unwrap();
            assert_eq!(s.resource, "configmaps");
            assert_eq!(s.group, "");
        }

        #[test]
        fn malformed_names_are_config_errors() {
            for bad in ["things", "v1.things", ".things.dummy", "v1..dummy", "v1.things."] {
                let err = parse_schema_name(bad).unwrap_err();
                assert!(matches!(err, Error::Config { .. }), "{bad:?} accepted");
            }
        }
    }

    mod exports {
        use super::*;

        #[test]
        fn latest_schemas_are_listed_in_order() {
            let obj = export(json!({
                "latestResourceSchemas": [
                    "v1.things.dummy.kcp.io",
                    "v1.secrets.core",
                ]
            }));
            let refs = schemas_from_export(&obj).unwrap();
            assert_eq!(refs.len(), 2);
            assert_eq!(refs[0].group, "dummy.kcp.io");
            assert_eq!(refs[1].resource, "secrets");
        }

        #[test]
        fn export_without_schemas_is_rejected() {
            assert!(schemas_from_export(&export(json!({}))).is_err());
            assert!(schemas_from_export(&export(json!({ "latestResourceSchemas": [] }))).is_err());
            assert!(
                schemas_from_export(&export(json!({ "latestResourceSchemas": [42] }))).is_err()
            );
        }
    }
}
