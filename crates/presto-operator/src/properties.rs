//! Rendering of the files Presto reads at start-up.
//!
//! Everything here is pure: a spec and the cluster names go in, file
//! contents come out. Property maps are ordered so the rendered text is
//! stable across reconciliations.

use crate::crd::{CatalogList, NodeSpec, PrestoSpec};
use crate::error::{OperatorError, Result};
use crate::naming::ClusterNames;
use crate::quantity::parse_bytes;
use std::collections::BTreeMap;

pub const NODE_PROPERTIES_KEY: &str = "node.properties";
pub const CONFIG_PROPERTIES_KEY: &str = "config.properties";
pub const JVM_CONFIG_KEY: &str = "jvm.config";
pub const SHUTDOWN_SCRIPT_KEY: &str = "presto_shutdown.sh";

/// Port Presto listens on unless told otherwise
pub const PRESTO_PORT: i32 = 8080;

/// Where the HTTPS key pair secret is mounted on the coordinator
pub const HTTPS_SECRET_PATH: &str = "/etc/httpssecret";

pub const CATALOG_FILE_SUFFIX: &str = ".properties";

/// Catalogs every cluster gets unless the user claims the name
pub const DEFAULT_CATALOGS: [&str; 3] = ["jmx", "tpch", "tpcds"];

const NODE_PROPERTIES: &str = "node.environment=prestoproduction\nnode.data-dir=/data/presto\n";

const BASE_JVM_FLAGS: [&str; 11] = [
    "-server",
    "-XX:-UseBiasedLocking",
    "-XX:+UseG1GC",
    "-XX:G1HeapRegionSize=32M",
    "-XX:+ExplicitGCInvokesConcurrent",
    "-XX:+ExitOnOutOfMemoryError",
    "-XX:+UseGCOverheadLimit",
    "-XX:+HeapDumpOnOutOfMemoryError",
    "-XX:ReservedCodeCacheSize=512M",
    "-Djdk.attach.allowAttachSelf=true",
    "-Djdk.nio.maxCachedBufferSize=2000000",
];

/// Worker preStop hook. Asks the local server to enter SHUTTING_DOWN and
/// blocks until it has drained; the coordinator cannot shut down gracefully.
const SHUTDOWN_SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
# Graceful shutdown for Presto workers, run as a preStop hook.
set -x
http_port="$(grep 'http-server.http.port' {MOUNT_PATH}/config.properties | sed 's/^.*=\(.*\)$/\1/')"
https_port="$(grep 'http-server.https.port' {MOUNT_PATH}/config.properties | sed 's/^.*=\(.*\)$/\1/')"

if [ -n "$http_port" ]; then
    res=$(curl -s -o /dev/null -w "%{http_code}" -XPUT --data '"SHUTTING_DOWN"' -H "Content-type: application/json" http://localhost:${http_port}/v1/info/state)
fi

if [ -z "$res" -o "$res" != "200" ] && [ -n "$https_port" ]; then
    res=$(curl -k -s -o /dev/null -w "%{http_code}" -XPUT --data '"SHUTTING_DOWN"' -H "Content-type: application/json" https://localhost:${https_port}/v1/info/state)
fi

if [ -z "$res" -o "$res" != "200" ]; then
    exit 1
fi

while curl -s http://localhost:${http_port}/v1/info/state; do
    sleep 3
done
"#;

/// Plain and TLS ports of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorPorts {
    pub http: i32,
    pub https: Option<i32>,
}

impl CoordinatorPorts {
    /// With TLS the exposed port serves HTTPS and plain HTTP moves aside:
    /// to 8081 when the exposed port is 8080, to 8080 otherwise.
    pub fn for_spec(spec: &PrestoSpec) -> Self {
        let exposed = spec.service.port.unwrap_or(PRESTO_PORT);
        if spec.coordinator.https_enabled {
            let http = if exposed == PRESTO_PORT {
                PRESTO_PORT + 1
            } else {
                PRESTO_PORT
            };
            Self {
                http,
                https: Some(exposed),
            }
        } else {
            Self {
                http: exposed,
                https: None,
            }
        }
    }
}

/// Keystore settings for a TLS-enabled coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsKeyPair<'a> {
    pub secret_name: &'a str,
    pub secret_key: &'a str,
    pub password: &'a str,
}

impl<'a> HttpsKeyPair<'a> {
    /// `None` when TLS is off; an error when it is on but incomplete
    pub fn from_spec(spec: &'a PrestoSpec) -> Result<Option<Self>> {
        let coordinator = &spec.coordinator;
        if !coordinator.https_enabled {
            return Ok(None);
        }
        let required = |value: &'a Option<String>, field: &str| {
            value.as_deref().filter(|v| !v.is_empty()).ok_or_else(|| {
                OperatorError::InvalidConfig(format!("{} is required when httpsEnabled is true", field))
            })
        };
        Ok(Some(Self {
            password: required(&coordinator.https_key_pair_password, "httpsKeyPairPassword")?,
            secret_key: required(&coordinator.https_key_pair_secret_key, "httpsKeyPairSecretKey")?,
            secret_name: required(
                &coordinator.https_key_pair_secret_name,
                "httpsKeyPairSecretName",
            )?,
        }))
    }
}

/// `jvm.config`: baseline flags, the heap size, then the user's extra text
pub fn render_jvm_config(node: &NodeSpec) -> Result<String> {
    let heap_mb = parse_bytes(&node.memory_limit)? / 1024 / 1024;
    let mut out = String::new();
    for flag in BASE_JVM_FLAGS {
        out.push_str(flag);
        out.push('\n');
    }
    out.push_str(&format!("-Xmx{}m\n", heap_mb));
    if let Some(extra) = node.additional_jvm_config.as_deref() {
        out.push_str(extra);
        out.push('\n');
    }
    Ok(out)
}

/// System properties of the coordinator
pub fn coordinator_system_properties(
    spec: &PrestoSpec,
    names: &ClusterNames,
) -> Result<BTreeMap<String, String>> {
    let ports = CoordinatorPorts::for_spec(spec);
    let internal = names.coordinator_internal_address();

    let mut props = BTreeMap::new();
    props.insert("coordinator".to_string(), "true".to_string());
    props.insert("http-server.http.port".to_string(), ports.http.to_string());
    props.insert("node.internal-address".to_string(), internal.clone());
    props.insert(
        "discovery.uri".to_string(),
        format!("http://{}:{}", internal, ports.http),
    );
    props.insert(
        "node-scheduler.include-coordinator".to_string(),
        "false".to_string(),
    );
    props.insert("discovery-server.enabled".to_string(), "true".to_string());

    match (HttpsKeyPair::from_spec(spec)?, ports.https) {
        (Some(key_pair), Some(https_port)) => {
            props.insert("http-server.http.enabled".to_string(), "true".to_string());
            props.insert("http-server.https.enabled".to_string(), "true".to_string());
            props.insert("http-server.https.port".to_string(), https_port.to_string());
            props.insert(
                "http-server.https.keystore.path".to_string(),
                format!("{}/{}", HTTPS_SECRET_PATH, key_pair.secret_key),
            );
            props.insert(
                "http-server.https.keystore.key".to_string(),
                key_pair.password.to_string(),
            );
        }
        _ => {
            props.insert("http-server.https.enabled".to_string(), "false".to_string());
        }
    }
    Ok(props)
}

/// System properties of a worker
pub fn worker_system_properties(spec: &PrestoSpec, names: &ClusterNames) -> BTreeMap<String, String> {
    let ports = CoordinatorPorts::for_spec(spec);
    let mut props = BTreeMap::new();
    props.insert("coordinator".to_string(), "false".to_string());
    props.insert("http-server.http.port".to_string(), PRESTO_PORT.to_string());
    props.insert(
        "discovery.uri".to_string(),
        format!("http://{}:{}", names.coordinator_internal_address(), ports.http),
    );
    props
}

/// `config.properties`: system properties plus the user's extras, which
/// may not redefine a system property
pub fn render_config_properties(
    system: BTreeMap<String, String>,
    additional: &BTreeMap<String, String>,
) -> Result<String> {
    let mut props = system;
    for (key, value) in additional {
        if props.contains_key(key) {
            return Err(OperatorError::InvalidConfig(format!(
                "property {} is managed by the operator and cannot be overridden",
                key
            )));
        }
        props.insert(key.clone(), value.clone());
    }
    Ok(render_properties(&props))
}

/// The shutdown script with the configuration directory filled in
pub fn render_shutdown_script(presto_path: &str) -> String {
    SHUTDOWN_SCRIPT_TEMPLATE.replace("{MOUNT_PATH}", presto_path.trim_end_matches('/'))
}

/// Render `key=value` lines
pub fn render_properties(props: &BTreeMap<String, String>) -> String {
    props
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

/// The whole configuration bundle for the coordinator
pub fn coordinator_bundle(spec: &PrestoSpec, names: &ClusterNames) -> Result<BTreeMap<String, String>> {
    let system = coordinator_system_properties(spec, names)?;
    bundle(spec, &spec.coordinator.node, system)
}

/// The whole configuration bundle for the workers
pub fn worker_bundle(spec: &PrestoSpec, names: &ClusterNames) -> Result<BTreeMap<String, String>> {
    let system = worker_system_properties(spec, names);
    bundle(spec, &spec.worker.node, system)
}

fn bundle(
    spec: &PrestoSpec,
    node: &NodeSpec,
    system: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    files.insert(NODE_PROPERTIES_KEY.to_string(), NODE_PROPERTIES.to_string());
    files.insert(
        CONFIG_PROPERTIES_KEY.to_string(),
        render_config_properties(system, &node.additional_props)?,
    );
    files.insert(JVM_CONFIG_KEY.to_string(), render_jvm_config(node)?);
    files.insert(
        SHUTDOWN_SCRIPT_KEY.to_string(),
        render_shutdown_script(spec.presto_path()),
    );
    // user-supplied files win on name collisions
    files.extend(
        spec.additional_presto_prop_files
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    Ok(files)
}

/// One `<name>.properties` file per inline catalog plus the default
/// catalogs nobody claimed. Catalog secrets claim the name of their key.
pub fn catalog_bundle(catalogs: &CatalogList) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for catalog in &catalogs.catalog_spec {
        files.insert(
            format!("{}{}", catalog.name, CATALOG_FILE_SUFFIX),
            render_properties(&catalog.content),
        );
    }

    for default in DEFAULT_CATALOGS {
        let claimed = catalogs.catalog_spec.iter().any(|c| c.name == default)
            || catalogs.catalog_secrets.iter().any(|s| s.secret_key == default);
        if !claimed {
            files.insert(
                format!("{}{}", default, CATALOG_FILE_SUFFIX),
                format!("connector.name={}\n", default),
            );
        }
    }
    files
}
