//! Rendering of the per-role StatefulSet and services.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec, TCPSocketAction,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::OperatorConfig;
use crate::crd::{RedisCluster, ResourceConfig};
use crate::naming::{additional_service_name, headless_service_name, workload_name, Role};

/// Name of the nodes.conf claim template.
pub const NODE_CONF_TEMPLATE: &str = "node-conf";

const NODE_CONF_MOUNT: &str = "/node-conf";
const DATA_MOUNT: &str = "/data";
const EXTERNAL_CONFIG_MOUNT: &str = "/etc/redis/external.conf.d";

/// Offset of the cluster bus port from the client port.
const BUS_PORT_OFFSET: i32 = 10000;

/// Labels carried by a role's StatefulSet, pods and services.
pub fn workload_labels(cluster: &str, role: Role) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), workload_name(cluster, role)),
        ("redis_setup_type".to_string(), "cluster".to_string()),
        ("role".to_string(), role.as_str().to_string()),
        ("app.kubernetes.io/component".to_string(), "redis".to_string()),
    ])
}

/// Name of the data claim template: the configured override, else the
/// workload name.
pub fn data_template_name(cluster: &str, role: Role, config: &OperatorConfig) -> String {
    config
        .pvc_template_name
        .clone()
        .unwrap_or_else(|| workload_name(cluster, role))
}

fn object_meta(cluster: &RedisCluster, name: String, role: Role) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(workload_labels(&cluster.name_any(), role)),
        owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

fn quantities(pairs: [(&str, &Option<String>); 2]) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = pairs
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), Quantity(v.clone()))))
        .collect();
    (!map.is_empty()).then_some(map)
}

fn resources(config: &ResourceConfig) -> Option<ResourceRequirements> {
    let requests = quantities([("cpu", &config.cpu_request), ("memory", &config.memory_request)]);
    let limits = quantities([("cpu", &config.cpu_limit), ("memory", &config.memory_limit)]);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    })
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn claim_template(name: &str, size: &str, storage_class: Option<String>, access_modes: Vec<String>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Desired StatefulSet for one role.
pub fn statefulset(cluster: &RedisCluster, role: Role, config: &OperatorConfig) -> StatefulSet {
    let spec = &cluster.spec;
    let name = cluster.name_any();
    let sts_name = workload_name(&name, role);
    let labels = workload_labels(&name, role);
    let role_config = spec.role_config(role);

    let mut envs = vec![
        env("SERVER_MODE", "cluster"),
        env("SETUP_MODE", "cluster"),
        env("REDIS_PORT", spec.port.to_string()),
        env("REDIS_MAJOR_VERSION", spec.cluster_version.clone()),
        env(
            "PERSISTENCE_ENABLED",
            spec.persistence_enabled.unwrap_or(false).to_string(),
        ),
    ];
    if let Some(secret) = &spec.kubernetes_config.redis_secret {
        envs.push(EnvVar {
            name: "REDIS_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.name.clone().into(),
                    key: secret.key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut mounts = Vec::new();
    let mut volumes = Vec::new();
    let mut claim_templates = Vec::new();

    if let Some(storage) = &spec.storage {
        let template = data_template_name(&name, role, config);
        mounts.push(VolumeMount {
            name: template.clone(),
            mount_path: DATA_MOUNT.to_string(),
            ..Default::default()
        });
        claim_templates.push(claim_template(
            &template,
            &storage.size,
            storage.storage_class.clone(),
            storage.access_modes.clone(),
        ));
        if storage.node_conf_volume {
            mounts.push(VolumeMount {
                name: NODE_CONF_TEMPLATE.to_string(),
                mount_path: NODE_CONF_MOUNT.to_string(),
                ..Default::default()
            });
            claim_templates.push(claim_template(
                NODE_CONF_TEMPLATE,
                &storage.node_conf_size,
                storage.storage_class.clone(),
                storage.access_modes.clone(),
            ));
        }
    }

    if let Some(tls) = &spec.tls {
        let mount = config.tls_mount_path.trim_end_matches('/');
        envs.extend([
            env("TLS_MODE", "true"),
            env("REDIS_TLS_CA_KEY", format!("{mount}/{}", tls.ca)),
            env("REDIS_TLS_CERT", format!("{mount}/{}", tls.cert)),
            env("REDIS_TLS_CERT_KEY", format!("{mount}/{}", tls.key)),
        ]);
        mounts.push(VolumeMount {
            name: "tls-certs".to_string(),
            mount_path: config.tls_mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "tls-certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(config_map) = &role_config.additional_redis_config {
        mounts.push(VolumeMount {
            name: "external-config".to_string(),
            mount_path: EXTERNAL_CONFIG_MOUNT.to_string(),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "external-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.clone().into(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: sts_name.clone(),
        image: Some(spec.kubernetes_config.image.clone()),
        image_pull_policy: spec.kubernetes_config.image_pull_policy.clone(),
        env: Some(envs),
        ports: Some(vec![
            ContainerPort {
                name: Some("redis-client".to_string()),
                container_port: spec.port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("redis-bus".to_string()),
                container_port: spec.port + BUS_PORT_OFFSET,
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(spec.port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(1),
            period_seconds: Some(10),
            ..Default::default()
        }),
        resources: resources(&spec.kubernetes_config.resources),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    StatefulSet {
        metadata: object_meta(cluster, sts_name.clone(), role),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas(role)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: headless_service_name(&name, role).into(),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: (!role_config.node_selector.is_empty())
                        .then(|| role_config.node_selector.clone()),
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: (!claim_templates.is_empty()).then_some(claim_templates),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_ports(port: i32, include_bus: bool) -> Vec<ServicePort> {
    let mut ports = vec![ServicePort {
        name: Some("redis-client".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if include_bus {
        ports.push(ServicePort {
            name: Some("redis-bus".to_string()),
            port: port + BUS_PORT_OFFSET,
            target_port: Some(IntOrString::Int(port + BUS_PORT_OFFSET)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

/// Headless, client and additional services for one role.
pub fn services(cluster: &RedisCluster, role: Role) -> Vec<Service> {
    let spec = &cluster.spec;
    let name = cluster.name_any();
    let selector = workload_labels(&name, role);
    let annotations = (!spec.kubernetes_config.service.annotations.is_empty())
        .then(|| spec.kubernetes_config.service.annotations.clone());

    let service = |svc_name: String, spec: ServiceSpec| Service {
        metadata: ObjectMeta {
            annotations: annotations.clone(),
            ..object_meta(cluster, svc_name, role)
        },
        spec: Some(ServiceSpec {
            selector: Some(selector.clone()),
            ..spec
        }),
        ..Default::default()
    };

    vec![
        service(
            headless_service_name(&name, role),
            ServiceSpec {
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                ports: Some(service_ports(spec.port, true)),
                ..Default::default()
            },
        ),
        service(
            workload_name(&name, role),
            ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(service_ports(spec.port, false)),
                ..Default::default()
            },
        ),
        service(
            additional_service_name(&name, role),
            ServiceSpec {
                type_: Some(spec.kubernetes_config.service.service_type.clone()),
                ports: Some(service_ports(spec.port, false)),
                ..Default::default()
            },
        ),
    ]
}

/// The role's disruption budget, named like its workload. `None` when the
/// budget is disabled and any existing one should be removed.
pub fn disruption_budget(cluster: &RedisCluster, role: Role) -> Option<PodDisruptionBudget> {
    let config = cluster
        .spec
        .role_config(role)
        .pod_disruption_budget
        .as_ref()
        .filter(|c| c.enabled)?;
    let name = cluster.name_any();

    let mut spec = PodDisruptionBudgetSpec {
        selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("app".to_string(), workload_name(&name, role)),
                ("role".to_string(), role.as_str().to_string()),
            ])),
            ..Default::default()
        }),
        min_available: config.min_available.map(IntOrString::Int),
        max_unavailable: config.max_unavailable.map(IntOrString::Int),
        ..Default::default()
    };
    if spec.min_available.is_none() && spec.max_unavailable.is_none() {
        spec.min_available = Some(IntOrString::Int(cluster.spec.replicas(role) / 2 + 1));
    }

    Some(PodDisruptionBudget {
        metadata: object_meta(cluster, workload_name(&name, role), role),
        spec: Some(spec),
        ..Default::default()
    })
}
