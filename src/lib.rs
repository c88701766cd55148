//! Shardkeeper - topology reconciliation for sharded Redis clusters on Kubernetes.
//!
//! Given a `RedisCluster` resource, the engine drives leader and follower
//! StatefulSets, their services and storage claims, and the cluster's own
//! membership (slot assignment, joins, failovers, resharding) towards the
//! declared shape.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  topology: one reconciliation pass per RedisCluster          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  workload | scaling | health | labels | status | finalizer  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  node: node table parsing, commands, RESP and exec channels │
//! ├─────────────────────────────────────────────────────────────┤
//! │  platform: Kubernetes API behind narrow traits              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use shardkeeper::config::OperatorConfig;
//! use shardkeeper::node::{ExecTransport, RespTransport, RoutingTransport};
//! use shardkeeper::platform::kubernetes::KubePlatform;
//! use shardkeeper::platform::Platform;
//! use shardkeeper::topology::TopologyController;
//!
//! # async fn example(cluster: shardkeeper::crd::RedisCluster) -> shardkeeper::Result<()> {
//! let config = OperatorConfig::default();
//! let client = kube::Client::try_default().await?;
//! let platform: Arc<dyn Platform> = Arc::new(KubePlatform::new(client, config.field_manager.clone()));
//! let transport = Arc::new(RoutingTransport::new(
//!     Arc::new(RespTransport::new()),
//!     Arc::new(ExecTransport::new(platform.clone(), config.admin_binary.clone())),
//! ));
//!
//! let controller = TopologyController::new(platform, transport, config);
//! let next = controller.reconcile(&cluster).await?;
//! # let _ = next;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod health;
pub mod labels;
pub mod naming;
pub mod node;
pub mod platform;
pub mod retry;
pub mod scaling;
pub mod status;
pub mod topology;
pub mod workload;

// Re-exports
pub use error::{Error, Result};
pub use topology::{Next, TopologyController};
