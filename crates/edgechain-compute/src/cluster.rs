//! Container cluster.

use edgechain_network::Fabric;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub fabric: String,
}

/// A cluster is a named scope inside a fabric; it owns no capacity of its
/// own (tasks run on serverless capacity).
pub fn create_cluster(fabric: &Fabric, name: &str) -> Cluster {
    let cluster = Cluster {
        id: format!("cluster-{}-{name}", &fabric.id[4..]),
        name: name.to_string(),
        fabric: fabric.id.clone(),
    };
    info!(cluster = %cluster.id, "cluster created");
    cluster
}
