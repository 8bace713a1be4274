use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::repository::Repository;
use crate::{Error, Result};

/// Ranks `services` into deploy layers given `(service, depends_on)` edges.
///
/// Edges with an endpoint outside `services` are ignored. Every service
/// lands in exactly one layer, after all of its in-scope dependencies.
/// Layer members keep their input order.
pub fn deploy_layers(services: &[Uuid], edges: &[(Uuid, Uuid)]) -> Result<Vec<Vec<Uuid>>> {
    let mut seen = HashSet::new();
    let mut remaining: Vec<Uuid> = services
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();

    let mut in_degree: HashMap<Uuid, usize> = remaining.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (service, depends_on) in edges {
        if !in_degree.contains_key(depends_on) {
            continue;
        }
        if let Some(degree) = in_degree.get_mut(service) {
            *degree += 1;
            dependents.entry(*depends_on).or_default().push(*service);
        }
    }

    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let (layer, rest): (Vec<Uuid>, Vec<Uuid>) = remaining
            .into_iter()
            .partition(|id| in_degree.get(id).copied().unwrap_or(0) == 0);
        if layer.is_empty() {
            return Err(Error::CircularDependency { services: rest });
        }
        for id in &layer {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        layers.push(layer);
        remaining = rest;
    }
    Ok(layers)
}

/// Loads the dependency edges of `services` and ranks them into layers
pub async fn dependency_layers(
    repo: &dyn Repository,
    services: &[Uuid],
) -> Result<Vec<Vec<Uuid>>> {
    let mut edges = Vec::new();
    for service in services {
        match repo.get_dependencies(*service).await {
            Ok(deps) => edges.extend(
                deps.into_iter()
                    .map(|dep| (dep.service_id, dep.depends_on_service_id)),
            ),
            Err(err) => {
                warn!(service_id = %service, error = %err, "Failed to get dependencies for service")
            }
        }
    }
    let layers = deploy_layers(services, &edges)?;
    debug!(
        total_services = services.len(),
        layers = layers.len(),
        "Computed deployment order"
    );
    Ok(layers)
}
