use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::types::{RegionInfo, RegionPlan, ServerName};

/// Chooses destinations for regions.
///
/// `servers` is always the sorted list of online servers eligible as a
/// destination.
pub trait LoadBalancer: Send + Sync {
    /// Any destination for a single region, or `None` with no servers.
    fn random_assignment(&self, region: &RegionInfo, servers: &[ServerName]) -> Option<ServerName>;

    /// Spread regions evenly, catalog regions first.
    fn round_robin_assignment(
        &self,
        regions: &[RegionInfo],
        servers: &[ServerName],
    ) -> HashMap<ServerName, Vec<RegionInfo>>;

    /// Keep each region on the host and port it was last on when that host
    /// is still online, even if it restarted; place the rest randomly.
    fn retain_assignment(
        &self,
        regions: &HashMap<RegionInfo, Option<ServerName>>,
        servers: &[ServerName],
    ) -> HashMap<ServerName, Vec<RegionInfo>>;

    /// Moves that bring every server within one region of the mean with as
    /// few moves as possible. Catalog regions are never moved.
    fn balance_cluster(
        &self,
        assignments: &HashMap<ServerName, Vec<RegionInfo>>,
        servers: &[ServerName],
    ) -> Vec<RegionPlan>;
}

pub struct DefaultLoadBalancer;

impl LoadBalancer for DefaultLoadBalancer {
    fn random_assignment(&self, _region: &RegionInfo, servers: &[ServerName]) -> Option<ServerName> {
        servers.choose(&mut rand::thread_rng()).cloned()
    }

    fn round_robin_assignment(
        &self,
        regions: &[RegionInfo],
        servers: &[ServerName],
    ) -> HashMap<ServerName, Vec<RegionInfo>> {
        let mut plan: HashMap<ServerName, Vec<RegionInfo>> = HashMap::new();
        if servers.is_empty() {
            return plan;
        }
        let mut ordered: Vec<&RegionInfo> = regions.iter().collect();
        ordered.sort_by_key(|r| !r.is_catalog());
        for (i, region) in ordered.into_iter().enumerate() {
            plan.entry(servers[i % servers.len()].clone())
                .or_default()
                .push(region.clone());
        }
        plan
    }

    fn retain_assignment(
        &self,
        regions: &HashMap<RegionInfo, Option<ServerName>>,
        servers: &[ServerName],
    ) -> HashMap<ServerName, Vec<RegionInfo>> {
        let mut plan: HashMap<ServerName, Vec<RegionInfo>> = HashMap::new();
        if servers.is_empty() {
            return plan;
        }
        let mut retained = 0usize;
        for (region, previous) in regions {
            let kept = previous
                .as_ref()
                .and_then(|prev| servers.iter().find(|s| s.same_host_and_port(prev)));
            let destination = match kept {
                Some(server) => {
                    retained += 1;
                    server.clone()
                }
                None => match self.random_assignment(region, servers) {
                    Some(server) => server,
                    None => continue,
                },
            };
            plan.entry(destination).or_default().push(region.clone());
        }
        tracing::info!(
            regions = regions.len(),
            retained,
            servers = servers.len(),
            "computed retaining assignment"
        );
        plan
    }

    fn balance_cluster(
        &self,
        assignments: &HashMap<ServerName, Vec<RegionInfo>>,
        servers: &[ServerName],
    ) -> Vec<RegionPlan> {
        if servers.len() < 2 {
            return Vec::new();
        }

        // Per-server region lists for the eligible servers only.
        let mut held: HashMap<&ServerName, Vec<&RegionInfo>> =
            servers.iter().map(|s| (s, Vec::new())).collect();
        for (server, regions) in assignments {
            if let Some(list) = held.get_mut(server) {
                list.extend(regions.iter());
            }
        }

        let total: usize = held.values().map(Vec::len).sum();
        let target_min = total / servers.len();
        let extra = total % servers.len();

        // The most loaded servers keep the +1 slots, to minimize movement.
        let mut by_load: Vec<&ServerName> = servers.iter().collect();
        by_load.sort_by(|a, b| held[b].len().cmp(&held[a].len()).then_with(|| a.cmp(b)));
        let targets: HashMap<&ServerName, usize> = by_load
            .iter()
            .enumerate()
            .map(|(i, s)| (*s, if i < extra { target_min + 1 } else { target_min }))
            .collect();

        // Strip movable excess from overloaded servers.
        let mut pool: Vec<(&ServerName, &RegionInfo)> = Vec::new();
        for server in &by_load {
            let target = targets[server];
            let Some(list) = held.get_mut(server) else {
                continue;
            };
            if list.len() <= target {
                continue;
            }
            list.sort_by_key(|r| (r.is_catalog(), r.encoded_name()));
            let mut excess = list.len() - target;
            let mut kept = Vec::with_capacity(list.len());
            for region in list.drain(..) {
                if excess > 0 && !region.is_catalog() {
                    pool.push((*server, region));
                    excess -= 1;
                } else {
                    kept.push(region);
                }
            }
            *list = kept;
        }

        // Fill underloaded servers, emptiest first.
        let mut plans = Vec::with_capacity(pool.len());
        let mut pool = pool.into_iter();
        for server in by_load.iter().rev() {
            let target = targets[server];
            let Some(list) = held.get_mut(server) else {
                continue;
            };
            while list.len() < target {
                let Some((source, region)) = pool.next() else {
                    break;
                };
                list.push(region);
                plans.push(RegionPlan::new(
                    region.clone(),
                    Some(source.clone()),
                    (*server).clone(),
                ));
            }
        }
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableName;

    fn servers(n: u16) -> Vec<ServerName> {
        (0..n)
            .map(|i| ServerName::new(format!("rs{i}"), 16020, 1))
            .collect()
    }

    fn regions(n: usize) -> Vec<RegionInfo> {
        (0..n)
            .map(|i| RegionInfo::new(TableName::new("t1"), format!("{i:04}").as_bytes(), b"", 1))
            .collect()
    }

    fn counts_after(
        assignments: &HashMap<ServerName, Vec<RegionInfo>>,
        plans: &[RegionPlan],
    ) -> HashMap<ServerName, usize> {
        let mut counts: HashMap<ServerName, usize> = assignments
            .iter()
            .map(|(s, r)| (s.clone(), r.len()))
            .collect();
        for plan in plans {
            *counts.get_mut(plan.source.as_ref().unwrap()).unwrap() -= 1;
            *counts
                .entry(plan.destination.clone().unwrap())
                .or_default() += 1;
        }
        counts
    }

    #[test]
    fn round_robin_is_even_and_catalog_first() {
        let servers = servers(3);
        let mut input = regions(8);
        input.push(RegionInfo::new(TableName::catalog(), b"", b"", 1));
        let plan = DefaultLoadBalancer.round_robin_assignment(&input, &servers);

        let mut counts: Vec<usize> = plan.values().map(Vec::len).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 3]);
        assert!(plan[&servers[0]][0].is_catalog());
    }

    #[test]
    fn retain_matches_host_and_port_across_restart() {
        let old = ServerName::new("rs1", 16020, 1);
        let restarted = ServerName::new("rs1", 16020, 2);
        let other = ServerName::new("rs2", 16020, 1);
        let r = regions(1).remove(0);

        let mut input = HashMap::new();
        input.insert(r.clone(), Some(old));
        let plan =
            DefaultLoadBalancer.retain_assignment(&input, &[restarted.clone(), other]);
        assert_eq!(plan[&restarted], vec![r]);
    }

    #[test]
    fn balance_moves_excess_to_new_server() {
        let servers = servers(3);
        let mut assignments = HashMap::new();
        let mut all = regions(9);
        all.push(RegionInfo::new(TableName::catalog(), b"", b"", 1));
        assignments.insert(servers[0].clone(), all);
        assignments.insert(servers[1].clone(), Vec::new());

        let plans = DefaultLoadBalancer.balance_cluster(&assignments, &servers);

        assert!(plans.iter().all(|p| !p.region.is_catalog()));
        let counts = counts_after(&assignments, &plans);
        let mean = 10.0 / 3.0;
        for server in &servers {
            let count = counts.get(server).copied().unwrap_or(0) as f64;
            assert!((count - mean).abs() <= 1.0, "{server}: {count}");
        }
        assert_eq!(plans.len(), 6);
    }

    #[test]
    fn balanced_cluster_produces_no_plans() {
        let servers = servers(2);
        let all = regions(4);
        let mut assignments = HashMap::new();
        assignments.insert(servers[0].clone(), all[..2].to_vec());
        assignments.insert(servers[1].clone(), all[2..].to_vec());
        assert!(DefaultLoadBalancer
            .balance_cluster(&assignments, &servers)
            .is_empty());
    }

    #[test]
    fn no_servers_means_no_destination() {
        let r = regions(1).remove(0);
        assert_eq!(DefaultLoadBalancer.random_assignment(&r, &[]), None);
        assert!(DefaultLoadBalancer
            .round_robin_assignment(&[r], &[])
            .is_empty());
    }
}
