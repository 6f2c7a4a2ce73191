/// Deterministic subnet layout and private IP arithmetic
use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Prefix length of per-pool worker subnets
const WORKER_POOL_PREFIX: u8 = 24;

/// Nodes per placement-group shard in a worker pool
pub const PLACEMENT_SHARD_SIZE: u32 = 10;

/// The three children derived from the cluster network CIDR.
///
/// The parent is split at `prefix + 2`; the fourth child stays unused.
/// Only leaf subnets are ever created on the cloud side: the worker
/// parent is an address reservation that is carved into one subnet per
/// worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLayout {
    pub load_balancer: Ipv4Net,
    pub control_plane: Ipv4Net,
    pub worker_parent: Ipv4Net,
}

impl SubnetLayout {
    /// Derive the layout from the cluster network CIDR.
    pub fn derive(parent: Ipv4Net) -> Result<Self> {
        if parent.prefix_len() > 22 {
            anyhow::bail!(
                "network CIDR {} is too small to split into role subnets (need /22 or larger)",
                parent
            );
        }

        let mut children = parent
            .subnets(parent.prefix_len() + 2)
            .context("failed to split network CIDR")?;

        let load_balancer = children.next().context("missing load balancer subnet")?;
        let control_plane = children.next().context("missing control plane subnet")?;
        let worker_parent = children.next().context("missing worker parent subnet")?;

        Ok(Self {
            load_balancer,
            control_plane,
            worker_parent,
        })
    }

    /// The subnet reserved for worker pool `pool_index` (0-based).
    pub fn worker_pool_subnet(&self, pool_index: usize) -> Result<Ipv4Net> {
        let capacity = 1usize << (WORKER_POOL_PREFIX - self.worker_parent.prefix_len());
        if pool_index >= capacity {
            anyhow::bail!(
                "worker pool index {} exceeds the {} pools that fit in {}",
                pool_index,
                capacity,
                self.worker_parent
            );
        }

        let base = u32::from(self.worker_parent.network());
        let step = 1u32 << (32 - WORKER_POOL_PREFIX);
        let addr = Ipv4Addr::from(base + pool_index as u32 * step);
        Ipv4Net::new(addr, WORKER_POOL_PREFIX).context("invalid worker pool subnet")
    }

    /// Private IP of control-plane node `node_index` (1-based) in pool
    /// `pool_index` (0-based). Host `.1` belongs to the cloud gateway,
    /// so the first node of the first pool lands on `.2`.
    pub fn control_plane_ip(&self, pool_index: usize, node_index: u32) -> Ipv4Addr {
        let offset = pool_index as u32 * 10 + (node_index - 1) + 2;
        host(self.control_plane, offset)
    }

    /// Private IP of worker node `node_index` (1-based) in pool
    /// `pool_index` (0-based).
    pub fn worker_ip(&self, pool_index: usize, node_index: u32) -> Result<Ipv4Addr> {
        let subnet = self.worker_pool_subnet(pool_index)?;
        Ok(host(subnet, node_index + 2))
    }

    /// Private IP the load balancer attaches at: the last usable host of
    /// the load-balancer subnet.
    pub fn load_balancer_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.load_balancer.broadcast()) - 1)
    }
}

/// `host(subnet, n)`: the address `n` above the network address.
fn host(subnet: Ipv4Net, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + offset)
}

/// Placement-group shard (1-based) for worker node `node_index` (1-based).
pub fn placement_shard(node_index: u32) -> u32 {
    node_index.div_ceil(PLACEMENT_SHARD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> SubnetLayout {
        SubnetLayout::derive("10.0.0.0/16".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_derive_children() {
        let l = layout();
        assert_eq!(l.load_balancer, "10.0.0.0/18".parse::<Ipv4Net>().unwrap());
        assert_eq!(l.control_plane, "10.0.64.0/18".parse::<Ipv4Net>().unwrap());
        assert_eq!(l.worker_parent, "10.0.128.0/18".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_derive_rejects_tiny_networks() {
        assert!(SubnetLayout::derive("10.0.0.0/24".parse().unwrap()).is_err());
    }

    #[test]
    fn test_control_plane_ips_first_pool() {
        let l = layout();
        assert_eq!(l.control_plane_ip(0, 1), "10.0.64.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(l.control_plane_ip(0, 2), "10.0.64.3".parse::<Ipv4Addr>().unwrap());
        assert_eq!(l.control_plane_ip(0, 3), "10.0.64.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_control_plane_ips_second_pool_offset_by_ten() {
        let l = layout();
        assert_eq!(l.control_plane_ip(1, 1), "10.0.64.12".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_worker_pool_subnets() {
        let l = layout();
        assert_eq!(
            l.worker_pool_subnet(0).unwrap(),
            "10.0.128.0/24".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(
            l.worker_pool_subnet(3).unwrap(),
            "10.0.131.0/24".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn test_worker_ips_start_above_gateway() {
        let l = layout();
        assert_eq!(l.worker_ip(0, 1).unwrap(), "10.0.128.3".parse::<Ipv4Addr>().unwrap());
        assert_eq!(l.worker_ip(1, 2).unwrap(), "10.0.129.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_load_balancer_last_usable_host() {
        let l = layout();
        assert_eq!(l.load_balancer_ip(), "10.0.63.254".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_ip_derivation_is_deterministic() {
        let a = layout();
        let b = layout();
        for pool in 0..3 {
            for node in 1..5 {
                assert_eq!(a.control_plane_ip(pool, node), b.control_plane_ip(pool, node));
                assert_eq!(a.worker_ip(pool, node).unwrap(), b.worker_ip(pool, node).unwrap());
            }
        }
    }

    #[test]
    fn test_placement_shards() {
        assert_eq!(placement_shard(1), 1);
        assert_eq!(placement_shard(10), 1);
        assert_eq!(placement_shard(11), 2);
        assert_eq!(placement_shard(25), 3);
    }
}
