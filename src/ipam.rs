//! Multi-cluster IP address management.
//!
//! Named clusters hold pools of CIDR ranges. Each range hands out
//! dense indices through a [`Counter`] and maps them to addresses with
//! base-255 byte arithmetic; identity keys let several consumers pin
//! the range's first-issued address without spending more of the pool.

use crate::counter::Counter;
use crate::errors::{CounterError, IpamError};
use crate::netutil::{add_ip_index, diff_ip_index, parse_cidr, parse_ip};
use ipnet::IpNet;
use log::debug;
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Cluster that always exists.
pub const IP_CLUSTER_DEFAULT: &str = "default";
/// Identity for plain, non-shared allocations.
pub const IPAM_NO_IDENT: &str = "";

/// Pool density cap; larger CIDRs are truncated to this many indices.
const MAX_POOL_SZ: u128 = 65535;

/// Builds the canonical `name|id|proto` identity string. The protocol
/// portion compares case-insensitively.
pub fn make_ipam_ident(name: &str, id: u32, proto: &str) -> String {
    format!("{}|{}|{}", name, id, proto.to_lowercase())
}

fn ident_key(id: &str) -> String {
    id.to_lowercase()
}

struct IpRange {
    net: IpNet,
    free_ids: Counter,
    first: u64,
    first_ok: bool,
    ident: HashSet<String>,
}

impl IpRange {
    fn new(net: IpNet) -> Result<Self, IpamError> {
        let plen = u32::from(net.prefix_len());
        let addr_bits = u32::from(net.max_prefix_len());
        let host_bits = addr_bits - plen;
        let d = diff_ip_index(&net.network(), &net.addr());

        let full = |bits: u32| -> u128 {
            if bits >= 128 {
                u128::MAX
            } else {
                1u128 << bits
            }
        };
        let aligned = plen % 8 == 0 && plen != addr_bits;
        let (start, size) = if d > 0 {
            // Off-base CIDR: allocation begins at the caller's address
            // and the broadcast stays excluded.
            (u128::from(d), full(host_bits).saturating_sub(u128::from(d) + 1))
        } else if aligned {
            // Skip network and broadcast of a byte-aligned block.
            (1u128, full(host_bits).saturating_sub(2))
        } else {
            (0u128, full(host_bits))
        };
        let size = size.min(MAX_POOL_SZ);
        if size < 1 {
            return Err(IpamError::Subnet);
        }
        Ok(IpRange {
            net: net.trunc(),
            free_ids: Counter::new(start as u64, size as u64),
            first: 0,
            first_ok: false,
            ident: HashSet::new(),
        })
    }
}

struct IpClusterPool {
    name: String,
    pool: HashMap<String, IpRange>,
}

/// Top-level allocator: named clusters of CIDR ranges. The `"default"`
/// cluster is created up front.
pub struct IpAllocator {
    clusters: HashMap<String, IpClusterPool>,
}

impl IpAllocator {
    pub fn new() -> Self {
        crate::ensure_logging();
        let mut clusters = HashMap::new();
        clusters.insert(
            IP_CLUSTER_DEFAULT.to_string(),
            IpClusterPool {
                name: IP_CLUSTER_DEFAULT.to_string(),
                pool: HashMap::new(),
            },
        );
        IpAllocator { clusters }
    }

    fn cluster_mut(&mut self, cluster: &str) -> &mut IpClusterPool {
        self.clusters.entry(cluster.to_string()).or_insert_with(|| {
            debug!("ipam: new cluster {}", cluster);
            IpClusterPool {
                name: cluster.to_string(),
                pool: HashMap::new(),
            }
        })
    }

    fn range_mut(&mut self, cluster: &str, cidr: &str) -> Result<&mut IpRange, IpamError> {
        self.clusters
            .get_mut(cluster)
            .ok_or(IpamError::NoSuchCluster)?
            .pool
            .get_mut(cidr)
            .ok_or(IpamError::NoSuchRange)
    }

    // Allocation paths create missing ranges on demand; delete paths
    // never do.
    fn ensure_range(&mut self, cluster: &str, cidr: &str) -> Result<(), IpamError> {
        let missing = self
            .clusters
            .get(cluster)
            .map_or(true, |p| !p.pool.contains_key(cidr));
        if missing {
            self.add_ip_range(cluster, cidr)?;
        }
        Ok(())
    }

    /// Registers `cidr` as an allocatable range inside `cluster`,
    /// creating the cluster on first use. A range already covering the
    /// given address fails [`IpamError::RangeExists`].
    pub fn add_ip_range(&mut self, cluster: &str, cidr: &str) -> Result<(), IpamError> {
        let net = parse_cidr(cidr)?;
        let pool = self.cluster_mut(cluster);
        for ipr in pool.pool.values() {
            if ipr.net.contains(&net.addr()) {
                return Err(IpamError::RangeExists);
            }
        }
        let range = IpRange::new(net)?;
        debug!(
            "ipam: range {} added to {} ({} usable)",
            cidr,
            pool.name,
            range.free_ids.capacity()
        );
        pool.pool.insert(cidr.to_string(), range);
        Ok(())
    }

    /// Drops a range outright; outstanding allocations are forgotten.
    pub fn delete_ip_range(&mut self, cluster: &str, cidr: &str) -> Result<(), IpamError> {
        let pool = self
            .clusters
            .get_mut(cluster)
            .ok_or(IpamError::NoSuchCluster)?;
        pool.pool
            .remove(cidr)
            .map(|_| ())
            .ok_or(IpamError::NoSuchRange)
    }

    /// Allocates an address from `cluster`/`cidr`, creating the range
    /// on demand. A non-empty `ident` that already holds an allocation
    /// fails [`IpamError::IdentExists`]; otherwise it shares the
    /// range's first-issued address instead of consuming a fresh index.
    pub fn allocate_new_ip(
        &mut self,
        cluster: &str,
        cidr: &str,
        ident: &str,
    ) -> Result<IpAddr, IpamError> {
        self.ensure_range(cluster, cidr)?;
        let ipr = self.range_mut(cluster, cidr)?;

        let key = ident_key(ident);
        if !ident.is_empty() && ipr.ident.contains(&key) {
            return Err(IpamError::IdentExists);
        }
        let new_index = if ident.is_empty() || !ipr.first_ok {
            let idx = ipr.free_ids.get().map_err(|_| IpamError::Overflow)?;
            if !ipr.first_ok {
                ipr.first = idx;
                ipr.first_ok = true;
            }
            idx
        } else {
            ipr.first
        };
        ipr.ident.insert(key);

        let ip = add_ip_index(&ipr.net.network(), new_index);
        counter!("flowlib_ipam_allocs_total").increment(1);
        gauge!("flowlib_ipam_free_slots", "cidr" => cidr.to_string())
            .set(ipr.free_ids.capacity() as f64);
        debug!("ipam: {}/{} -> {} (index {})", cluster, cidr, ip, new_index);
        Ok(ip)
    }

    /// Releases `ip` held under `ident`. The backing index returns to
    /// the pool only when the last identity lets go.
    pub fn deallocate_ip(
        &mut self,
        cluster: &str,
        cidr: &str,
        ident: &str,
        ip: &str,
    ) -> Result<(), IpamError> {
        let ipr = self.range_mut(cluster, cidr)?;
        let addr = parse_ip(ip)?;
        let key = ident_key(ident);
        if !ipr.ident.contains(&key) {
            return Err(IpamError::IdentNotFound);
        }
        let ret = diff_ip_index(&ipr.net.network(), &addr);
        if ret == 0 && !(ipr.first_ok && ipr.first == 0) {
            return Err(IpamError::NoIndex);
        }
        ipr.ident.remove(&key);
        if ipr.ident.is_empty() {
            ipr.free_ids.put(ret).map_err(|_| IpamError::NoIndex)?;
        }
        counter!("flowlib_ipam_releases_total").increment(1);
        gauge!("flowlib_ipam_free_slots", "cidr" => cidr.to_string())
            .set(ipr.free_ids.capacity() as f64);
        debug!("ipam: {}/{} released {} (index {})", cluster, cidr, ip, ret);
        Ok(())
    }

    /// Re-emits the free-slot gauge for every range; the caller decides
    /// the cadence.
    pub fn report_capacity_metrics(&self) {
        for pool in self.clusters.values() {
            for (cidr, ipr) in &pool.pool {
                gauge!("flowlib_ipam_free_slots", "cidr" => cidr.clone())
                    .set(ipr.free_ids.capacity() as f64);
            }
        }
    }

    /// Pins a specific in-range address so ordinary allocation skips
    /// it. The range is created on demand.
    pub fn reserve_ip(
        &mut self,
        cluster: &str,
        cidr: &str,
        ident: &str,
        ip: &str,
    ) -> Result<(), IpamError> {
        self.ensure_range(cluster, cidr)?;
        let ipr = self.range_mut(cluster, cidr)?;
        let addr = parse_ip(ip)?;
        if !ipr.net.contains(&addr) {
            return Err(IpamError::OutOfBounds);
        }
        let key = ident_key(ident);
        if !ident.is_empty() && ipr.ident.contains(&key) {
            return Err(IpamError::IdentExists);
        }
        let ret = diff_ip_index(&ipr.net.network(), &addr);
        ipr.free_ids.reserve(ret).map_err(|e| match e {
            CounterError::Range => IpamError::OutOfBounds,
            CounterError::Overflow => IpamError::Overflow,
        })?;
        if !ipr.first_ok {
            ipr.first = ret;
            ipr.first_ok = true;
        }
        ipr.ident.insert(key);
        debug!("ipam: {}/{} reserved {} (index {})", cluster, cidr, ip, ret);
        Ok(())
    }
}

impl Default for IpAllocator {
    fn default() -> Self {
        Self::new()
    }
}
