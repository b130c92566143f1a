//! Longest-prefix-match routing trie.
//!
//! A multibit trie with an 8-bit stride. Each node carries two
//! bitmap-indexed packed arrays: one for prefixes terminating inside
//! the node (remaining length `r` in `0..=8`, heap layout
//! `(1 << r) - 1 + c`) and one for child pointers keyed by the next key
//! byte. Lookup walks at most 4 levels for IPv4 keys and 16 for IPv6.

use crate::errors::TrieError;
use crate::sparse::SparseBitSlot;
use ipnet::IpNet;
use log::{debug, trace};
use metrics::counter;
use std::net::IpAddr;

/// Key bits consumed per trie level.
pub const STRIDE: usize = 8;
/// Internal prefix slots per node: one per `(r, c)` pair, heap layout.
pub const PREFIX_SLOTS: usize = (1 << (STRIDE + 1)) - 1;
/// Child slots per node, one per possible key byte.
pub const CHILD_SLOTS: usize = 1 << STRIDE;

const PREFIX_BITMAP_BYTES: usize = (PREFIX_SLOTS + 7) / 8;
const CHILD_BITMAP_BYTES: usize = CHILD_SLOTS / 8;

const V4_LEVELS: usize = 4;
const V6_LEVELS: usize = 16;

/// Iteration callbacks for [`TrieRoot::dump`].
pub trait TrieWalker<T> {
    /// Receives one formatted `network/len : data` line.
    fn on_node(&mut self, line: &str);
    /// Renders the user data carried by an entry.
    fn data_to_string(&self, data: &T) -> String;
}

struct TrieNode<T> {
    prefixes: SparseBitSlot<T, PREFIX_BITMAP_BYTES>,
    children: SparseBitSlot<Box<TrieNode<T>>, CHILD_BITMAP_BYTES>,
}

/// Longest-match state threaded through the per-level descent. The
/// deepest level that records a hit wins; `bytes` collects the matched
/// path and is masked to `plen` at the end.
struct LookupState<'a, T> {
    data: Option<&'a T>,
    plen: usize,
    bytes: [u8; 16],
}

impl<T> TrieNode<T> {
    fn new() -> Self {
        TrieNode {
            prefixes: SparseBitSlot::new(),
            children: SparseBitSlot::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.children.is_empty()
    }

    fn add(&mut self, key: &[u8; 16], level: usize, rplen: usize, data: T) -> Result<(), TrieError> {
        let cval = key[level] as usize;
        if rplen > STRIDE {
            if !self.children.contains(cval) {
                self.children
                    .insert(cval, Box::new(TrieNode::new()))
                    .map_err(|_| TrieError::Unknown)?;
            }
            let child = self.children.get_mut(cval).ok_or(TrieError::Unknown)?;
            child.add(key, level + 1, rplen - STRIDE, data)
        } else {
            let idx = ((1usize << rplen) - 1) + (cval >> (STRIDE - rplen));
            self.prefixes.insert(idx, data).map_err(|_| TrieError::Exists)
        }
    }

    fn del(&mut self, key: &[u8; 16], level: usize, rplen: usize) -> Result<(), TrieError> {
        let cval = key[level] as usize;
        if rplen > STRIDE {
            let child = self.children.get_mut(cval).ok_or(TrieError::NoEnt)?;
            child.del(key, level + 1, rplen - STRIDE)?;
            if child.is_empty() {
                self.children.remove(cval);
            }
            Ok(())
        } else {
            let idx = ((1usize << rplen) - 1) + (cval >> (STRIDE - rplen));
            self.prefixes.remove(idx).map(|_| ()).ok_or(TrieError::NoEnt)
        }
    }

    fn find<'a>(
        &'a self,
        key: &[u8; 16],
        level: usize,
        max_levels: usize,
        st: &mut LookupState<'a, T>,
    ) {
        let byte = key[level] as usize;
        // Longest internal prefix at this node: scan rows from the
        // widest remaining length down.
        for r in (0..=STRIDE).rev() {
            let base = (1usize << r) - 1;
            let idx = base + (byte >> (STRIDE - r));
            if self.prefixes.contains(idx) {
                st.plen = level * STRIDE + r;
                st.bytes[level] = ((idx - base) << (STRIDE - r)) as u8;
                st.data = self.prefixes.get(idx);
                break;
            }
        }
        if level + 1 < max_levels {
            if let Some(child) = self.children.get(byte) {
                st.bytes[level] = byte as u8;
                child.find(key, level + 1, max_levels, st);
            }
        }
    }

    fn walk<W: TrieWalker<T>>(
        &self,
        buf: &mut [u8; 16],
        level: usize,
        max_levels: usize,
        walker: &mut W,
    ) {
        for p in 0..PREFIX_SLOTS {
            let data = match self.prefixes.get(p) {
                Some(d) => d,
                None => continue,
            };
            let r = (p + 1).ilog2() as usize;
            let base = (1usize << r) - 1;
            let cval = ((p - base) << (STRIDE - r)) as u8;
            let plen = level * STRIDE + r;
            let mut addr = String::new();
            for i in 0..max_levels {
                let byte = match i.cmp(&level) {
                    std::cmp::Ordering::Less => buf[i],
                    std::cmp::Ordering::Equal => cval,
                    std::cmp::Ordering::Greater => 0,
                };
                addr.push_str(&byte.to_string());
                if i != max_levels - 1 {
                    addr.push('.');
                }
            }
            let line = format!("{:>20}/{} : {}", addr, plen, walker.data_to_string(data));
            walker.on_node(&line);
        }
        for c in 0..CHILD_SLOTS {
            if let Some(child) = self.children.get(c) {
                buf[level] = c as u8;
                child.walk(buf, level + 1, max_levels, walker);
            }
        }
        buf[level] = 0;
    }
}

/// Root of an LPM trie. The address family is fixed at construction;
/// keys of the other family are rejected with [`TrieError::Prefix`].
pub struct TrieRoot<T> {
    v6: bool,
    node: TrieNode<T>,
}

impl<T> TrieRoot<T> {
    /// Creates a trie typed for IPv4 (`v6 == false`) or IPv6 keys.
    pub fn new(v6: bool) -> Self {
        crate::ensure_logging();
        TrieRoot {
            v6,
            node: TrieNode::new(),
        }
    }

    fn max_levels(&self) -> usize {
        if self.v6 {
            V6_LEVELS
        } else {
            V4_LEVELS
        }
    }

    fn key_of(&self, cidr: &str) -> Result<([u8; 16], usize), TrieError> {
        let net: IpNet = cidr.parse().map_err(|_| TrieError::Prefix)?;
        let mut key = [0u8; 16];
        match (self.v6, net.network()) {
            (false, IpAddr::V4(v4)) => key[..4].copy_from_slice(&v4.octets()),
            (true, IpAddr::V6(v6)) => key.copy_from_slice(&v6.octets()),
            _ => return Err(TrieError::Prefix),
        }
        Ok((key, net.prefix_len() as usize))
    }

    fn key_of_ip(&self, ip: &str) -> Result<[u8; 16], TrieError> {
        let addr: IpAddr = ip.parse().map_err(|_| TrieError::Prefix)?;
        let mut key = [0u8; 16];
        match (self.v6, addr) {
            (false, IpAddr::V4(v4)) => key[..4].copy_from_slice(&v4.octets()),
            (true, IpAddr::V6(v6)) => key.copy_from_slice(&v6.octets()),
            _ => return Err(TrieError::Prefix),
        }
        Ok(key)
    }

    /// Inserts `cidr` with its user data. A prefix that is already
    /// present fails [`TrieError::Exists`].
    pub fn add(&mut self, cidr: &str, data: T) -> Result<(), TrieError> {
        let (key, plen) = self.key_of(cidr)?;
        counter!("flowlib_trie_inserts_total").increment(1);
        debug!("trie: add {} (len {})", cidr, plen);
        self.node.add(&key, 0, plen, data)
    }

    /// Inserts a batch, stopping at the first failure.
    pub fn add_many<S, I>(&mut self, items: I) -> Result<(), TrieError>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, T)>,
    {
        for (cidr, data) in items {
            self.add(cidr.as_ref(), data)?;
        }
        Ok(())
    }

    /// Removes `cidr`. Nodes left with no prefixes and no children are
    /// pruned from their parent on the way out.
    pub fn del(&mut self, cidr: &str) -> Result<(), TrieError> {
        let (key, plen) = self.key_of(cidr)?;
        counter!("flowlib_trie_deletes_total").increment(1);
        debug!("trie: del {} (len {})", cidr, plen);
        self.node.del(&key, 0, plen)
    }

    /// Longest-prefix lookup for a plain address. Returns the matched
    /// network and a reference to its data, or [`TrieError::NoEnt`].
    pub fn find(&self, ip: &str) -> Result<(IpNet, &T), TrieError> {
        let key = self.key_of_ip(ip)?;
        let mut st = LookupState {
            data: None,
            plen: 0,
            bytes: [0u8; 16],
        };
        self.node.find(&key, 0, self.max_levels(), &mut st);
        let data = st.data.ok_or(TrieError::NoEnt)?;
        let matched = if self.v6 {
            IpAddr::from(st.bytes)
        } else {
            IpAddr::from([st.bytes[0], st.bytes[1], st.bytes[2], st.bytes[3]])
        };
        let net = IpNet::new(matched, st.plen as u8)
            .map_err(|_| TrieError::Unknown)?
            .trunc();
        trace!("trie: find {} -> {}", ip, net);
        Ok((net, data))
    }

    /// Feeds every stored entry through the walker: local prefixes in
    /// ascending bit order first, then subtrees in ascending byte order.
    pub fn dump<W: TrieWalker<T>>(&self, walker: &mut W) {
        let mut buf = [0u8; 16];
        self.node.walk(&mut buf, 0, self.max_levels(), walker);
    }

    /// Drops every stored entry and child node.
    pub fn clear(&mut self) {
        debug!("trie: clear");
        self.node = TrieNode::new();
    }
}
