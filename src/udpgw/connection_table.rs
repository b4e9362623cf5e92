//! The pool of logical UDP connections multiplexed over one gateway stream.
//!
//! A connection is identified locally by its `(local, remote)` address pair and on the wire by a
//!  16-bit connection id. The pool is bounded: when it is full, the least recently used
//!  connection makes room for a new one.

use std::net::SocketAddr;
use lru::LruCache;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// the connection is closed, and the new one gets a fresh slot and a fresh connection id
    Reallocate,
    /// the connection's slot, connection id and send pipeline are taken over by the new address pair
    Repurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

pub struct Connection<T> {
    key: ConnectionKey,
    conid: u16,
    /// the next packet must tell the server to discard state for this id
    rebind: bool,
    pub data: T,
}

impl<T> Connection<T> {
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn conid(&self) -> u16 {
        self.conid
    }

    /// `true` exactly once after the connection was created or repurposed
    pub fn take_rebind(&mut self) -> bool {
        std::mem::take(&mut self.rebind)
    }
}

pub struct ConnectionTable<T> {
    max_connections: usize,
    strategy: EvictionStrategy,
    /// the table enforces its bound itself, evicting before it inserts
    connections: LruCache<ConnectionKey, Connection<T>, FxBuildHasher>,
    by_conid: FxHashMap<u16, ConnectionKey>,
    next_conid: u16,
}

impl<T> ConnectionTable<T> {
    pub fn new(max_connections: usize, strategy: EvictionStrategy) -> ConnectionTable<T> {
        assert!(max_connections > 0 && max_connections <= u16::MAX as usize + 1);

        ConnectionTable {
            max_connections,
            strategy,
            connections: LruCache::unbounded_with_hasher(FxBuildHasher::default()),
            by_conid: Default::default(),
            next_conid: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Find the connection for an address pair, creating it if necessary, and mark it as most
    ///  recently used. `new_data` is called for connections that need a new send pipeline.
    pub fn get_or_insert(&mut self, key: ConnectionKey, new_data: impl FnOnce(u16) -> T) -> &mut Connection<T> {
        if !self.connections.contains(&key) && self.connections.len() == self.max_connections {
            match self.strategy {
                EvictionStrategy::Reallocate => self.evict_lru(),
                EvictionStrategy::Repurpose => {
                    if let Some(connection) = self.repurpose_lru(key) {
                        return self.connections.get_or_insert_mut(key, || connection);
                    }
                }
            }
        }

        let ConnectionTable { connections, by_conid, next_conid, .. } = self;
        connections.get_or_insert_mut(key, || {
            let conid = Self::unused_conid(by_conid, next_conid);
            trace!("new connection {:?} -> {:?} with id {}", key.local, key.remote, conid);
            by_conid.insert(conid, key);
            Connection {
                key,
                conid,
                rebind: true,
                data: new_data(conid),
            }
        })
    }

    pub fn get_by_conid(&self, conid: u16) -> Option<&Connection<T>> {
        self.by_conid.get(&conid)
            .and_then(|key| self.connections.peek(key))
    }

    /// mark a connection as most recently used
    pub fn touch(&mut self, conid: u16) {
        if let Some(key) = self.by_conid.get(&conid) {
            self.connections.promote(key);
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&Connection<T>> {
        self.connections.peek(key)
    }

    /// connection keys, least recently used first
    pub fn keys_by_recency(&self) -> Vec<ConnectionKey> {
        self.connections.iter()
            .rev()
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.by_conid.clear();
    }

    fn evict_lru(&mut self) {
        let Some((key, connection)) = self.connections.pop_lru() else {
            return;
        };
        debug!("evicting connection {:?} -> {:?} with id {}", key.local, key.remote, connection.conid);
        self.by_conid.remove(&connection.conid);
    }

    /// Take the least recently used connection out of the table, handing its id and data over
    ///  to `key`
    fn repurpose_lru(&mut self, key: ConnectionKey) -> Option<Connection<T>> {
        let (old_key, mut connection) = self.connections.pop_lru()?;

        debug!("repurposing connection id {} from {:?} -> {:?} to {:?} -> {:?}", connection.conid,
            old_key.local, old_key.remote, key.local, key.remote);
        self.by_conid.insert(connection.conid, key);
        connection.key = key;
        connection.rebind = true;
        Some(connection)
    }

    /// Scan ids cyclically, starting after the last one assigned
    fn unused_conid(by_conid: &FxHashMap<u16, ConnectionKey>, next_conid: &mut u16) -> u16 {
        loop {
            let candidate = *next_conid;
            *next_conid = next_conid.wrapping_add(1);
            if !by_conid.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
