//! Side tables joining OpenSSL plaintext with its socket
//!
//! `SSL*` values are only unique inside one process, so every table is keyed
//! by host pid and handle.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{debug, trace};

use crate::decode::{SslHandle, SslOp, TlsPlaintext};
use crate::domain::{Connection, ProcessIdentity, Tid};

/// Plaintext records kept per handle while its connection is unknown
const MAX_PARKED_PER_HANDLE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TlsKey {
    host_pid: u32,
    handle: SslHandle,
}

struct Bound {
    connection: Connection,
    last_seen: Duration,
}

struct Owner {
    process: ProcessIdentity,
    thread: Tid,
    last_seen: Duration,
}

struct Parked {
    records: VecDeque<TlsPlaintext>,
    last_seen: Duration,
}

#[derive(Default)]
pub struct TlsTables {
    connections: HashMap<TlsKey, Bound>,
    owners: HashMap<TlsKey, Owner>,
    parked: HashMap<TlsKey, Parked>,
}

impl TlsTables {
    /// Record handle → connection; returns plaintext that was waiting for it
    pub fn bind(
        &mut self,
        host_pid: u32,
        handle: SslHandle,
        connection: Connection,
        now: Duration,
    ) -> Vec<TlsPlaintext> {
        let key = TlsKey { host_pid, handle };
        self.connections.insert(
            key,
            Bound {
                connection,
                last_seen: now,
            },
        );

        let released: Vec<_> = self
            .parked
            .remove(&key)
            .map(|p| p.records.into())
            .unwrap_or_default();
        if !released.is_empty() {
            debug!("{handle} bound to {connection}, releasing {} parked records", released.len());
        }
        released
    }

    /// Take in one plaintext record
    ///
    /// Returns the record with its connection when that is already known.
    /// Unknown handles park the record; shutdown forgets the handle.
    pub fn accept(
        &mut self,
        plain: TlsPlaintext,
        now: Duration,
    ) -> Option<(TlsPlaintext, Connection)> {
        let key = TlsKey {
            host_pid: plain.process.host_pid,
            handle: plain.handle,
        };
        // The first thread seen on a handle owns the session
        let owner = self.owners.entry(key).or_insert(Owner {
            process: plain.process,
            thread: plain.thread,
            last_seen: now,
        });
        owner.last_seen = now;

        match plain.op {
            SslOp::Shutdown => {
                self.forget(key);
                return None;
            }
            SslOp::Handshake => return None,
            SslOp::Read | SslOp::Write => {}
        }

        if let Some(bound) = self.connections.get_mut(&key) {
            bound.last_seen = now;
            return Some((plain, bound.connection));
        }

        let parked = self
            .parked
            .entry(key)
            .or_insert_with(|| Parked {
                records: VecDeque::new(),
                last_seen: now,
            });
        if parked.records.len() == MAX_PARKED_PER_HANDLE {
            trace!("{}: parked queue full, dropping oldest", plain.handle);
            parked.records.pop_front();
        }
        parked.records.push_back(plain);
        parked.last_seen = now;
        None
    }

    /// Process and thread that opened the session on a handle
    #[must_use]
    pub fn owner(&self, host_pid: u32, handle: SslHandle) -> Option<(ProcessIdentity, Tid)> {
        self.owners
            .get(&TlsKey { host_pid, handle })
            .map(|o| (o.process, o.thread))
    }

    #[cfg(test)]
    fn connection(&self, host_pid: u32, handle: SslHandle) -> Option<Connection> {
        self.connections
            .get(&TlsKey { host_pid, handle })
            .map(|b| b.connection)
    }

    #[cfg(test)]
    fn parked_len(&self) -> usize {
        self.parked.values().map(|p| p.records.len()).sum()
    }

    /// Drop entries idle for longer than `ttl`; returns how many went
    pub fn evict_idle(&mut self, now: Duration, ttl: Duration) -> usize {
        let fresh = |last_seen: Duration| now.saturating_sub(last_seen) <= ttl;
        let before = self.connections.len() + self.owners.len() + self.parked.len();
        self.connections.retain(|_, b| fresh(b.last_seen));
        self.owners.retain(|_, o| fresh(o.last_seen));
        self.parked.retain(|_, p| fresh(p.last_seen));
        before - (self.connections.len() + self.owners.len() + self.parked.len())
    }

    fn forget(&mut self, key: TlsKey) {
        self.connections.remove(&key);
        self.owners.remove(&key);
        self.parked.remove(&key);
    }
}
