//! Shared backend connection pool.
//!
//! A [`SharedBackendConn`] multiplexes many logical tenants onto a fixed
//! fan-out of workers per backend address: `parallel` connections for each
//! of `number_databases` databases, all dialed eagerly at construction.
//! The pool refcounts shared connections per address; the last release
//! closes every worker and removes the entry.
//!
//! Neither type locks internally: `retain`/`release` take `&mut self`, so
//! the outer coordinator serializes pool mutation by ownership.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::BackendConn;
use crate::config::BackendConfig;

/// Refcounted fan-out of workers for one backend address.
pub struct SharedBackendConn {
    addr: String,
    conns: Vec<Vec<BackendConn>>,
    // with parallel == 1 selection is just an index, precompute it
    single: Option<Vec<BackendConn>>,
    refcnt: usize,
}

impl SharedBackendConn {
    fn new(addr: &str, config: &Arc<BackendConfig>, parallel: usize) -> SharedBackendConn {
        let conns: Vec<Vec<BackendConn>> = (0..config.number_databases)
            .map(|database| {
                (0..parallel)
                    .map(|_| BackendConn::new(addr, database, config.clone()))
                    .collect()
            })
            .collect();
        let single = (parallel == 1)
            .then(|| conns.iter().map(|parallel| parallel[0].clone()).collect());
        SharedBackendConn {
            addr: addr.to_string(),
            conns,
            single,
            refcnt: 1,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Selects one worker for `database`.
    ///
    /// With a single connection per database the answer is fixed.
    /// Otherwise the scan starts at `seed + 1` (the caller passes a key
    /// hash for affinity) and takes the first connected worker. With no
    /// worker connected, `must` forces the first worker anyway: its drain
    /// will fail the request promptly, which beats dropping it.
    pub fn backend_conn(&self, database: usize, seed: usize, must: bool) -> Option<&BackendConn> {
        if let Some(single) = &self.single {
            let bc = &single[database];
            if must || bc.is_connected() {
                return Some(bc);
            }
            return None;
        }

        let parallel = &self.conns[database];
        let mut i = seed;
        for _ in 0..parallel.len() {
            i = (i + 1) % parallel.len();
            if parallel[i].is_connected() {
                return Some(&parallel[i]);
            }
        }
        if must {
            return Some(&parallel[0]);
        }
        None
    }

    pub async fn keep_alive(&self) {
        for parallel in &self.conns {
            for bc in parallel {
                bc.keep_alive().await;
            }
        }
    }

    fn close_all(&self) {
        for parallel in &self.conns {
            for bc in parallel {
                bc.close();
            }
        }
    }
}

/// Pool of shared backend connections, keyed by address.
///
/// All mutation goes through `&mut self`; the caller serializes access.
pub struct SharedBackendPool {
    config: Arc<BackendConfig>,
    parallel: usize,
    pool: HashMap<String, SharedBackendConn>,
}

impl SharedBackendPool {
    pub fn new(config: Arc<BackendConfig>, parallel: usize) -> SharedBackendPool {
        SharedBackendPool {
            config,
            parallel: parallel.max(1),
            pool: HashMap::new(),
        }
    }

    pub fn get(&self, addr: &str) -> Option<&SharedBackendConn> {
        self.pool.get(addr)
    }

    /// Returns the shared connection for `addr`, creating and eagerly
    /// dialing it on first use, incrementing its refcount otherwise.
    pub fn retain(&mut self, addr: &str) -> &SharedBackendConn {
        if self.pool.contains_key(addr) {
            let s = self.pool.get_mut(addr).unwrap();
            s.refcnt += 1;
            return s;
        }
        debug!(addr, parallel = self.parallel, "pool opens shared backend conn");
        self.pool
            .entry(addr.to_string())
            .or_insert_with(|| SharedBackendConn::new(addr, &self.config, self.parallel))
    }

    /// Drops one reference to `addr`. The last release closes every
    /// worker and removes the pool entry.
    ///
    /// # Panics
    ///
    /// Panics when releasing an address that is not retained.
    pub fn release(&mut self, addr: &str) {
        let s = self
            .pool
            .get_mut(addr)
            .unwrap_or_else(|| panic!("shared backend conn to {addr} released too many times"));
        s.refcnt -= 1;
        if s.refcnt != 0 {
            return;
        }
        debug!(addr, "pool closes shared backend conn");
        s.close_all();
        self.pool.remove(addr);
    }

    pub async fn keep_alive(&self) {
        for s in self.pool.values() {
            s.keep_alive().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<BackendConfig> {
        Arc::new(BackendConfig {
            number_databases: 2,
            ..BackendConfig::default()
        })
    }

    // none of these dial anything reachable: selection and refcounting
    // must behave with every worker disconnected

    #[tokio::test]
    async fn retain_is_refcounted() {
        let mut pool = SharedBackendPool::new(test_config(), 1);
        let addr = "127.0.0.1:1";

        pool.retain(addr);
        pool.retain(addr);
        assert!(pool.get(addr).is_some());

        pool.release(addr);
        assert!(pool.get(addr).is_some(), "still one reference out");

        pool.release(addr);
        assert!(pool.get(addr).is_none(), "last release removes the entry");
    }

    #[tokio::test]
    #[should_panic(expected = "released too many times")]
    async fn over_release_panics() {
        let mut pool = SharedBackendPool::new(test_config(), 1);
        pool.retain("127.0.0.1:1");
        pool.release("127.0.0.1:1");
        pool.release("127.0.0.1:1");
    }

    #[tokio::test]
    async fn selection_with_nothing_connected() {
        let mut pool = SharedBackendPool::new(test_config(), 3);
        let s = pool.retain("127.0.0.1:1");

        // no connected worker and no must: nothing to return
        assert!(s.backend_conn(0, 7, false).is_none());

        // must falls back to the first worker of the database
        let bc = s.backend_conn(1, 7, true).expect("must yields a worker");
        assert_eq!(bc.database(), 1);
        assert!(!bc.is_connected());
    }

    #[tokio::test]
    async fn single_fanout_respects_must() {
        let mut pool = SharedBackendPool::new(test_config(), 1);
        let s = pool.retain("127.0.0.1:1");

        assert!(s.backend_conn(0, 0, false).is_none());
        assert!(s.backend_conn(0, 0, true).is_some());
    }

    #[tokio::test]
    async fn parallel_zero_is_clamped() {
        let mut pool = SharedBackendPool::new(test_config(), 0);
        let s = pool.retain("127.0.0.1:1");
        assert!(s.backend_conn(0, 0, true).is_some());
    }
}
