use cantaloupe_proto::ServerAddr;
use rand::seq::SliceRandom;

/// The ordered list of servers the client may connect to
///
/// Position 0 is the current target. Explicit entries come from the
/// caller; implicit entries are discovered through `INFO` updates and
/// may be evicted when the server stops announcing them.
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
    /// `None` means unbounded retries
    max_reconnects: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerEntry {
    pub(crate) addr: ServerAddr,
    explicit: bool,
    reconnects: u32,
}

impl ServerPool {
    pub(crate) fn new(addrs: Vec<ServerAddr>, randomize: bool, max_reconnects: Option<u32>) -> Self {
        let mut entries = addrs
            .into_iter()
            .map(|addr| ServerEntry {
                addr,
                explicit: true,
                reconnects: 0,
            })
            .collect::<Vec<_>>();

        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }

        Self {
            entries,
            max_reconnects,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The address the next connection attempt should target
    pub(crate) fn current(&self) -> Option<&ServerAddr> {
        self.entries.first().map(|entry| &entry.addr)
    }

    /// Rotate the current entry to the tail without counting a failure
    ///
    /// Used by the initial connect walk, which visits every server
    /// exactly once.
    pub(crate) fn rotate(&mut self) {
        if self.entries.len() > 1 {
            let entry = self.entries.remove(0);
            self.entries.push(entry);
        }
    }

    /// Record a failed reconnect attempt against the current entry
    ///
    /// The entry is rotated to the tail, or removed once its attempt
    /// counter reaches the configured bound.
    pub(crate) fn mark_failure(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let mut entry = self.entries.remove(0);
        entry.reconnects += 1;
        match self.max_reconnects {
            Some(max) if entry.reconnects >= max => {
                tracing::debug!(addr = %entry.addr, "server exhausted its reconnect attempts");
            }
            _ => self.entries.push(entry),
        }
    }

    /// Drop the current entry, never to be retried
    pub(crate) fn remove_current(&mut self) {
        if !self.entries.is_empty() {
            self.entries.remove(0);
        }
    }

    /// Reset the current entry's attempt counter after a successful connect
    pub(crate) fn reset_current(&mut self) {
        if let Some(entry) = self.entries.first_mut() {
            entry.reconnects = 0;
        }
    }

    /// Fold the URLs announced by an `INFO` update into the pool
    ///
    /// Unknown addresses are appended as implicit entries. Implicit
    /// entries the server no longer announces are evicted, except the
    /// current one.
    pub(crate) fn merge_discovered(&mut self, announced: &[ServerAddr]) {
        for addr in announced {
            let known = self
                .entries
                .iter()
                .any(|entry| entry.addr.is_same_endpoint(addr));
            if !known {
                self.entries.push(ServerEntry {
                    addr: addr.clone(),
                    explicit: false,
                    reconnects: 0,
                });
            }
        }

        let mut index = 0;
        self.entries.retain(|entry| {
            let keep = entry.explicit
                || index == 0
                || announced
                    .iter()
                    .any(|addr| addr.is_same_endpoint(&entry.addr));
            index += 1;
            keep
        });
    }

    #[cfg(test)]
    fn addrs(&self) -> Vec<&ServerAddr> {
        self.entries.iter().map(|entry| &entry.addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use cantaloupe_proto::ServerAddr;

    use super::ServerPool;

    fn addr(url: &str) -> ServerAddr {
        url.parse().unwrap()
    }

    fn pool(urls: &[&str], max_reconnects: Option<u32>) -> ServerPool {
        ServerPool::new(urls.iter().map(|url| addr(url)).collect(), false, max_reconnects)
    }

    #[test]
    fn preserves_order_without_randomization() {
        let pool = pool(&["nats://a", "nats://b", "nats://c"], None);
        assert_eq!(
            pool.addrs(),
            [&addr("nats://a"), &addr("nats://b"), &addr("nats://c")]
        );
    }

    #[test]
    fn shuffle_keeps_every_entry() {
        let urls = (0..32).map(|i| format!("nats://10.0.0.{i}")).collect::<Vec<_>>();
        let pool = ServerPool::new(
            urls.iter().map(|url| url.parse().unwrap()).collect(),
            true,
            None,
        );
        assert_eq!(pool.len(), 32);
        for url in &urls {
            let addr = url.parse::<ServerAddr>().unwrap();
            assert!(pool.addrs().iter().any(|a| **a == addr));
        }
    }

    #[test]
    fn failures_rotate() {
        let mut pool = pool(&["nats://a", "nats://b"], None);
        assert_eq!(pool.current(), Some(&addr("nats://a")));
        pool.mark_failure();
        assert_eq!(pool.current(), Some(&addr("nats://b")));
        pool.mark_failure();
        assert_eq!(pool.current(), Some(&addr("nats://a")));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn bounded_failures_drop_the_server() {
        let mut pool = pool(&["nats://a", "nats://b"], Some(2));
        // a fails twice and is dropped
        pool.mark_failure();
        pool.mark_failure();
        pool.mark_failure();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.current(), Some(&addr("nats://b")));
        // b reaches the bound too
        pool.mark_failure();
        assert!(pool.is_empty());
        assert_eq!(pool.current(), None);
    }

    #[test]
    fn success_resets_the_counter() {
        let mut pool = pool(&["nats://a"], Some(2));
        pool.mark_failure();
        pool.reset_current();
        pool.mark_failure();
        pool.mark_failure();
        assert!(pool.is_empty());
    }

    #[test]
    fn merge_adds_unknown_servers() {
        let mut pool = pool(&["nats://a"], None);
        pool.merge_discovered(&[addr("nats://a"), addr("nats://b:4321")]);
        assert_eq!(pool.addrs(), [&addr("nats://a"), &addr("nats://b:4321")]);
    }

    #[test]
    fn merge_treats_loopback_forms_as_one() {
        let mut pool = pool(&["nats://localhost"], None);
        pool.merge_discovered(&[addr("nats://127.0.0.1"), addr("nats://[::1]")]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn merge_evicts_unannounced_implicit_entries() {
        let mut pool = pool(&["nats://a"], None);
        pool.merge_discovered(&[addr("nats://b"), addr("nats://c")]);
        assert_eq!(pool.len(), 3);

        // c disappears from the announcement, b stays
        pool.merge_discovered(&[addr("nats://b")]);
        assert_eq!(pool.addrs(), [&addr("nats://a"), &addr("nats://b")]);

        // explicit entries are never evicted
        pool.merge_discovered(&[addr("nats://c")]);
        assert!(pool.addrs().contains(&&addr("nats://a")));
    }

    #[test]
    fn merge_never_evicts_the_current_entry() {
        let mut pool = ServerPool::new(Vec::new(), false, None);
        pool.merge_discovered(&[addr("nats://a"), addr("nats://b")]);
        assert_eq!(pool.len(), 2);

        // a is now current and implicit; an empty announcement keeps it
        pool.merge_discovered(&[]);
        assert_eq!(pool.addrs(), [&addr("nats://a")]);
    }
}
