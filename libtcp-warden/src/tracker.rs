use crate::connection::Connection;
use crate::flow::TcpFlow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to a tracked connection.
///
/// Both orientations of a flow alias the same connection; mutation only
/// happens on the single packet-dispatch path, so the interior
/// mutability is never contended.
pub type ConnectionRef = Rc<RefCell<Connection>>;

/// Maps bidirectional flow identity to connections.
///
/// Two maps, one per orientation: `forward` holds the key a connection
/// was inserted under, `reverse` the opposite orientation. Both point
/// to the same connection.
#[derive(Default)]
pub struct ConnectionTracker {
    forward: HashMap<TcpFlow, ConnectionRef>,
    reverse: HashMap<TcpFlow, ConnectionRef>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// True if `key`, in either orientation, belongs to a tracked
    /// connection
    pub fn has(&self, key: &TcpFlow) -> bool {
        self.forward.contains_key(key) || self.reverse.contains_key(key)
    }

    /// Look up the connection for `key` in either orientation
    pub fn get(&self, key: &TcpFlow) -> Option<ConnectionRef> {
        self.forward
            .get(key)
            .or_else(|| self.reverse.get(key))
            .cloned()
    }

    /// Register `conn` under `key` and its reverse
    pub fn put(&mut self, key: TcpFlow, conn: ConnectionRef) {
        self.reverse.insert(key.reverse(), conn.clone());
        self.forward.insert(key, conn);
    }

    /// Drop the connection registered under `key` (both orientations)
    pub fn remove(&mut self, key: &TcpFlow) {
        let rev = key.reverse();
        self.forward.remove(key);
        self.forward.remove(&rev);
        self.reverse.remove(key);
        self.reverse.remove(&rev);
    }

    /// Close every tracked connection and clear the maps
    pub fn close_all(&mut self) {
        for (flow, conn) in self.forward.iter() {
            debug!("closing connection {}", flow);
            conn.borrow_mut().close();
        }
        self.forward.clear();
        self.reverse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::TestReporter;
    use std::net::{IpAddr, Ipv4Addr};

    fn flow() -> TcpFlow {
        TcpFlow::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            1,
            IpAddr::V4(Ipv4Addr::new(2, 3, 4, 5)),
            2,
        )
    }

    fn connection() -> ConnectionRef {
        let reports = Rc::new(RefCell::new(Vec::new()));
        Rc::new(RefCell::new(Connection::new(
            Box::new(TestReporter::new(reports)),
            None,
        )))
    }

    #[test]
    fn tracker_routes_both_orientations() {
        let mut tracker = ConnectionTracker::new();
        let f = flow();
        assert!(!tracker.has(&f));
        tracker.put(f, connection());
        assert!(tracker.has(&f));
        assert!(tracker.has(&f.reverse()));
        let direct = tracker.get(&f).expect("direct lookup");
        let reversed = tracker.get(&f.reverse()).expect("reverse lookup");
        assert!(Rc::ptr_eq(&direct, &reversed));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn tracker_remove_clears_both_orientations() {
        let mut tracker = ConnectionTracker::new();
        let f = flow();
        tracker.put(f, connection());
        tracker.remove(&f.reverse());
        assert!(!tracker.has(&f));
        assert!(!tracker.has(&f.reverse()));
        assert!(tracker.is_empty());
    }
}
