//! Concurrent route table
//!
//! Maps route ids to the inbound queue of the forwarder bridging that route.
//! The session's reader delivers through the read path; route creation and
//! teardown take the write path. No I/O happens while the lock is held:
//! delivery is a push onto an unbounded channel.
//!
//! Ids that have been removed are remembered as retired, so a late frame for
//! a finished route is distinguishable from a frame for a route nobody ever
//! announced, and a retired id cannot be inserted again. Only the most recent
//! [`RETIRED_CAPACITY`] ids are kept; older ones are forgotten in retirement
//! order.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ztmesh_proto::{RouteId, RouteProtocol};

/// Retired ids remembered per table
pub const RETIRED_CAPACITY: usize = 4096;

/// Which side initiated the route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Created by a received RouteSetup (exposer role)
    Inbound,
    /// Originated locally (connector role)
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Established,
    HalfClosed,
    Closed,
}

/// Static description of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub direction: Direction,
    pub target_port: u16,
    pub protocol: RouteProtocol,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("Route {0} already exists")]
    DuplicateRoute(RouteId),

    #[error("Route {0} was already closed in this session")]
    RetiredRoute(RouteId),
}

/// Result of handing an inbound payload to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No route with this id was ever registered
    Unknown,
    /// The route existed but no longer accepts data
    Retired,
}

#[derive(Debug)]
struct RouteEntry {
    info: RouteInfo,
    lifecycle: Lifecycle,
    inbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Retired {
    ids: HashSet<RouteId>,
    order: VecDeque<RouteId>,
}

impl Retired {
    fn contains(&self, route_id: &str) -> bool {
        self.ids.contains(route_id)
    }

    fn insert(&mut self, route_id: RouteId, capacity: usize) {
        if !self.ids.insert(route_id.clone()) {
            return;
        }
        self.order.push_back(route_id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TableInner {
    routes: HashMap<RouteId, RouteEntry>,
    retired: Retired,
}

#[derive(Debug)]
pub struct RouteTable {
    inner: RwLock<TableInner>,
    retired_capacity: usize,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_retired_capacity(RETIRED_CAPACITY)
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retired_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
            retired_capacity: capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new route in the `Pending` state.
    ///
    /// Returns the receiving end of the route's inbound queue; payloads
    /// delivered before a forwarder is attached are buffered there.
    pub fn insert(
        &self,
        route_id: impl Into<RouteId>,
        info: RouteInfo,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, RouteTableError> {
        let route_id = route_id.into();
        let mut inner = self.write();

        if inner.retired.contains(&route_id) {
            return Err(RouteTableError::RetiredRoute(route_id));
        }
        if inner.routes.contains_key(&route_id) {
            return Err(RouteTableError::DuplicateRoute(route_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.routes.insert(
            route_id,
            RouteEntry {
                info,
                lifecycle: Lifecycle::Pending,
                inbound: tx,
                cancel,
            },
        );
        Ok(rx)
    }

    /// Remove and retire a route. Returns false if it was not active.
    pub fn remove(&self, route_id: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.routes.remove(route_id).is_some();
        if removed {
            inner
                .retired
                .insert(route_id.to_string(), self.retired_capacity);
        }
        removed
    }

    /// Cancel a route's forwarder without removing it
    pub fn cancel(&self, route_id: &str) -> bool {
        match self.read().routes.get(route_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn deliver(&self, route_id: &str, payload: Bytes) -> Delivery {
        let inner = self.read();
        match inner.routes.get(route_id) {
            Some(entry) => match entry.inbound.send(payload) {
                Ok(()) => Delivery::Delivered,
                // Forwarder already finished its relay-to-local direction
                Err(_) => Delivery::Retired,
            },
            None if inner.retired.contains(route_id) => Delivery::Retired,
            None => Delivery::Unknown,
        }
    }

    pub fn set_lifecycle(&self, route_id: &str, lifecycle: Lifecycle) -> bool {
        match self.write().routes.get_mut(route_id) {
            Some(entry) => {
                entry.lifecycle = lifecycle;
                true
            }
            None => false,
        }
    }

    pub fn lifecycle(&self, route_id: &str) -> Option<Lifecycle> {
        let inner = self.read();
        match inner.routes.get(route_id) {
            Some(entry) => Some(entry.lifecycle),
            None if inner.retired.contains(route_id) => Some(Lifecycle::Closed),
            None => None,
        }
    }

    pub fn info(&self, route_id: &str) -> Option<RouteInfo> {
        self.read().routes.get(route_id).map(|e| e.info.clone())
    }

    pub fn len(&self) -> usize {
        self.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().routes.is_empty()
    }

    pub fn ids(&self) -> Vec<RouteId> {
        self.read().routes.keys().cloned().collect()
    }

    /// Retire every active route, returning their cancellation tokens
    pub fn drain(&self) -> Vec<(RouteId, CancellationToken)> {
        let mut inner = self.write();
        let drained: Vec<(RouteId, CancellationToken)> = inner
            .routes
            .drain()
            .map(|(id, entry)| (id, entry.cancel))
            .collect();
        for (id, _) in &drained {
            inner.retired.insert(id.clone(), self.retired_capacity);
        }
        drained
    }
}
