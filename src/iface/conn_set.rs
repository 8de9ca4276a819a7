use core::fmt;
use managed::ManagedSlice;

use crate::conn::Connection;

/// An opaque handle to a connection owned by an [Interface].
///
/// Handles are small copyable indices; a handle becomes invalid once the
/// connection is released, and the slot may later be reused. Hosts that
/// keep handles across releases should pair them with
/// [conn_id](crate::iface::Interface::conn_id).
///
/// [Interface]: crate::iface::Interface
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(usize);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An item of a [ConnSet].
#[derive(Debug)]
pub(crate) struct ConnStorage {
    inner: Option<Connection>,
}

/// The set of connections owned by an interface.
///
/// The storage is a [ManagedSlice]: owned and growable in hosted use,
/// borrowed and fixed where the host preallocates.
#[derive(Debug)]
pub(crate) struct ConnSet<'a> {
    conns: ManagedSlice<'a, ConnStorage>,
}

impl<'a> ConnSet<'a> {
    pub(crate) fn new<C>(conns: C) -> ConnSet<'a>
    where
        C: Into<ManagedSlice<'a, ConnStorage>>,
    {
        ConnSet {
            conns: conns.into(),
        }
    }

    /// Place a connection into the set and return its handle.
    ///
    /// # Panics
    /// This function panics if the set is fixed-size and full.
    pub(crate) fn add(&mut self, conn: Connection) -> ConnHandle {
        fn put(index: usize, slot: &mut ConnStorage, conn: Connection) -> ConnHandle {
            slot.inner = Some(conn);
            ConnHandle(index)
        }

        for (index, slot) in self.conns.iter_mut().enumerate() {
            if slot.inner.is_none() {
                return put(index, slot, conn);
            }
        }

        match &mut self.conns {
            ManagedSlice::Borrowed(_) => panic!("adding a connection to a full ConnSet"),
            ManagedSlice::Owned(conns) => {
                conns.push(ConnStorage { inner: Some(conn) });
                let index = conns.len() - 1;
                ConnHandle(index)
            }
        }
    }

    pub(crate) fn get(&self, handle: ConnHandle) -> Option<&Connection> {
        self.conns.get(handle.0).and_then(|slot| slot.inner.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        self.conns
            .get_mut(handle.0)
            .and_then(|slot| slot.inner.as_mut())
    }

    /// Remove a connection from the set, returning it.
    pub(crate) fn remove(&mut self, handle: ConnHandle) -> Option<Connection> {
        self.conns
            .get_mut(handle.0)
            .and_then(|slot| slot.inner.take())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ConnHandle, &Connection)> {
        self.conns
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.inner.as_ref().map(|conn| (ConnHandle(index), conn)))
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = ConnHandle> + '_ {
        self.iter().map(|(handle, _)| handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::{Config, InterfaceInner};

    fn conn(inner: &mut InterfaceInner) -> Connection {
        Connection::new(inner, 1, 2, std::net::SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    #[test]
    fn test_add_get_remove_reuses_slots() {
        let mut inner = InterfaceInner::new(Config::default());
        let mut set = ConnSet::new(vec![]);

        let a = set.add(conn(&mut inner));
        let b = set.add(conn(&mut inner));
        assert_ne!(a, b);
        assert!(set.get(a).is_some());

        let removed = set.remove(a).unwrap();
        assert!(set.get(a).is_none());
        // The freed slot is reused before the set grows.
        let c = set.add(conn(&mut inner));
        assert_eq!(a, c);
        assert_ne!(removed.id, set.get(c).unwrap().id);
        assert_eq!(set.iter().count(), 2);
    }
}
