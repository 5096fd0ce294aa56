use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::host::PacketSink;
use super::slots::Slots;
use super::transport::PeerId;
use crate::error::NetError;

/// Locally assigned id of a registered [`PacketSink`]. Remote sides name
/// it in their connect request to pick the service they talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{:08X}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct InboundConnection {
    pub peer: PeerId,
    pub addr: SocketAddr,
    pub name: String,
    pub hostname: String,
    pub service: HandlerId,
    pub slot: usize,
}

#[derive(Debug)]
pub struct InboundConnections {
    slots: Slots<InboundConnection>,
    by_peer: HashMap<PeerId, usize>,
}

impl InboundConnections {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::with_capacity(capacity),
            by_peer: HashMap::with_capacity(capacity),
        }
    }

    pub fn add(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        service: HandlerId,
    ) -> Result<&InboundConnection, NetError> {
        if let Some(&slot) = self.by_peer.get(&peer) {
            self.slots.remove(slot);
            self.by_peer.remove(&peer);
        }

        let connection = InboundConnection {
            peer,
            addr,
            name: String::new(),
            hostname: addr.ip().to_string(),
            service,
            slot: 0,
        };
        let slot = self
            .slots
            .insert(connection)
            .map_err(|_| NetError::RegistryFull(self.slots.capacity()))?;
        self.by_peer.insert(peer, slot);

        let connection = self
            .slots
            .get_mut(slot)
            .ok_or(NetError::UnknownPeer(peer))?;
        connection.slot = slot;
        Ok(connection)
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<InboundConnection> {
        let slot = self.by_peer.remove(&peer)?;
        self.slots.remove(slot)
    }

    pub fn get(&self, peer: PeerId) -> Option<&InboundConnection> {
        self.slots.get(*self.by_peer.get(&peer)?)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut InboundConnection> {
        self.slots.get_mut(*self.by_peer.get(&peer)?)
    }

    pub fn set_name(&mut self, peer: PeerId, name: &str) -> bool {
        match self.get_mut(peer) {
            Some(connection) => {
                connection.name = name.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &InboundConnection> {
        self.slots.iter().map(|(_, c)| c)
    }

    /// Drops every connection routed to `service`.
    pub fn remove_service(&mut self, service: HandlerId) -> Vec<InboundConnection> {
        let removed = self.slots.retain(|c| c.service != service);
        for connection in &removed {
            self.by_peer.remove(&connection.peer);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_peer.clear();
    }
}

#[derive(Debug, Clone)]
pub struct OutboundConnection {
    pub owner: HandlerId,
    pub peer: PeerId,
    pub references: u32,
}

/// Connections this side opened, keyed by the handler that opened them.
#[derive(Debug)]
pub struct OutboundConnections {
    slots: Slots<OutboundConnection>,
}

impl OutboundConnections {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::with_capacity(capacity),
        }
    }

    /// Adds a reference to `(owner, peer)`, creating the entry if needed.
    pub fn add(&mut self, owner: HandlerId, peer: PeerId) -> Result<(), NetError> {
        if let Some(index) = self.slots.position(|c| c.owner == owner && c.peer == peer) {
            if let Some(connection) = self.slots.get_mut(index) {
                connection.references += 1;
            }
            return Ok(());
        }
        self.slots
            .insert(OutboundConnection {
                owner,
                peer,
                references: 1,
            })
            .map(|_| ())
            .map_err(|_| NetError::RegistryFull(self.slots.capacity()))
    }

    /// Drops one reference. Returns true when no entry for `peer` is left.
    pub fn release(&mut self, owner: HandlerId, peer: PeerId) -> bool {
        if let Some(index) = self.slots.position(|c| c.owner == owner && c.peer == peer) {
            let remove = match self.slots.get_mut(index) {
                Some(connection) => {
                    connection.references = connection.references.saturating_sub(1);
                    connection.references == 0
                }
                None => false,
            };
            if remove {
                self.slots.remove(index);
            }
        }
        !self.contains_peer(peer)
    }

    /// Forgets the peer for every owner.
    pub fn remove_peer(&mut self, peer: PeerId) -> Vec<OutboundConnection> {
        self.slots.retain(|c| c.peer != peer)
    }

    /// Forgets everything `owner` opened. Returns the peers nobody else
    /// holds, which the caller should disconnect.
    pub fn remove_owner(&mut self, owner: HandlerId) -> Vec<PeerId> {
        let removed = self.slots.retain(|c| c.owner != owner);
        let mut orphaned: Vec<PeerId> = removed
            .into_iter()
            .map(|c| c.peer)
            .filter(|&peer| !self.contains_peer(peer))
            .collect();
        orphaned.sort();
        orphaned.dedup();
        orphaned
    }

    /// Removes entries whose peer is no longer alive.
    pub fn prune(&mut self, alive: impl Fn(PeerId) -> bool) -> Vec<OutboundConnection> {
        self.slots.retain(|c| alive(c.peer))
    }

    pub fn owners_of(&self, peer: PeerId) -> Vec<HandlerId> {
        self.slots
            .iter()
            .filter(|(_, c)| c.peer == peer)
            .map(|(_, c)| c.owner)
            .collect()
    }

    pub fn contains_peer(&self, peer: PeerId) -> bool {
        self.slots.iter().any(|(_, c)| c.peer == peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundConnection> {
        self.slots.iter().map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Maps handler ids to the sinks that process their packets.
pub struct HandlerRegistry {
    handlers: HashMap<HandlerId, Arc<dyn PacketSink>>,
    capacity: usize,
    guid: u32,
}

impl HandlerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            handlers: HashMap::with_capacity(capacity),
            capacity,
            guid: 0x0123_4567,
        }
    }

    /// Keeps `requested` when it is free, otherwise mints a fresh id.
    pub fn register(
        &mut self,
        sink: Arc<dyn PacketSink>,
        requested: Option<HandlerId>,
    ) -> Result<HandlerId, NetError> {
        if self.handlers.len() >= self.capacity {
            return Err(NetError::RegistryFull(self.capacity));
        }
        let id = match requested {
            Some(id) if id.0 != 0 && !self.handlers.contains_key(&id) => id,
            _ => self.mint(),
        };
        self.handlers.insert(id, sink);
        Ok(id)
    }

    pub fn unregister(&mut self, id: HandlerId) -> Option<Arc<dyn PacketSink>> {
        self.handlers.remove(&id)
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn PacketSink>> {
        self.handlers.get(&id).cloned()
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    fn mint(&mut self) -> HandlerId {
        loop {
            self.guid = self.guid.wrapping_mul(0x0019_660D).wrapping_add(0x3C6E_F35F);
            let id = HandlerId(self.guid);
            if id.0 != 0 && !self.handlers.contains_key(&id) {
                return id;
            }
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("ids", &self.ids())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{IncomingPacket, NetHost};

    struct NullSink;

    impl PacketSink for NullSink {
        fn handle_packet(&self, _host: &NetHost, _packet: &mut IncomingPacket<'_>) -> bool {
            true
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_inbound_rejects_when_full() {
        let mut inbound = InboundConnections::new(2);
        inbound.add(PeerId(1), addr(1000), HandlerId(5)).unwrap();
        inbound.add(PeerId(2), addr(1001), HandlerId(5)).unwrap();

        let err = inbound.add(PeerId(3), addr(1002), HandlerId(5)).unwrap_err();
        assert!(matches!(err, NetError::RegistryFull(2)));

        assert!(inbound.remove(PeerId(1)).is_some());
        let connection = inbound.add(PeerId(3), addr(1002), HandlerId(5)).unwrap();
        assert_eq!(connection.slot, 0);
        assert_eq!(connection.hostname, "127.0.0.1");
    }

    #[test]
    fn test_inbound_names() {
        let mut inbound = InboundConnections::new(4);
        inbound.add(PeerId(1), addr(1000), HandlerId(5)).unwrap();
        assert!(inbound.set_name(PeerId(1), "alice"));
        assert!(!inbound.set_name(PeerId(9), "bob"));
        assert_eq!(inbound.get(PeerId(1)).unwrap().name, "alice");
    }

    #[test]
    fn test_outbound_reference_counting() {
        let mut outbound = OutboundConnections::new(4);
        let owner = HandlerId(7);
        outbound.add(owner, PeerId(1)).unwrap();
        outbound.add(owner, PeerId(1)).unwrap();
        assert_eq!(outbound.len(), 1);

        assert!(!outbound.release(owner, PeerId(1)));
        assert!(outbound.release(owner, PeerId(1)));
        assert!(outbound.is_empty());
    }

    #[test]
    fn test_outbound_remove_owner_keeps_shared_peers() {
        let mut outbound = OutboundConnections::new(4);
        outbound.add(HandlerId(1), PeerId(10)).unwrap();
        outbound.add(HandlerId(1), PeerId(11)).unwrap();
        outbound.add(HandlerId(2), PeerId(11)).unwrap();

        assert_eq!(outbound.remove_owner(HandlerId(1)), vec![PeerId(10)]);
        assert_eq!(outbound.owners_of(PeerId(11)), vec![HandlerId(2)]);
    }

    #[test]
    fn test_outbound_prune() {
        let mut outbound = OutboundConnections::new(4);
        outbound.add(HandlerId(1), PeerId(10)).unwrap();
        outbound.add(HandlerId(1), PeerId(11)).unwrap();
        let pruned = outbound.prune(|peer| peer == PeerId(11));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].peer, PeerId(10));
    }

    #[test]
    fn test_register_keeps_requested_id() {
        let mut registry = HandlerRegistry::new(4);
        let first = registry.register(Arc::new(NullSink), Some(HandlerId(42))).unwrap();
        assert_eq!(first, HandlerId(42));

        let second = registry.register(Arc::new(NullSink), Some(HandlerId(42))).unwrap();
        assert_ne!(second, HandlerId(42));

        registry.unregister(first);
        let third = registry.register(Arc::new(NullSink), Some(HandlerId(42))).unwrap();
        assert_eq!(third, HandlerId(42));
    }

    #[test]
    fn test_register_when_full() {
        let mut registry = HandlerRegistry::new(1);
        registry.register(Arc::new(NullSink), None).unwrap();
        assert!(registry.register(Arc::new(NullSink), None).is_err());
    }
}
