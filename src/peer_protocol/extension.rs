//! BEP 10 extension protocol (LTEP).
//!
//! each side announces `{"m": {name: id}}` in an extension handshake. ids are chosen by the
//! receiver: we tell the peer which id to use when messaging *us*, and use the ids from its
//! handshake when messaging *it*.
use super::PeerError;
use crate::bencode::{self, Dict, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::bytes::Bytes;

pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// a protocol extension that can be negotiated over LTEP.
pub trait ExtensionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// handles one message the peer sent to our id for this extension. a returned payload is
    /// sent back under the peer's id for the same extension.
    fn on_message(&self, peer: SocketAddr, payload: &[u8]) -> Result<Option<Bytes>, PeerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("every extension id is taken, at most {} extensions can be registered", u8::MAX)]
pub struct RegistryFull;

/// the extensions we support, with the ids we assigned them. built once per torrent.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    handlers: Vec<Arc<dyn ExtensionHandler>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// registers a handler and returns the id peers must use to reach it.
    pub fn register(&mut self, handler: Arc<dyn ExtensionHandler>) -> Result<u8, RegistryFull> {
        // id 0 is the handshake itself.
        let id = u8::try_from(self.handlers.len() + 1).map_err(|_| RegistryFull)?;
        self.handlers.push(handler);
        Ok(id)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn local_ids(&self) -> impl Iterator<Item = (u8, &Arc<dyn ExtensionHandler>)> {
        self.handlers
            .iter()
            .enumerate()
            .map(|(i, handler)| (i as u8 + 1, handler))
    }

    /// bencoded handshake body announcing our extensions.
    pub fn handshake_payload(&self) -> Bytes {
        let m: Dict = self
            .local_ids()
            .map(|(id, handler)| {
                (
                    Bytes::copy_from_slice(handler.name().as_bytes()),
                    Value::Integer(id as i64),
                )
            })
            .collect();

        let mut root = Dict::new();
        root.insert(Bytes::from_static(b"m"), Value::Dict(m));
        Bytes::from(bencode::encode(&Value::Dict(root)))
    }

    /// resolves a peer's handshake into the table used for the rest of the connection.
    pub fn negotiate(&self, payload: &[u8]) -> Result<ExtensionTable, PeerError> {
        let remote = parse_handshake(payload)?;

        let handlers = self
            .local_ids()
            .filter(|(_, handler)| remote.contains_key(handler.name()))
            .map(|(id, handler)| (id, handler.clone()))
            .collect();

        Ok(ExtensionTable { remote, handlers })
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name().to_string()))
            .finish()
    }
}

fn parse_handshake(payload: &[u8]) -> Result<BTreeMap<String, u8>, PeerError> {
    let value = bencode::decode(payload)?;
    let m = value
        .get(b"m")
        .and_then(Value::as_dict)
        .ok_or_else(|| PeerError::protocol("extension handshake without an 'm' dictionary"))?;

    // an id of 0 means the peer disabled that extension.
    Ok(m.iter()
        .filter_map(|(name, id)| {
            let name = std::str::from_utf8(name).ok()?;
            let id = u8::try_from(id.as_integer()?).ok().filter(|&id| id != 0)?;
            Some((name.to_string(), id))
        })
        .collect())
}

/// extensions negotiated with one peer.
#[derive(Clone)]
pub struct ExtensionTable {
    remote: BTreeMap<String, u8>,
    handlers: BTreeMap<u8, Arc<dyn ExtensionHandler>>,
}

impl ExtensionTable {
    /// id the peer wants us to use when sending it `name` messages.
    pub fn remote_id(&self, name: &str) -> Option<u8> {
        self.remote.get(name).copied()
    }

    /// dispatches a message the peer addressed to one of our ids. `None` if the id isn't one we
    /// negotiated, otherwise the handler's reply (if any) paired with the peer's id for it.
    pub fn dispatch(
        &self,
        peer: SocketAddr,
        local_id: u8,
        payload: &[u8],
    ) -> Option<Result<Option<(u8, Bytes)>, PeerError>> {
        let handler = self.handlers.get(&local_id)?;

        let reply = handler.on_message(peer, payload).map(|reply| {
            reply.and_then(|body| Some((self.remote_id(handler.name())?, body)))
        });
        Some(reply)
    }
}

impl std::fmt::Debug for ExtensionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionTable")
            .field("remote", &self.remote)
            .field("local", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    impl ExtensionHandler for Echo {
        fn name(&self) -> &str {
            "sw_echo"
        }

        fn on_message(&self, _: SocketAddr, payload: &[u8]) -> Result<Option<Bytes>, PeerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Bytes::copy_from_slice(payload)))
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_handshake_payload() {
        let mut registry = ExtensionRegistry::new();
        assert_eq!(registry.register(Arc::new(Echo::default())), Ok(1));

        assert_eq!(&registry.handshake_payload()[..], b"d1:md7:sw_echoi1eee");
    }

    #[test]
    fn test_negotiate_and_dispatch() {
        let echo = Arc::new(Echo::default());
        let mut registry = ExtensionRegistry::new();
        let local_id = registry.register(echo.clone()).unwrap();

        let table = registry
            .negotiate(b"d1:md7:sw_echoi3e11:ut_metadatai2eee")
            .unwrap();
        assert_eq!(table.remote_id("ut_metadata"), Some(2));

        let reply = table.dispatch(addr(), local_id, b"ping").unwrap().unwrap();
        assert_eq!(reply, Some((3, Bytes::from_static(b"ping"))));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        assert!(table.dispatch(addr(), 9, b"ping").is_none());
    }

    #[test]
    fn test_disabled_extension_is_not_dispatched() {
        let mut registry = ExtensionRegistry::new();
        let local_id = registry.register(Arc::new(Echo::default())).unwrap();

        let table = registry.negotiate(b"d1:md7:sw_echoi0eee").unwrap();
        assert_eq!(table.remote_id("sw_echo"), None);
        assert!(table.dispatch(addr(), local_id, b"ping").is_none());
    }

    #[test]
    fn test_registry_runs_out_of_ids() {
        let echo = Arc::new(Echo::default());
        let mut registry = ExtensionRegistry::new();
        for expected in 1..=u8::MAX {
            assert_eq!(registry.register(echo.clone()), Ok(expected));
        }

        assert_eq!(registry.register(echo), Err(RegistryFull));
    }

    #[test]
    fn test_malformed_handshake() {
        let registry = ExtensionRegistry::new();
        assert!(matches!(registry.negotiate(b"i1e"), Err(PeerError::Protocol(_))));
        assert!(matches!(registry.negotiate(b"d1:m"), Err(PeerError::Codec(_))));
    }
}
