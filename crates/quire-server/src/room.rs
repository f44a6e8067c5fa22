//! Live documents shared by connections
//!
//! All connections to one document name share a single in-memory Automerge
//! document (a room). Each connection keeps its own sync state; when one
//! connection's message changes the document, the others are told to send
//! their peer the new changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use automerge::sync::{self, SyncDoc};
use automerge::AutoCommit;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, PersistenceResult};
use crate::name::DocumentName;
use crate::persistence::{DocumentPersistence, UpdateLog};

/// Identifies one connection within the server
pub type PeerId = u64;

struct RoomState {
    doc: AutoCommit,
    log: UpdateLog,
    peers: usize,
}

/// One live document and the connections attached to it
pub struct Room {
    name: DocumentName,
    state: Mutex<RoomState>,
    changes: broadcast::Sender<PeerId>,
}

impl Room {
    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Notifications carrying the peer whose message changed the document
    pub fn subscribe(&self) -> broadcast::Receiver<PeerId> {
        self.changes.subscribe()
    }

    /// Next sync message for a peer, if it is missing anything
    pub async fn generate(&self, peer_state: &mut sync::State) -> Option<sync::Message> {
        let mut state = self.state.lock().await;
        let message = state.doc.sync().generate_sync_message(peer_state);
        message
    }

    /// Apply a peer's sync message and produce the reply
    ///
    /// New changes are appended to the project store before the other peers
    /// are notified.
    pub async fn receive(
        &self,
        from: PeerId,
        peer_state: &mut sync::State,
        message: sync::Message,
    ) -> PersistenceResult<Option<sync::Message>> {
        let mut state = self.state.lock().await;
        let RoomState { doc, log, .. } = &mut *state;

        doc.sync()
            .receive_sync_message(peer_state, message)
            .map_err(|source| PersistenceError::Document {
                document: self.name.to_string(),
                source,
            })?;

        if log.persist(doc)? {
            // No receivers is fine
            let _ = self.changes.send(from);
        }
        let reply = doc.sync().generate_sync_message(peer_state);
        Ok(reply)
    }

    /// Read from the live document
    pub async fn with_doc<R>(&self, f: impl FnOnce(&AutoCommit) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.doc)
    }
}

/// A room that may still be binding
///
/// The map lock is held only to find or insert a slot. Binding reads the
/// project store, so it runs on the blocking pool after the lock is released,
/// and concurrent joiners of the same name wait on the slot instead.
type Slot = Arc<OnceCell<Arc<Room>>>;

/// Open rooms by document name
pub struct Rooms {
    persistence: Arc<DocumentPersistence>,
    rooms: Mutex<HashMap<DocumentName, Slot>>,
    next_peer: AtomicU64,
}

impl Rooms {
    pub fn new(persistence: Arc<DocumentPersistence>) -> Self {
        Self {
            persistence,
            rooms: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    pub fn persistence(&self) -> &DocumentPersistence {
        &self.persistence
    }

    /// Attach a connection to the room for `name`, binding it on first use
    pub async fn join(&self, name: &DocumentName) -> PersistenceResult<(Arc<Room>, PeerId)> {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);

        loop {
            let slot = self.rooms.lock().await.entry(name.clone()).or_default().clone();

            let room = match slot.get_or_try_init(|| self.open(name)).await {
                Ok(room) => room.clone(),
                Err(e) => {
                    let mut rooms = self.rooms.lock().await;
                    if rooms
                        .get(name)
                        .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                    {
                        rooms.remove(name);
                    }
                    return Err(e);
                }
            };

            // The room may have closed between binding and here
            let rooms = self.rooms.lock().await;
            if rooms.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                let mut state = room.state.lock().await;
                state.peers += 1;
                debug!(document = %name, peer, peers = state.peers, "Joined room");
                drop(state);
                return Ok((room, peer));
            }
            debug!(document = %name, peer, "Room closed while joining, retrying");
        }
    }

    async fn open(&self, name: &DocumentName) -> PersistenceResult<Arc<Room>> {
        let persistence = self.persistence.clone();
        let bind_name = name.clone();
        let (doc, log) = tokio::task::spawn_blocking(move || {
            let mut doc = AutoCommit::new();
            let log = persistence.bind(&bind_name, &mut doc)?;
            Ok::<_, PersistenceError>((doc, log))
        })
        .await??;

        let (changes, _) = broadcast::channel(64);
        info!(document = %name, "Opened room");
        Ok(Arc::new(Room {
            name: name.clone(),
            state: Mutex::new(RoomState { doc, log, peers: 0 }),
            changes,
        }))
    }

    /// Detach a connection; the last one out writes a snapshot and closes the room
    ///
    /// When no other room of the same project is open, the project store is
    /// released as well.
    pub async fn leave(&self, room: &Arc<Room>) {
        {
            let mut state = room.state.lock().await;
            state.peers = state.peers.saturating_sub(1);
            if state.peers > 0 {
                return;
            }

            let RoomState { doc, log, .. } = &mut *state;
            if let Err(e) = self.persistence.write_state(log, doc) {
                warn!(document = %room.name, error = %e, "Failed to write document snapshot");
            }
        }

        let mut rooms = self.rooms.lock().await;
        // Someone joined while the snapshot was written
        if room.state.lock().await.peers > 0 {
            return;
        }
        let current = rooms
            .get(&room.name)
            .and_then(|slot| slot.get())
            .is_some_and(|open| Arc::ptr_eq(open, room));
        if !current {
            return;
        }

        rooms.remove(&room.name);
        info!(document = %room.name, "Closed room");

        let project = room.name.project();
        if !rooms.keys().any(|name| name.project() == project) {
            self.persistence.stores().release(&room.name);
        }
    }

    /// Number of open rooms
    pub async fn len(&self) -> usize {
        self.rooms
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
