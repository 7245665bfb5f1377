//! Per-page rooms.
//!
//! A room owns the merged CRDT document for one page, fans frames out to
//! every connected participant, tracks ephemeral presence, and persists the
//! merged state with a debounce. The first participant's join loads the
//! last persisted state; the last participant's leave forces an immediate
//! persist, so an empty room never holds unsaved edits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use lattice_core::Result;
use lattice_core::replica::ReplicaStore;
use lattice_core::session::{Debouncer, PageDoc, PresenceState, RelayFrame};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// A broadcast frame tagged with the connection that produced it, so the
/// fan-out can skip echoing frames back to their sender.
pub type TaggedFrame = (u64, RelayFrame);

/// A room hosting all live connections for one page.
pub struct PageRoom {
    page_id: String,
    doc: Arc<PageDoc>,
    broadcast_tx: broadcast::Sender<TaggedFrame>,
    presence: StdRwLock<HashMap<String, PresenceState>>,
    connections: AtomicUsize,
    next_conn_id: AtomicU64,
    persister: Debouncer,
}

fn persist_action(
    doc: Arc<PageDoc>,
    store: Arc<dyn ReplicaStore>,
    page_id: String,
) -> lattice_core::session::DebouncedAction {
    Arc::new(move || {
        let doc = Arc::clone(&doc);
        let store = Arc::clone(&store);
        let page_id = page_id.clone();
        Box::pin(async move {
            let state = doc.encode_state_as_update();
            let version = match store.get_document_version(&page_id).await {
                Ok(v) => v + 1,
                Err(e) => {
                    warn!("failed to read version for {}: {}", page_id, e);
                    1
                }
            };
            match store.save_document_state(&page_id, &state, version).await {
                Ok(()) => debug!("persisted room {} at version {}", page_id, version),
                Err(e) => warn!("failed to persist room {}: {}", page_id, e),
            }
        })
    })
}

impl PageRoom {
    /// Open a room, loading the last persisted document state.
    pub async fn open(
        page_id: &str,
        store: Arc<dyn ReplicaStore>,
        persist_delay: Duration,
    ) -> Result<Self> {
        let doc = Arc::new(PageDoc::new(page_id));
        if let Some(state) = store.get_document_state(page_id).await? {
            doc.apply_update(&state)?;
        }

        let (broadcast_tx, _) = broadcast::channel(1024);
        let persister = Debouncer::new(
            persist_delay,
            persist_action(Arc::clone(&doc), store, page_id.to_string()),
        );

        Ok(Self {
            page_id: page_id.to_string(),
            doc,
            broadcast_tx,
            presence: StdRwLock::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            persister,
        })
    }

    /// Admit a connection: returns its id, the current full document state
    /// for the initial sync, and a receiver for everyone else's frames.
    pub fn join(&self) -> (u64, Vec<u8>, broadcast::Receiver<TaggedFrame>) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        (
            conn_id,
            self.doc.encode_state_as_update(),
            self.broadcast_tx.subscribe(),
        )
    }

    /// Apply a frame from a participant and fan it out to the others.
    pub fn handle_frame(&self, conn_id: u64, frame: RelayFrame) {
        match &frame {
            RelayFrame::Update { update } => {
                if let Err(e) = self.doc.apply_update(update) {
                    warn!("dropping bad update in room {}: {}", self.page_id, e);
                    return;
                }
                self.persister.schedule();
            }
            RelayFrame::Presence { presence } => {
                let mut map = self.presence.write().unwrap();
                map.insert(presence.user_id.clone(), presence.clone());
            }
            RelayFrame::PeerJoined { .. } => {}
            RelayFrame::PeerLeft { user_id } => {
                let mut map = self.presence.write().unwrap();
                map.remove(user_id);
            }
        }
        // No receivers just means the sender is alone in the room.
        let _ = self.broadcast_tx.send((conn_id, frame));
    }

    /// Remove a connection. Presence for the user is dropped and departure
    /// announced; the last leave persists immediately.
    pub async fn leave(&self, conn_id: u64, user_id: &str) {
        {
            let mut map = self.presence.write().unwrap();
            map.remove(user_id);
        }
        let _ = self.broadcast_tx.send((
            conn_id,
            RelayFrame::PeerLeft {
                user_id: user_id.to_string(),
            },
        ));

        let remaining = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.persister.flush().await;
            debug!("room {} empty, state persisted", self.page_id);
        }
    }

    /// Flush any pending persist (used before dropping an idle room).
    pub async fn persist_pending(&self) {
        self.persister.flush().await;
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Current full document state (lag recovery).
    pub fn full_state(&self) -> Vec<u8> {
        self.doc.encode_state_as_update()
    }

    pub fn online_users(&self) -> Vec<PresenceState> {
        let map = self.presence.read().unwrap();
        map.values().cloned().collect()
    }
}

impl std::fmt::Debug for PageRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRoom")
            .field("page_id", &self.page_id)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// All live rooms, keyed by page id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<PageRoom>>>,
    store: Arc<dyn ReplicaStore>,
    persist_delay: Duration,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn ReplicaStore>, persist_delay: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            persist_delay,
        }
    }

    /// Get or create the room for a page.
    pub async fn get_or_create(&self, page_id: &str) -> Result<Arc<PageRoom>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(page_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(page_id) {
            return Ok(room.clone());
        }

        let room = Arc::new(
            PageRoom::open(page_id, Arc::clone(&self.store), self.persist_delay).await?,
        );
        rooms.insert(page_id.to_string(), room.clone());
        info!("created room for page {}", page_id);
        Ok(room)
    }

    /// Drop a room once it has no connections, persisting anything pending.
    pub async fn maybe_remove(&self, page_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(page_id) {
            if room.connection_count() == 0 {
                room.persist_pending().await;
                rooms.remove(page_id);
                info!("removed idle room {}", page_id);
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::replica::MemoryStore;
    use lattice_core::session::PresenceState;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_join_delivers_persisted_state() {
        let store = store();
        let earlier = PageDoc::new("p");
        earlier.set_text("persisted earlier");
        store
            .save_document_state("p", &earlier.encode_state_as_update(), 1)
            .await
            .unwrap();

        let room = PageRoom::open("p", store, Duration::from_millis(20))
            .await
            .unwrap();
        let (_conn, initial, _rx) = room.join();

        let rebuilt = PageDoc::from_state("p", &initial).unwrap();
        assert_eq!(rebuilt.get_text(), "persisted earlier");
    }

    #[tokio::test]
    async fn test_update_fans_out_and_persists_debounced() {
        let store = store();
        let room = PageRoom::open("p", store.clone(), Duration::from_millis(20))
            .await
            .unwrap();

        let (conn_a, _, _rx_a) = room.join();
        let (_conn_b, _, mut rx_b) = room.join();

        let writer = PageDoc::new("p");
        writer.set_text("edit from a");
        room.handle_frame(
            conn_a,
            RelayFrame::Update {
                update: writer.encode_state_as_update(),
            },
        );

        // The other participant receives the tagged frame.
        let (sender, frame) = rx_b.recv().await.unwrap();
        assert_eq!(sender, conn_a);
        assert!(matches!(frame, RelayFrame::Update { .. }));

        // Persistence happens after the debounce window, not immediately.
        assert!(store.get_document_state("p").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let persisted = store.get_document_state("p").await.unwrap().unwrap();
        assert_eq!(PageDoc::from_state("p", &persisted).unwrap().get_text(), "edit from a");
        assert_eq!(store.get_document_version("p").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_leave_persists_immediately() {
        let store = store();
        let room = PageRoom::open("p", store.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let (conn, _, _rx) = room.join();

        let writer = PageDoc::new("p");
        writer.set_text("final words");
        room.handle_frame(
            conn,
            RelayFrame::Update {
                update: writer.encode_state_as_update(),
            },
        );

        // The debounce window is a minute out, but the empty-room flush
        // bounds loss to zero.
        room.leave(conn, "alice").await;
        let persisted = store.get_document_state("p").await.unwrap().unwrap();
        assert_eq!(
            PageDoc::from_state("p", &persisted).unwrap().get_text(),
            "final words"
        );
    }

    #[tokio::test]
    async fn test_presence_tracked_and_dropped_on_leave() {
        let store = store();
        let room = PageRoom::open("p", store, Duration::from_millis(20))
            .await
            .unwrap();
        let (conn, _, _rx) = room.join();

        room.handle_frame(
            conn,
            RelayFrame::Presence {
                presence: PresenceState::joining("alice", "Alice"),
            },
        );
        assert_eq!(room.online_users().len(), 1);

        room.leave(conn, "alice").await;
        assert!(room.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_bad_update_dropped_without_broadcast() {
        let store = store();
        let room = PageRoom::open("p", store, Duration::from_millis(20))
            .await
            .unwrap();
        let (conn_a, _, _rx_a) = room.join();
        let (_conn_b, _, mut rx_b) = room.join();

        room.handle_frame(
            conn_a,
            RelayFrame::Update {
                update: vec![0xde, 0xad],
            },
        );

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(nothing.is_err(), "bad update must not be fanned out");
    }

    #[tokio::test]
    async fn test_registry_reuses_and_reaps_rooms() {
        let store = store();
        let registry = RoomRegistry::new(store, Duration::from_millis(20));

        let room_one = registry.get_or_create("p").await.unwrap();
        let room_two = registry.get_or_create("p").await.unwrap();
        assert!(Arc::ptr_eq(&room_one, &room_two));
        assert_eq!(registry.room_count().await, 1);

        // Occupied rooms survive a reap attempt.
        let (conn, _, _rx) = room_one.join();
        registry.maybe_remove("p").await;
        assert_eq!(registry.room_count().await, 1);

        room_one.leave(conn, "alice").await;
        registry.maybe_remove("p").await;
        assert_eq!(registry.room_count().await, 0);
    }
}
