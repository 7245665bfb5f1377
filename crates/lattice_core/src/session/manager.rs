//! The collaborative document session.
//!
//! One [`DocSession`] per open page per session. The mode is chosen when
//! the session starts and modeled as a tagged variant: private mode saves
//! through the document endpoint with a trailing-edge debounce, shared mode
//! routes every edit through the realtime relay and leaves persistence to
//! it. Both modes share one observable state surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::debounce::{DebouncedAction, Debouncer};
use super::doc::PageDoc;
use super::document_remote::DocumentRemote;
use super::presence::{CursorPosition, PresenceState, SelectionRange};
use super::protocol::{RelayFrame, channel_name};
use super::relay::{RelayConnector, RelaySender};
use crate::error::Result;
use crate::replica::ReplicaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Observable session state, pushed to subscribers immediately on subscribe
/// and on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub connection: ConnectionStatus,
    pub synced: bool,
    /// Other collaborators currently in the channel (never includes self).
    pub online_users: Vec<PresenceState>,
    /// Local mutations not yet confirmed saved/sent.
    pub pending_changes: usize,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Connecting,
            synced: false,
            online_users: Vec::new(),
            pending_changes: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrivateSessionOptions {
    /// Trailing-edge debounce window for remote saves.
    pub save_debounce: Duration,
}

impl Default for PrivateSessionOptions {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_secs(2),
        }
    }
}

enum SessionMode {
    Private {
        saver: Arc<Debouncer>,
        remote: Arc<dyn DocumentRemote>,
    },
    Shared {
        sender: RelaySender,
        recv_task: JoinHandle<()>,
        local_presence: PresenceState,
    },
}

/// A live editing session for one page.
pub struct DocSession {
    page_id: String,
    doc: Arc<PageDoc>,
    store: Arc<dyn ReplicaStore>,
    state_tx: watch::Sender<SessionState>,
    /// Set while a remote/peer update is being applied so the mutation
    /// observer can tell echoes from local edits.
    applying_remote: Arc<AtomicBool>,
    mode: SessionMode,
    _update_sub: yrs::Subscription,
}

/// Apply an update while flagging it as remote-origin for the observer.
fn apply_remote(doc: &PageDoc, applying_remote: &AtomicBool, update: &[u8]) -> Result<()> {
    applying_remote.store(true, Ordering::SeqCst);
    let result = doc.apply_update(update);
    applying_remote.store(false, Ordering::SeqCst);
    result
}

/// Fetch the latest remote document and merge it in. Unreachable or
/// unauthenticated remotes leave the session local-only; a missing document
/// is the valid "no content yet" outcome.
async fn merge_remote(
    doc: &Arc<PageDoc>,
    applying_remote: &Arc<AtomicBool>,
    store: &Arc<dyn ReplicaStore>,
    remote: &dyn DocumentRemote,
    state_tx: &watch::Sender<SessionState>,
    page_id: &str,
) {
    match remote.fetch_document(page_id).await {
        Ok(Some(remote_doc)) => match apply_remote(doc, applying_remote, &remote_doc.state) {
            Ok(()) => {
                let merged = doc.encode_state_as_update();
                if let Err(e) = store
                    .save_document_state(page_id, &merged, remote_doc.version)
                    .await
                {
                    log::warn!("failed to cache merged document {}: {}", page_id, e);
                }
                state_tx.send_modify(|s| {
                    s.connection = ConnectionStatus::Connected;
                    s.synced = true;
                });
            }
            Err(e) => {
                log::warn!("failed to merge remote document {}: {}", page_id, e);
                state_tx.send_modify(|s| s.connection = ConnectionStatus::Disconnected);
            }
        },
        Ok(None) => {
            state_tx.send_modify(|s| {
                s.connection = ConnectionStatus::Connected;
                s.synced = true;
            });
        }
        Err(e) => {
            log::info!(
                "document endpoint unreachable for {}, proceeding local-only: {}",
                page_id,
                e
            );
            state_tx.send_modify(|s| s.connection = ConnectionStatus::Disconnected);
        }
    }
}

/// The debounced private-mode save: push the current state to the document
/// endpoint, then mirror it into the local store and search index. Failures
/// are logged and retried on the next debounce tick; editing is never
/// blocked.
fn save_action(
    doc: Arc<PageDoc>,
    store: Arc<dyn ReplicaStore>,
    remote: Arc<dyn DocumentRemote>,
    state_tx: watch::Sender<SessionState>,
    page_id: String,
) -> DebouncedAction {
    Arc::new(move || {
        let doc = Arc::clone(&doc);
        let store = Arc::clone(&store);
        let remote = Arc::clone(&remote);
        let state_tx = state_tx.clone();
        let page_id = page_id.clone();
        Box::pin(async move {
            let state = doc.encode_state_as_update();
            let text = doc.get_text();
            let local_version = match store.get_document_version(&page_id).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("failed to read document version for {}: {}", page_id, e);
                    0
                }
            };

            match remote
                .save_document(&page_id, &state, Some(&text), Some(local_version + 1))
                .await
            {
                Ok(version) => {
                    if let Err(e) = store.save_document_state(&page_id, &state, version).await {
                        log::warn!("failed to persist document {} locally: {}", page_id, e);
                    }
                    if let Err(e) = store.update_search_index(&page_id, &text).await {
                        log::warn!("failed to update search index for {}: {}", page_id, e);
                    }
                    state_tx.send_modify(|s| {
                        s.pending_changes = 0;
                        s.synced = true;
                        s.connection = ConnectionStatus::Connected;
                    });
                }
                Err(e) => {
                    log::warn!(
                        "document save failed for {}: {}; retrying on next debounce tick",
                        page_id,
                        e
                    );
                    // Keep the local replica current so an offline close
                    // loses nothing.
                    if let Err(e) = store
                        .save_document_state(&page_id, &state, local_version)
                        .await
                    {
                        log::warn!("failed to persist document {} locally: {}", page_id, e);
                    }
                    state_tx.send_modify(|s| {
                        s.synced = false;
                        s.connection = ConnectionStatus::Disconnected;
                    });
                }
            }
        })
    })
}

impl DocSession {
    /// Open a private-mode session: no peer connection, saves flow to the
    /// document endpoint with a trailing-edge debounce.
    pub async fn open_private(
        store: Arc<dyn ReplicaStore>,
        remote: Arc<dyn DocumentRemote>,
        page_id: &str,
        options: PrivateSessionOptions,
    ) -> Result<Self> {
        let doc = Arc::new(PageDoc::new(page_id));
        let applying_remote = Arc::new(AtomicBool::new(false));
        let (state_tx, _) = watch::channel(SessionState::default());

        // Seed from the locally persisted blob first.
        if let Some(state) = store.get_document_state(page_id).await? {
            apply_remote(&doc, &applying_remote, &state)?;
        }

        merge_remote(
            &doc,
            &applying_remote,
            &store,
            remote.as_ref(),
            &state_tx,
            page_id,
        )
        .await;

        let saver = Arc::new(Debouncer::new(
            options.save_debounce,
            save_action(
                Arc::clone(&doc),
                Arc::clone(&store),
                Arc::clone(&remote),
                state_tx.clone(),
                page_id.to_string(),
            ),
        ));

        // Attached after the initial merge so the merge itself never
        // schedules a save.
        let update_sub = doc.observe_updates({
            let state_tx = state_tx.clone();
            let saver = Arc::clone(&saver);
            let applying_remote = Arc::clone(&applying_remote);
            move |_update| {
                if applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                state_tx.send_modify(|s| {
                    s.pending_changes += 1;
                    s.synced = false;
                });
                saver.schedule();
            }
        });

        Ok(Self {
            page_id: page_id.to_string(),
            doc,
            store,
            state_tx,
            applying_remote,
            mode: SessionMode::Private { saver, remote },
            _update_sub: update_sub,
        })
    }

    /// Open a shared-mode session: join the page's realtime channel with a
    /// bearer credential. The relay authorizes before admitting; an
    /// authorization failure rejects the whole session. Persistence is the
    /// relay's responsibility in this mode.
    pub async fn open_shared(
        store: Arc<dyn ReplicaStore>,
        connector: Arc<dyn RelayConnector>,
        page_id: &str,
        credential: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<Self> {
        let doc = Arc::new(PageDoc::new(page_id));
        let applying_remote = Arc::new(AtomicBool::new(false));
        let (state_tx, _) = watch::channel(SessionState::default());

        if let Some(state) = store.get_document_state(page_id).await? {
            apply_remote(&doc, &applying_remote, &state)?;
        }

        let connection = connector
            .connect(&channel_name(page_id), credential)
            .await?;
        let (sender, mut inbound) = connection.into_parts();

        let local_presence = PresenceState::joining(user_id, user_name);

        // Announce ourselves and offer our state; the CRDT merge dedupes on
        // every receiver.
        sender.send(RelayFrame::PeerJoined {
            user_id: local_presence.user_id.clone(),
            user_name: local_presence.user_name.clone(),
        })?;
        sender.send(RelayFrame::Presence {
            presence: local_presence.clone(),
        })?;
        let initial = doc.encode_state_as_update();
        if !initial.is_empty() {
            sender.send(RelayFrame::Update { update: initial })?;
        }
        state_tx.send_modify(|s| s.connection = ConnectionStatus::Connected);

        let recv_task = tokio::spawn({
            let doc = Arc::clone(&doc);
            let state_tx = state_tx.clone();
            let applying_remote = Arc::clone(&applying_remote);
            let sender = sender.clone();
            let local_presence = local_presence.clone();
            async move {
                while let Some(frame) = inbound.recv().await {
                    match frame {
                        RelayFrame::Update { update } => {
                            match apply_remote(&doc, &applying_remote, &update) {
                                Ok(()) => state_tx.send_modify(|s| s.synced = true),
                                Err(e) => log::warn!("failed to apply peer update: {}", e),
                            }
                        }
                        RelayFrame::Presence { presence } => {
                            if presence.user_id == local_presence.user_id {
                                continue;
                            }
                            state_tx.send_modify(|s| {
                                match s
                                    .online_users
                                    .iter_mut()
                                    .find(|p| p.user_id == presence.user_id)
                                {
                                    Some(existing) => *existing = presence.clone(),
                                    None => s.online_users.push(presence.clone()),
                                }
                            });
                        }
                        RelayFrame::PeerJoined { user_id, user_name } => {
                            if user_id == local_presence.user_id {
                                continue;
                            }
                            state_tx.send_modify(|s| {
                                if !s.online_users.iter().any(|p| p.user_id == user_id) {
                                    s.online_users
                                        .push(PresenceState::joining(&user_id, &user_name));
                                }
                            });
                            // Offer the newcomer our state and presence.
                            let state = doc.encode_state_as_update();
                            if !state.is_empty() {
                                let _ = sender.send(RelayFrame::Update { update: state });
                            }
                            let _ = sender.send(RelayFrame::Presence {
                                presence: local_presence.clone(),
                            });
                        }
                        RelayFrame::PeerLeft { user_id } => {
                            state_tx
                                .send_modify(|s| s.online_users.retain(|p| p.user_id != user_id));
                        }
                    }
                }
                state_tx.send_modify(|s| s.connection = ConnectionStatus::Disconnected);
            }
        });

        let update_sub = doc.observe_updates({
            let sender = sender.clone();
            let state_tx = state_tx.clone();
            let applying_remote = Arc::clone(&applying_remote);
            move |update| {
                if applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                match sender.send(RelayFrame::Update {
                    update: update.to_vec(),
                }) {
                    Ok(()) => state_tx.send_modify(|s| s.pending_changes = 0),
                    Err(e) => {
                        log::warn!("failed to send update to relay: {}", e);
                        state_tx.send_modify(|s| {
                            s.pending_changes += 1;
                            s.connection = ConnectionStatus::Disconnected;
                        });
                    }
                }
            }
        });

        Ok(Self {
            page_id: page_id.to_string(),
            doc,
            store,
            state_tx,
            applying_remote,
            mode: SessionMode::Shared {
                sender,
                recv_task,
                local_presence,
            },
            _update_sub: update_sub,
        })
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// The in-memory document; the editing surface reads and writes through
    /// this handle.
    pub fn doc(&self) -> Arc<PageDoc> {
        Arc::clone(&self.doc)
    }

    /// Subscribe to session state. The current value arrives immediately,
    /// then every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.mode, SessionMode::Shared { .. })
    }

    /// Broadcast a cursor/selection change over the presence side-band.
    /// No-op in private mode.
    pub fn update_presence(
        &self,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
    ) -> Result<()> {
        match &self.mode {
            SessionMode::Shared {
                sender,
                local_presence,
                ..
            } => sender.send(RelayFrame::Presence {
                presence: local_presence.at(cursor, selection),
            }),
            SessionMode::Private { .. } => Ok(()),
        }
    }

    /// Re-attempt the remote merge after a reconnect (private mode,
    /// best-effort).
    pub async fn retry_remote_merge(&self) {
        if let SessionMode::Private { remote, .. } = &self.mode {
            merge_remote(
                &self.doc,
                &self.applying_remote,
                &self.store,
                remote.as_ref(),
                &self.state_tx,
                &self.page_id,
            )
            .await;
        }
    }

    /// Tear the session down, releasing the save timer, store handle, relay
    /// connection, presence entry, and in-memory document.
    ///
    /// Private mode forces one final save so no edit made just before close
    /// is lost; shared mode announces departure and stops the frame pump.
    pub async fn close(self) {
        let Self {
            mode, state_tx, ..
        } = self;
        match mode {
            SessionMode::Private { saver, .. } => {
                saver.flush().await;
                saver.cancel();
            }
            SessionMode::Shared {
                sender,
                recv_task,
                local_presence,
            } => {
                let _ = sender.send(RelayFrame::PeerLeft {
                    user_id: local_presence.user_id,
                });
                recv_task.abort();
            }
        }
        state_tx.send_modify(|s| {
            s.connection = ConnectionStatus::Disconnected;
            s.online_users.clear();
        });
    }
}

impl std::fmt::Debug for DocSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocSession")
            .field("page_id", &self.page_id)
            .field("shared", &self.is_shared())
            .finish_non_exhaustive()
    }
}
