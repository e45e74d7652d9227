use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use marksync_core::{feed::FeedEvent, ids::BookmarkId, record::Bookmark};
use marksync_storage::{PushChannel, RemoteStore};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::{FeedSignal, FeedSubscription};
use crate::loader::FetchLoader;
use crate::mutation::{DeleteAck, MutationExecutor};
use crate::projector::{ViewState, project};
use crate::session::{SessionEpoch, SessionProvider, Subject};
use crate::store::{ApplyOutcome, CollectionStore};

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    AddBookmark {
        title: String,
        url: String,
        reply: Reply<Bookmark>,
    },
    DeleteBookmark {
        id: BookmarkId,
        reply: Reply<()>,
    },
    SetSearchQuery {
        query: String,
        reply: Reply<()>,
    },
    Reload {
        reply: Reply<()>,
    },
    SignOut {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<Vec<Bookmark>>,
    },
    Shutdown,
}

/// Why a fetch was issued. Decides what happens with its result.
enum LoadPurpose {
    Activation,
    Manual { reply: Reply<()> },
    ConfirmDelete { id: BookmarkId, reply: Reply<()> },
    /// After the feed came back, to cover events missed while it was down.
    CatchUp,
}

impl LoadPurpose {
    fn finish(self, result: Result<(), SyncError>) {
        match self {
            Self::Manual { reply } | Self::ConfirmDelete { reply, .. } => {
                let _ = reply.send(result);
            }
            Self::Activation | Self::CatchUp => {}
        }
    }
}

enum Completion {
    Loaded {
        epoch: SessionEpoch,
        purpose: LoadPurpose,
        result: Result<Vec<Bookmark>, SyncError>,
    },
    Created {
        epoch: SessionEpoch,
        result: Result<Bookmark, SyncError>,
        reply: Reply<Bookmark>,
    },
    Deleted {
        epoch: SessionEpoch,
        id: BookmarkId,
        result: Result<DeleteAck, SyncError>,
        reply: Reply<()>,
    },
    Resubscribed {
        epoch: SessionEpoch,
        attempt: u32,
        result: Result<FeedSubscription, SyncError>,
    },
}

impl Completion {
    fn epoch(&self) -> SessionEpoch {
        match self {
            Self::Loaded { epoch, .. }
            | Self::Created { epoch, .. }
            | Self::Deleted { epoch, .. }
            | Self::Resubscribed { epoch, .. } => *epoch,
        }
    }

    /// Answer any waiting caller of a result that arrived after its session.
    fn discard(self) {
        match self {
            Self::Loaded { purpose, .. } => purpose.finish(Err(SyncError::SessionEnded)),
            Self::Created { reply, .. } => {
                let _ = reply.send(Err(SyncError::SessionEnded));
            }
            Self::Deleted { reply, .. } => {
                let _ = reply.send(Err(SyncError::SessionEnded));
            }
            // Dropping the subscription releases it
            Self::Resubscribed { .. } => {}
        }
    }
}

/// Presentation-side handle. Cheap to clone; every clone talks to the same
/// controller task.
#[derive(Clone)]
pub struct BookmarksHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ViewState>,
}

impl BookmarksHandle {
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    /// The most recently published view.
    pub fn current(&self) -> ViewState {
        self.state.borrow().clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Resolves with the confirmed record once it is in the store.
    pub async fn add_bookmark(&self, title: &str, url: &str) -> Result<Bookmark, SyncError> {
        let (title, url) = (title.to_string(), url.to_string());
        self.request(|reply| Command::AddBookmark { title, url, reply })
            .await
    }

    /// Resolves once the delete is confirmed and the store reloaded.
    pub async fn delete_bookmark(&self, id: BookmarkId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeleteBookmark { id, reply })
            .await
    }

    pub async fn set_search_query(&self, query: &str) -> Result<(), SyncError> {
        let query = query.to_string();
        self.request(|reply| Command::SetSearchQuery { query, reply })
            .await
    }

    /// Refetch the collection, and retry the feed if it gave up.
    pub async fn reload(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Reload { reply }).await
    }

    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::SignOut { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<Bookmark>, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| SyncError::Closed)
    }
}

/// The single owner of a subject's collection.
///
/// One task serializes dispatch commands, fetch and mutation results, feed
/// events and session transitions. Results are tagged with the session epoch
/// they were issued under and discarded once the epoch has moved on.
pub struct SessionController {
    config: SyncConfig,
    session: Arc<dyn SessionProvider>,
    channel: Arc<dyn PushChannel>,
    loader: FetchLoader,
    executor: MutationExecutor,

    store: CollectionStore,
    subject: Option<Subject>,
    epoch: SessionEpoch,
    feed: Option<FeedSubscription>,
    feed_connected: bool,
    resubscribing: bool,
    /// Fetches issued under the current epoch that have not resolved.
    pending_loads: usize,
    /// Changes applied while a fetch is outstanding, replayed on its result.
    journal: Vec<FeedEvent>,
    load_error: Option<SyncError>,
    search_query: String,
    version: u64,

    state_tx: watch::Sender<ViewState>,
    session_rx: watch::Receiver<Option<Subject>>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl SessionController {
    /// Start the controller task. Must be called within a tokio runtime.
    pub fn spawn(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        channel: Arc<dyn PushChannel>,
        session: Arc<dyn SessionProvider>,
    ) -> (BookmarksHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(config.command_queue.max(1));
        let (state_tx, state_rx) = watch::channel(ViewState::default());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let controller = Self {
            loader: FetchLoader::new(remote.clone(), &config.collection),
            executor: MutationExecutor::new(remote, &config.collection),
            session_rx: session.watch(),
            config,
            session,
            channel,
            store: CollectionStore::new(),
            subject: None,
            epoch: SessionEpoch::default(),
            feed: None,
            feed_connected: false,
            resubscribing: false,
            pending_loads: 0,
            journal: Vec::new(),
            load_error: None,
            search_query: String::new(),
            version: 0,
            state_tx,
            commands,
            completions_tx,
            completions_rx,
        };

        let task = tokio::spawn(controller.run());
        let handle = BookmarksHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        let initial = self.session_rx.borrow_and_update().clone();
        if let Some(subject) = initial {
            self.activate(subject).await;
        }
        self.publish();

        let mut session_open = true;
        loop {
            tokio::select! {
                biased;

                changed = self.session_rx.changed(), if session_open => {
                    match changed {
                        Ok(()) => {
                            let next = self.session_rx.borrow_and_update().clone();
                            self.on_session_changed(next).await;
                        }
                        Err(_) => {
                            debug!("session provider gone, keeping current session");
                            session_open = false;
                        }
                    }
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion);
                }
                signal = next_signal(&mut self.feed) => {
                    self.on_feed(signal);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }
            }
        }

        self.deactivate();
        self.publish();
        info!("sync controller stopped");
    }

    async fn on_session_changed(&mut self, next: Option<Subject>) {
        let current = self
            .subject
            .as_ref()
            .map(|subject| (subject.id, subject.generation));
        match (current, next) {
            (Some(current), Some(next)) if current == (next.id, next.generation) => {
                // Same sign-in, new token
                debug!(subject = %next.id, "session token refreshed");
                self.subject = Some(next);
                self.publish();
            }
            (_, Some(next)) => {
                self.activate(next).await;
                self.publish();
            }
            (Some(_), None) => {
                self.deactivate();
                self.publish();
            }
            (None, None) => {}
        }
    }

    /// Attach the feed, then issue the activation fetch.
    async fn activate(&mut self, subject: Subject) {
        if self.subject.is_some() {
            self.deactivate();
        }
        self.epoch = self.epoch.next();
        self.store.activate(subject.id);
        info!(subject = %subject.id, epoch = %self.epoch, "session activated");
        self.subject = Some(subject.clone());

        match FeedSubscription::open(self.channel.clone(), &subject, &self.config.collection).await {
            Ok(subscription) => {
                self.feed = Some(subscription);
                self.feed_connected = true;
            }
            Err(err) if err.is_fatal() => {
                self.fail_auth(err);
                return;
            }
            Err(err) => {
                warn!(error = %err, "feed subscribe failed, retrying in background");
                self.schedule_resubscribe(1);
            }
        }

        self.start_load(LoadPurpose::Activation);
    }

    /// Drop everything tied to the current session and move to a new epoch.
    fn deactivate(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.release();
        }
        if let Some(subject) = self.subject.take() {
            info!(subject = %subject.id, epoch = %self.epoch, "session deactivated");
        }
        self.epoch = self.epoch.next();
        self.store.clear();
        self.feed_connected = false;
        self.resubscribing = false;
        self.pending_loads = 0;
        self.journal.clear();
        self.load_error = None;
        self.search_query.clear();
    }

    fn fail_auth(&mut self, err: SyncError) {
        error!(error = %err, "remote rejected the session, ending it");
        self.deactivate();
        self.session.end_session();
    }

    fn start_load(&mut self, purpose: LoadPurpose) {
        let Some(subject) = self.subject.clone() else {
            purpose.finish(Err(SyncError::NoSession));
            return;
        };
        self.pending_loads += 1;
        let loader = self.loader.clone();
        let completions = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = loader.load(&subject).await;
            let _ = completions.send(Completion::Loaded {
                epoch,
                purpose,
                result,
            });
        });
    }

    fn schedule_resubscribe(&mut self, attempt: u32) {
        let Some(subject) = self.subject.clone() else {
            return;
        };
        if attempt > self.config.feed.resubscribe_attempts {
            warn!(attempts = attempt - 1, "giving up on feed until next reload");
            self.resubscribing = false;
            return;
        }
        self.resubscribing = true;
        let channel = self.channel.clone();
        let collection = self.config.collection.clone();
        let backoff = self.config.resubscribe_backoff();
        let completions = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let result = FeedSubscription::open(channel, &subject, &collection).await;
            let _ = completions.send(Completion::Resubscribed {
                epoch,
                attempt,
                result,
            });
        });
    }

    /// Apply to the store, journaling while a fetch is outstanding.
    fn apply_change(&mut self, event: FeedEvent) -> ApplyOutcome {
        let outcome = self.store.apply(&event);
        if self.pending_loads > 0 {
            self.journal.push(event);
        }
        outcome
    }

    fn on_completion(&mut self, completion: Completion) {
        if completion.epoch() != self.epoch {
            debug!(epoch = %completion.epoch(), current = %self.epoch, "discarding stale result");
            completion.discard();
            return;
        }

        match completion {
            Completion::Loaded {
                purpose, result, ..
            } => self.on_loaded(purpose, result),
            Completion::Created { result, reply, .. } => match result {
                Ok(record) => {
                    self.apply_change(FeedEvent::Insert(record.clone()));
                    self.publish();
                    let _ = reply.send(Ok(record));
                }
                Err(err) => {
                    if err.is_fatal() {
                        self.fail_auth(err.clone());
                        self.publish();
                    }
                    let _ = reply.send(Err(err));
                }
            },
            Completion::Deleted {
                id, result, reply, ..
            } => match result {
                Ok(ack) => {
                    debug!(%id, ?ack, "delete confirmed, reloading");
                    self.apply_change(FeedEvent::Delete { id });
                    self.start_load(LoadPurpose::ConfirmDelete { id, reply });
                    self.publish();
                }
                Err(err) => {
                    if err.is_fatal() {
                        self.fail_auth(err.clone());
                        self.publish();
                    }
                    let _ = reply.send(Err(err));
                }
            },
            Completion::Resubscribed {
                attempt, result, ..
            } => match result {
                Ok(subscription) => {
                    if self.feed.is_some() {
                        subscription.release();
                        return;
                    }
                    info!(attempt, "feed reattached");
                    self.feed = Some(subscription);
                    self.feed_connected = true;
                    self.resubscribing = false;
                    self.start_load(LoadPurpose::CatchUp);
                    self.publish();
                }
                Err(err) if err.is_fatal() => {
                    self.fail_auth(err);
                    self.publish();
                }
                Err(err) => {
                    warn!(attempt, error = %err, "feed resubscribe failed");
                    self.schedule_resubscribe(attempt + 1);
                }
            },
        }
    }

    fn on_loaded(&mut self, purpose: LoadPurpose, result: Result<Vec<Bookmark>, SyncError>) {
        self.pending_loads = self.pending_loads.saturating_sub(1);

        let outcome = match result {
            Ok(records) => {
                let kept = self.store.replace_all(records);
                for event in &self.journal {
                    self.store.apply(event);
                }
                debug!(kept, replayed = self.journal.len(), "store replaced from fetch");
                self.load_error = None;
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                self.fail_auth(err.clone());
                Err(err)
            }
            Err(err) => match &purpose {
                LoadPurpose::ConfirmDelete { id, .. } => {
                    warn!(%id, error = %err, "confirm reload failed, removing locally");
                    self.store.remove(*id);
                    Ok(())
                }
                LoadPurpose::Activation => {
                    warn!(error = %err, "initial load failed");
                    self.store.replace_all(Vec::new());
                    self.load_error = Some(err.clone());
                    Err(err)
                }
                LoadPurpose::Manual { .. } | LoadPurpose::CatchUp => {
                    warn!(error = %err, "reload failed, keeping current records");
                    self.load_error = Some(err.clone());
                    Err(err)
                }
            },
        };

        if self.pending_loads == 0 {
            self.journal.clear();
        }
        self.publish();
        purpose.finish(outcome);
    }

    fn on_feed(&mut self, signal: FeedSignal) {
        match signal {
            FeedSignal::Event(event) => {
                let kind = event.kind();
                let id = event.id();
                let outcome = self.apply_change(event);
                debug!(kind = kind.as_str(), %id, ?outcome, "feed event applied");
                if outcome.changed() {
                    self.publish();
                }
            }
            FeedSignal::Skipped(reason) => {
                warn!(%reason, "skipping undecodable feed frame");
            }
            FeedSignal::Dropped(reason) => {
                warn!(%reason, "feed dropped, resubscribing");
                if let Some(feed) = self.feed.take() {
                    feed.release();
                }
                self.feed_connected = false;
                self.schedule_resubscribe(1);
                self.publish();
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddBookmark { title, url, reply } => {
                let Some(subject) = self.subject.clone() else {
                    let _ = reply.send(Err(SyncError::NoSession));
                    return;
                };
                let executor = self.executor.clone();
                let completions = self.completions_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = executor.create(&subject, &title, &url).await;
                    let _ = completions.send(Completion::Created {
                        epoch,
                        result,
                        reply,
                    });
                });
            }
            Command::DeleteBookmark { id, reply } => {
                let Some(subject) = self.subject.clone() else {
                    let _ = reply.send(Err(SyncError::NoSession));
                    return;
                };
                let executor = self.executor.clone();
                let completions = self.completions_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = executor.delete(&subject, id).await;
                    let _ = completions.send(Completion::Deleted {
                        epoch,
                        id,
                        result,
                        reply,
                    });
                });
            }
            Command::SetSearchQuery { query, reply } => {
                self.search_query = query;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Reload { reply } => {
                if self.subject.is_none() {
                    let _ = reply.send(Err(SyncError::NoSession));
                    return;
                }
                if self.feed.is_none() && !self.resubscribing {
                    self.schedule_resubscribe(1);
                }
                self.start_load(LoadPurpose::Manual { reply });
                self.publish();
            }
            Command::SignOut { reply } => {
                if self.subject.is_some() {
                    self.deactivate();
                    self.publish();
                }
                self.session.end_session();
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.store.snapshot()));
            }
            Command::Shutdown => {}
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let bookmarks = project(self.store.records(), &self.search_query);
        let total_count = self.store.len();
        let state = ViewState {
            subject: self.subject.as_ref().map(|s| s.id),
            display_name: self.subject.as_ref().map(|s| s.profile.display_name()),
            empty: ViewState::empty_reason(bookmarks.len(), total_count),
            bookmarks,
            total_count,
            search_query: self.search_query.clone(),
            loading: self.pending_loads > 0,
            load_error: self.load_error.clone(),
            feed_connected: self.feed_connected,
            store_digest: self.store.digest(),
            version: self.version,
        };
        self.state_tx.send_replace(state);
    }
}

/// Pending forever while no subscription is attached.
async fn next_signal(feed: &mut Option<FeedSubscription>) -> FeedSignal {
    match feed {
        Some(subscription) => subscription.next_signal().await,
        None => std::future::pending().await,
    }
}
