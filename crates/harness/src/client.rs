use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use marksync_core::{identity::SubjectIdentity, ids::SubjectId};
use marksync_engine::{
    BookmarksHandle, SessionController, SessionManager, Subject, SubjectProfile, SyncConfig,
    SyncError, ViewState,
};
use marksync_storage::{PushChannel, RemoteStore};

use crate::backend::TestBackend;

pub const WAIT: Duration = Duration::from_secs(5);

/// One device: a session manager, a controller task and its handle.
pub struct TestClient {
    pub identity: SubjectIdentity,
    pub session: Arc<SessionManager>,
    pub handle: BookmarksHandle,
    task: JoinHandle<()>,
}

impl TestClient {
    pub fn start(backend: &TestBackend, identity: SubjectIdentity) -> Self {
        Self::start_with(
            backend.config().clone(),
            backend.remote_dyn(),
            backend.channel_dyn(),
            identity,
        )
    }

    pub fn start_with(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        channel: Arc<dyn PushChannel>,
        identity: SubjectIdentity,
    ) -> Self {
        let session = Arc::new(SessionManager::new(config.session.token_ttl_ms));
        let (handle, task) = SessionController::spawn(config, remote, channel, session.clone());
        Self {
            identity,
            session,
            handle,
            task,
        }
    }

    /// Another device of the same subject.
    pub fn sibling(&self, backend: &TestBackend) -> Self {
        Self::start(
            backend,
            SubjectIdentity::from_secret_bytes(&self.identity.secret_bytes()),
        )
    }

    pub fn subject_id(&self) -> SubjectId {
        self.identity.subject_id()
    }

    pub fn sign_in(&self) -> Result<Subject, SyncError> {
        self.sign_in_as(SubjectProfile::default())
    }

    pub fn sign_in_as(&self, profile: SubjectProfile) -> Result<Subject, SyncError> {
        self.session.sign_in(&self.identity, profile)
    }

    /// Sign in and wait for the activation load to finish.
    pub async fn sign_in_and_wait(&self) -> Result<ViewState, Box<dyn Error>> {
        self.sign_in()?;
        self.wait_active().await
    }

    pub async fn wait_active(&self) -> Result<ViewState, Box<dyn Error>> {
        let id = self.subject_id();
        self.wait_for(|state| state.subject == Some(id) && !state.loading)
            .await
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ViewState) -> bool,
    ) -> Result<ViewState, Box<dyn Error>> {
        let mut state = self.handle.state();
        let seen = tokio::time::timeout(WAIT, state.wait_for(predicate)).await??;
        Ok((*seen).clone())
    }

    pub fn view(&self) -> ViewState {
        self.handle.current()
    }

    pub async fn stop(self) -> Result<(), Box<dyn Error>> {
        self.handle.shutdown().await?;
        self.task.await?;
        Ok(())
    }
}

/// Poll `condition` until it holds or `WAIT` passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> Result<(), Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err("condition not reached in time".into());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
