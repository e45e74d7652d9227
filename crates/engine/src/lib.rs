pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod loader;
pub mod mutation;
pub mod projector;
pub mod session;
pub mod store;

pub use config::{FeedConfig, SessionConfig, SyncConfig};
pub use controller::{BookmarksHandle, SessionController};
pub use error::SyncError;
pub use feed::{FeedSignal, FeedSubscription};
pub use loader::FetchLoader;
pub use mutation::{DeleteAck, MutationExecutor};
pub use projector::{COLORS, DisplayBookmark, EmptyReason, ICONS, ViewState, annotate, project};
pub use session::{SessionEpoch, SessionManager, SessionProvider, Subject, SubjectProfile};
pub use store::{ApplyOutcome, CollectionStore};
