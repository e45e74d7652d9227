pub mod error;
pub mod feed;
pub mod hlc;
pub mod identity;
pub mod ids;
pub mod record;

pub use error::CoreError;
pub use feed::{FeedEvent, FeedEventKind};
pub use hlc::Hlc;
pub use identity::{SessionToken, SubjectIdentity};
pub use ids::*;
pub use record::{Bookmark, NewBookmark};
