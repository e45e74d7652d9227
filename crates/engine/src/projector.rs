use marksync_core::{ids::SubjectId, record::Bookmark};

use crate::error::SyncError;

pub const ICONS: [&str; 8] = ["🔖", "⭐", "💡", "🚀", "🎯", "📌", "✨", "🔥"];

pub const COLORS: [&str; 6] = [
    "from-blue-500 to-cyan-500",
    "from-purple-500 to-pink-500",
    "from-green-500 to-emerald-500",
    "from-orange-500 to-red-500",
    "from-indigo-500 to-blue-500",
    "from-teal-500 to-green-500",
];

/// Sum of the UTF-16 code units of `url`.
pub fn url_hash(url: &str) -> u64 {
    url.encode_utf16().map(u64::from).sum()
}

/// Icon and color derived from the url alone.
pub fn annotate(url: &str) -> (&'static str, &'static str) {
    let hash = url_hash(url);
    (
        ICONS[(hash % ICONS.len() as u64) as usize],
        COLORS[(hash % COLORS.len() as u64) as usize],
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayBookmark {
    pub record: Bookmark,
    pub icon: &'static str,
    pub color: &'static str,
}

impl DisplayBookmark {
    pub fn new(record: Bookmark) -> Self {
        let (icon, color) = annotate(&record.url);
        Self { record, icon, color }
    }
}

fn matches(record: &Bookmark, folded_query: &str) -> bool {
    folded_query.is_empty()
        || record.title.to_lowercase().contains(folded_query)
        || record.url.to_lowercase().contains(folded_query)
}

/// Filter by case-folded substring on title or url, order newest first with
/// ties broken by id, then annotate.
pub fn project<'a>(records: impl IntoIterator<Item = &'a Bookmark>, query: &str) -> Vec<DisplayBookmark> {
    let folded = query.to_lowercase();
    let mut kept: Vec<&Bookmark> = records
        .into_iter()
        .filter(|record| matches(record, &folded))
        .collect();
    kept.sort_by(|a, b| a.display_cmp(b));
    kept.into_iter().cloned().map(DisplayBookmark::new).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// The subject has no bookmarks at all.
    NoBookmarks,
    /// Bookmarks exist but none match the search query.
    NoMatches,
}

/// Everything the presentation layer reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewState {
    pub subject: Option<SubjectId>,
    pub display_name: Option<String>,
    pub bookmarks: Vec<DisplayBookmark>,
    /// Size of the unfiltered collection.
    pub total_count: usize,
    pub search_query: String,
    pub loading: bool,
    pub load_error: Option<SyncError>,
    pub feed_connected: bool,
    pub empty: Option<EmptyReason>,
    pub store_digest: [u8; 32],
    /// Bumped on every publish.
    pub version: u64,
}

impl ViewState {
    pub fn empty_reason(shown: usize, total: usize) -> Option<EmptyReason> {
        match (shown, total) {
            (0, 0) => Some(EmptyReason::NoBookmarks),
            (0, _) => Some(EmptyReason::NoMatches),
            _ => None,
        }
    }

    pub fn ids(&self) -> Vec<marksync_core::ids::BookmarkId> {
        self.bookmarks.iter().map(|b| b.record.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::{hlc::Hlc, ids::BookmarkId};

    fn bookmark(n: u128, created: u64, title: &str, url: &str) -> Bookmark {
        Bookmark {
            id: BookmarkId::from_u128(n),
            title: title.into(),
            url: url.into(),
            owner_id: SubjectId::from_bytes([1; 32]),
            created_at: Hlc::new(created, 0),
            revision: Hlc::new(created, 0),
        }
    }

    #[test]
    fn hash_sums_utf16_code_units() {
        assert_eq!(url_hash(""), 0);
        assert_eq!(url_hash("ab"), 97 + 98);
        // Astral characters count as a surrogate pair
        assert_eq!(url_hash("😀"), 0xD83D + 0xDE00);
    }

    #[test]
    fn annotation_indexes_by_hash() {
        assert_eq!(url_hash("https://example.com"), 1828);
        assert_eq!(annotate("https://example.com"), (ICONS[4], COLORS[4]));
    }

    #[test]
    fn search_is_case_insensitive_on_title_and_url() {
        let records = [
            bookmark(1, 20, "GitHub", "https://github.com"),
            bookmark(2, 10, "Example", "https://example.com"),
        ];
        let view = project(&records, "git");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].record.title, "GitHub");

        assert_eq!(project(&records, "EXAMPLE.COM").len(), 1);
        assert_eq!(project(&records, "").len(), 2);
        assert!(project(&records, "nothing").is_empty());
    }

    #[test]
    fn newest_first_ties_by_id() {
        let records = [
            bookmark(3, 10, "c", "https://c"),
            bookmark(1, 10, "a", "https://a"),
            bookmark(2, 30, "b", "https://b"),
        ];
        let ids: Vec<u128> = project(&records, "")
            .iter()
            .map(|b| b.record.id.as_uuid().as_u128())
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn projection_is_deterministic() {
        let records = [
            bookmark(1, 10, "Rust", "https://rust-lang.org"),
            bookmark(2, 10, "Docs", "https://docs.rs"),
        ];
        let reversed = [records[1].clone(), records[0].clone()];
        assert_eq!(project(&records, "r"), project(&reversed, "r"));
    }

    #[test]
    fn empty_reason_distinguishes_filtered_from_empty() {
        assert_eq!(ViewState::empty_reason(0, 0), Some(EmptyReason::NoBookmarks));
        assert_eq!(ViewState::empty_reason(0, 4), Some(EmptyReason::NoMatches));
        assert_eq!(ViewState::empty_reason(2, 4), None);
    }
}
