use std::sync::Arc;

use crate::archive::{self, FetchError, PageRequest, Post, SortOption, ViewMode};

/// Seam between the feed controller and whatever serves archived posts.
/// Implementations must preserve the server's ordering.
pub trait FeedService: Send + Sync {
    fn load_posts(
        &self,
        subreddit: &str,
        sort: SortOption,
        mode: ViewMode,
        page: PageRequest,
    ) -> Result<Vec<Post>, FetchError>;
}

pub struct ArchiveFeedService {
    client: Arc<archive::Client>,
}

impl ArchiveFeedService {
    pub fn new(client: Arc<archive::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for ArchiveFeedService {
    fn load_posts(
        &self,
        subreddit: &str,
        sort: SortOption,
        mode: ViewMode,
        page: PageRequest,
    ) -> Result<Vec<Post>, FetchError> {
        self.client.subreddit_posts(subreddit, sort, mode, page)
    }
}

/// Serves a fixed collection, windowed by limit/offset the way the archive
/// backend does. Used offline and throughout the controller tests.
pub struct MockFeedService {
    posts: Vec<Post>,
}

impl MockFeedService {
    pub fn new(posts: Vec<Post>) -> Self {
        Self { posts }
    }
}

impl FeedService for MockFeedService {
    fn load_posts(
        &self,
        _subreddit: &str,
        _sort: SortOption,
        _mode: ViewMode,
        page: PageRequest,
    ) -> Result<Vec<Post>, FetchError> {
        Ok(self
            .posts
            .iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}
