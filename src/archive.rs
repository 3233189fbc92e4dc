use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";

/// Errors surfaced by the archive backend client. A failed feed request is
/// terminal for the render attempt that issued it; the controller replaces
/// the previous render with an inline message.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("archive: invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("archive: request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("archive: subreddit not found")]
    NotFound,
    #[error("archive: api error {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SortOption {
    Score,
    New,
    Random,
}

impl Default for SortOption {
    fn default() -> Self {
        SortOption::Score
    }
}

impl SortOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOption::Score => "score",
            SortOption::New => "new",
            SortOption::Random => "random",
        }
    }

    pub fn from_key(key: &str) -> SortOption {
        match key {
            "new" => SortOption::New,
            "random" => SortOption::Random,
            _ => SortOption::Score,
        }
    }

    pub fn next(&self) -> SortOption {
        match self {
            SortOption::Score => SortOption::New,
            SortOption::New => SortOption::Random,
            SortOption::Random => SortOption::Score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Paged,
    Single,
    Grid,
}

impl Default for ViewMode {
    fn default() -> Self {
        ViewMode::Single
    }
}

impl ViewMode {
    /// Wire name the archive API expects; the paged list is historically
    /// called "reddit" by the backend.
    pub fn as_query(&self) -> &'static str {
        match self {
            ViewMode::Paged => "reddit",
            ViewMode::Single => "single",
            ViewMode::Grid => "grid",
        }
    }

    pub fn from_key(key: &str) -> ViewMode {
        match key {
            "paged" | "reddit" => ViewMode::Paged,
            "grid" => ViewMode::Grid,
            _ => ViewMode::Single,
        }
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            ViewMode::Paged => "paged",
            ViewMode::Single => "single",
            ViewMode::Grid => "grid",
        }
    }

    pub fn next(&self) -> ViewMode {
        match self {
            ViewMode::Paged => ViewMode::Single,
            ViewMode::Single => ViewMode::Grid,
            ViewMode::Grid => ViewMode::Paged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Text,
    Link,
    Image,
    Video,
    Gallery,
    #[serde(other)]
    Unknown,
}

impl Default for PostKind {
    fn default() -> Self {
        PostKind::Unknown
    }
}

/// One archived submission as returned by the posts endpoint. The order of
/// the response array is the display order and is preserved everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub post_type: PostKind,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub media_items: Vec<MediaItem>,
}

impl Post {
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.created_utc == 0.0 {
            return None;
        }
        chrono::DateTime::from_timestamp(self.created_utc.trunc() as i64, 0)
    }

    pub fn has_video(&self) -> bool {
        self.post_type == PostKind::Video
            || self
                .media_items
                .iter()
                .any(|item| item.media_type == MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Gallery,
    #[serde(other)]
    Unknown,
}

impl Default for MediaKind {
    fn default() -> Self {
        MediaKind::Unknown
    }
}

/// One piece of media attached to a post. `download_path` is null while the
/// archiver has not finished fetching the file; the raw `url` is only a
/// fallback source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub media_type: MediaKind,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub download_path: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let mut base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        // Url::join treats the last segment of a slash-less base as a file
        // and would drop it, so normalize before parsing.
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };
        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    /// Fetches one page of archived posts. The server applies the sort and
    /// the view-mode filter; the returned ordering is authoritative.
    pub fn subreddit_posts(
        &self,
        subreddit: &str,
        sort: SortOption,
        mode: ViewMode,
        page: PageRequest,
    ) -> Result<Vec<Post>, FetchError> {
        let name = subreddit.trim_start_matches("r/").to_ascii_lowercase();
        let path = format!("api/subreddits/{}/posts", name);
        let mut url = self.base_url.join(&path)?;
        url.query_pairs_mut()
            .append_pair("limit", &page.limit.to_string())
            .append_pair("offset", &page.offset.to_string())
            .append_pair("sort", sort.as_str())
            .append_pair("view_mode", mode.as_query());

        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp.json()?)
        } else if status.as_u16() == 404 {
            Err(FetchError::NotFound)
        } else {
            let body = resp.text().unwrap_or_default();
            Err(FetchError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}
