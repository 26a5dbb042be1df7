use serde::{Deserialize, Serialize};
use serde_json::Value;

// Canonical post shape used by the subscription layer. Unknown fields are ignored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Post {
    pub id: u64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub fav_count: i64,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub tag_string: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub large_file_url: Option<String>,
    #[serde(default)]
    pub preview_file_url: Option<String>,
    #[serde(default)]
    pub file_ext: Option<String>,
}

impl Post {
    pub fn rating_label(&self) -> &str {
        self.rating.as_deref().unwrap_or("?")
    }

    pub fn page_url(&self) -> String {
        format!("https://danbooru.donmai.us/posts/{}", self.id)
    }
}

/// Decode an API payload into posts, skipping entries without a usable id.
pub fn parse_posts(data: &Value) -> Vec<Post> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Post>(item.clone()).ok())
                .filter(|p| p.id > 0)
                .collect()
        })
        .unwrap_or_default()
}
