use crate::config::{DisplayConfig, FilterConfig, PreviewSize, VALID_RATINGS};
use crate::subscriptions::store::PopularScale;
use crate::types::Post;
use serde::{Deserialize, Serialize};

const DEFAULT_TAGS_PER_LINE: usize = 12;

/// A chat message handed to the host for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    pub fn text_with_image(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            images: vec![url.into()],
        }
    }

    /// `None` when no usable url is left.
    pub fn images<I, S>(urls: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let images: Vec<String> = urls
            .into_iter()
            .map(Into::into)
            .filter(|u: &String| !u.is_empty())
            .collect();
        (!images.is_empty()).then_some(Self { text: None, images })
    }
}

/// How subscription content is rendered, derived from the display settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    TextOnly,
    TextWithImage,
    ImageOnly,
}

impl DeliveryMode {
    pub fn from_display(display: &DisplayConfig) -> Self {
        if display.only_image {
            Self::ImageOnly
        } else if display.show_preview {
            Self::TextWithImage
        } else {
            Self::TextOnly
        }
    }

    pub fn needs_media(&self) -> bool {
        !matches!(self, Self::TextOnly)
    }
}

/// Append the configured content filters to a tag query.
///
/// Ratings are only constrained when the query has no `rating:` token of its own.
pub fn apply_filters(filter: &FilterConfig, tags: &str) -> Vec<String> {
    let mut tokens: Vec<String> = tags.split_whitespace().map(str::to_string).collect();
    let has_rating = tokens
        .iter()
        .any(|t| t.starts_with("rating:") || t.starts_with("-rating:"));

    tokens.extend(
        filter
            .required_tags
            .iter()
            .filter(|t| !t.is_empty())
            .cloned(),
    );
    tokens.extend(
        filter
            .blocked_tags
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| format!("-{}", t)),
    );

    if !has_rating {
        let mut allowed: Vec<&str> = filter
            .allowed_ratings
            .iter()
            .map(String::as_str)
            .filter(|r| VALID_RATINGS.contains(r))
            .collect();
        if allowed.is_empty() {
            allowed = vec!["g", "s"];
        }
        tokens.extend(
            VALID_RATINGS
                .iter()
                .filter(|r| !allowed.contains(r))
                .map(|r| format!("-rating:{}", r)),
        );
    }

    if let Some(min) = filter.min_score.filter(|m| *m > 0) {
        tokens.push(format!("score:>={}", min));
    }
    tokens
}

/// Filtered query for new posts of `tag` above the watermark, newest first.
pub fn tag_query(filter: &FilterConfig, tag: &str, last_post_id: Option<u64>) -> String {
    let mut tokens = apply_filters(filter, tag);
    if tokens.is_empty() {
        tokens.push(tag.to_string());
    }
    tokens.push("order:id_desc".into());
    if let Some(last) = last_post_id.filter(|id| *id > 0) {
        tokens.push(format!("id:>{}", last));
    }
    tokens.join(" ")
}

/// Pick the media url matching the preferred size, falling back to the others.
pub fn select_image_url(post: &Post, size: PreviewSize) -> Option<&str> {
    let preview = post.preview_file_url.as_deref();
    let sample = post.large_file_url.as_deref();
    let original = post.file_url.as_deref();
    let order = match size {
        PreviewSize::Original => [original, sample, preview],
        PreviewSize::Sample => [sample, original, preview],
        PreviewSize::Preview => [preview, sample, original],
    };
    order.into_iter().flatten().find(|u| !u.is_empty())
}

/// Tag string wrapped to `max_tags_display` tags per line; empty when tags are hidden.
pub fn format_tags(display: &DisplayConfig, tag_string: &str) -> String {
    if !display.show_tags {
        return String::new();
    }
    let tags: Vec<&str> = tag_string.split_whitespace().collect();
    let per_line = if display.max_tags_display > 0 {
        display.max_tags_display
    } else {
        DEFAULT_TAGS_PER_LINE
    };
    tags.chunks(per_line)
        .map(|chunk| chunk.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

fn post_lines(header: String, post: &Post, display: &DisplayConfig) -> String {
    let mut lines = vec![
        header,
        format!(
            "#{} | ⭐{} ❤️{} | {}",
            post.id,
            post.score,
            post.fav_count,
            post.rating_label()
        ),
    ];
    let tags = format_tags(display, &post.tag_string);
    if !tags.is_empty() {
        lines.push(format!("🏷️ Tags: {}", tags));
    }
    lines.push(format!("🔗 {}", post.page_url()));
    lines.join("\n")
}

pub fn tag_update_text(tag: &str, post: &Post, display: &DisplayConfig) -> String {
    post_lines(format!("🔔 Subscription update: {}", tag), post, display)
}

pub fn popular_item_text(
    scale: PopularScale,
    index: usize,
    total: usize,
    post: &Post,
    display: &DisplayConfig,
) -> String {
    post_lines(
        format!("🔥 Popular ({}, {}/{})", scale, index, total),
        post,
        display,
    )
}

pub fn popular_summary_text(scale: PopularScale, posts: &[Post]) -> String {
    let mut lines = vec![format!("🔥 Popular ({})\n", scale)];
    for (idx, post) in posts.iter().enumerate() {
        lines.push(format!(
            "{}. #{} | ⭐{} ❤️{}",
            idx + 1,
            post.id,
            post.score,
            post.fav_count
        ));
    }
    lines.join("\n")
}
