//! Resource services over [`DanbooruClient`].
//!
//! Every service is a [`Resource`] bound to an endpoint prefix; the
//! resource-specific types only add query building.

use crate::error::ApiError;
use crate::http::{ApiResponse, DanbooruClient, Params, RequestBody, RequestOptions};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// CRUD access to one Danbooru endpoint prefix such as `posts` or `tags`.
#[derive(Clone)]
pub struct Resource {
    client: Arc<DanbooruClient>,
    prefix: &'static str,
}

impl Resource {
    pub fn new(client: Arc<DanbooruClient>, prefix: &'static str) -> Self {
        Self { client, prefix }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn client(&self) -> &DanbooruClient {
        &self.client
    }

    /// `prefix/part/part`, skipping empty parts.
    pub fn endpoint(&self, parts: &[&str]) -> String {
        std::iter::once(self.prefix)
            .chain(parts.iter().copied())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub async fn list(&self, params: Params, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.client.get(self.prefix, params, options).await
    }

    /// List with `search[field]=value` filters plus optional paging.
    pub async fn search(
        &self,
        search: &Map<String, Value>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ApiResponse, ApiError> {
        let mut params = search_params(search);
        paginate(&mut params, page, limit);
        self.list(params, RequestOptions::default()).await
    }

    pub async fn get(&self, id: u64) -> Result<ApiResponse, ApiError> {
        self.client
            .get(&self.endpoint(&[id.to_string().as_str()]), Params::new(), RequestOptions::default())
            .await
    }

    pub async fn create(&self, data: Value) -> Result<ApiResponse, ApiError> {
        self.client
            .post(self.prefix, RequestBody::Json(data), RequestOptions::default())
            .await
    }

    pub async fn update(&self, id: u64, data: Value) -> Result<ApiResponse, ApiError> {
        self.client
            .put(
                &self.endpoint(&[id.to_string().as_str()]),
                RequestBody::Json(data),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn destroy(&self, id: u64) -> Result<ApiResponse, ApiError> {
        self.client
            .delete(&self.endpoint(&[id.to_string().as_str()]), Params::new(), RequestOptions::default())
            .await
    }
}

/// Turn `{"name": "x", "order": "count"}` into `search[name]=x&search[order]=count`.
/// Nulls are dropped; non-string scalars are stringified.
pub fn search_params(search: &Map<String, Value>) -> Params {
    search
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((format!("search[{}]", k), value))
        })
        .collect()
}

fn paginate(params: &mut Params, page: Option<u32>, limit: Option<u32>) {
    if let Some(page) = page {
        params.insert("page".into(), page.to_string());
    }
    if let Some(limit) = limit {
        params.insert("limit".into(), limit.to_string());
    }
}

#[derive(Clone)]
pub struct Posts(Resource);

impl Posts {
    pub async fn list(
        &self,
        tags: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
        use_cache: bool,
    ) -> Result<ApiResponse, ApiError> {
        let mut params = Params::new();
        if let Some(tags) = tags.filter(|t| !t.trim().is_empty()) {
            params.insert("tags".into(), tags.to_string());
        }
        paginate(&mut params, page, limit);
        let options = RequestOptions {
            use_cache,
            ..RequestOptions::default()
        };
        self.0.list(params, options).await
    }

    pub async fn get(&self, id: u64) -> Result<ApiResponse, ApiError> {
        self.0.get(id).await
    }

    /// Never cached; every call should yield a new post.
    pub async fn random(&self, tags: Option<&str>) -> Result<ApiResponse, ApiError> {
        let mut params = Params::new();
        if let Some(tags) = tags.filter(|t| !t.trim().is_empty()) {
            params.insert("tags".into(), tags.to_string());
        }
        self.0
            .client()
            .get(&self.0.endpoint(&["random"]), params, RequestOptions::no_cache())
            .await
    }

    pub async fn count(&self, tags: Option<&str>) -> Result<ApiResponse, ApiError> {
        let mut params = Params::new();
        if let Some(tags) = tags {
            params.insert("tags".into(), tags.to_string());
        }
        self.0
            .client()
            .get("counts/posts", params, RequestOptions::default())
            .await
    }
}

#[derive(Clone)]
pub struct Explore(Resource);

impl Explore {
    pub async fn popular(
        &self,
        date: Option<&str>,
        scale: Option<&str>,
        use_cache: bool,
    ) -> Result<ApiResponse, ApiError> {
        self.feed("popular", date, scale, use_cache).await
    }

    pub async fn curated(&self, date: Option<&str>, scale: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.feed("curated", date, scale, true).await
    }

    pub async fn viewed(&self, date: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.feed("viewed", date, None, true).await
    }

    async fn feed(
        &self,
        name: &str,
        date: Option<&str>,
        scale: Option<&str>,
        use_cache: bool,
    ) -> Result<ApiResponse, ApiError> {
        let mut params = Params::new();
        if let Some(date) = date {
            params.insert("date".into(), date.to_string());
        }
        if let Some(scale) = scale {
            params.insert("scale".into(), scale.to_string());
        }
        let options = RequestOptions {
            use_cache,
            ..RequestOptions::default()
        };
        self.0
            .client()
            .get(&self.0.endpoint(&[name]), params, options)
            .await
    }
}

#[derive(Clone)]
pub struct Tags(Resource);

impl Tags {
    pub async fn search(
        &self,
        name_matches: &str,
        order: Option<&str>,
        limit: Option<u32>,
    ) -> Result<ApiResponse, ApiError> {
        let mut search = Map::new();
        search.insert("name_matches".into(), json!(name_matches));
        search.insert("hide_empty".into(), json!(true));
        if let Some(order) = order {
            search.insert("order".into(), json!(order));
        }
        self.0.search(&search, None, limit).await
    }

    pub async fn get(&self, id: u64) -> Result<ApiResponse, ApiError> {
        self.0.get(id).await
    }
}

#[derive(Clone)]
pub struct Wiki(Resource);

impl Wiki {
    /// Wiki pages are addressed by title, which may contain `/` or spaces.
    pub async fn get(&self, title: &str) -> Result<ApiResponse, ApiError> {
        let normalized = title.trim().replace(' ', "_");
        let encoded = urlencoding::encode(&normalized);
        self.0
            .client()
            .get(&self.0.endpoint(&[encoded.as_ref()]), Params::new(), RequestOptions::default())
            .await
    }

    pub async fn search(&self, title: &str, limit: Option<u32>) -> Result<ApiResponse, ApiError> {
        let mut search = Map::new();
        search.insert("title_normalize".into(), json!(title));
        self.0.search(&search, None, limit).await
    }
}

#[derive(Clone)]
pub struct Users(Resource);

impl Users {
    pub async fn get(&self, id: u64) -> Result<ApiResponse, ApiError> {
        self.0.get(id).await
    }

    pub async fn search(&self, name: &str, limit: Option<u32>) -> Result<ApiResponse, ApiError> {
        let mut search = Map::new();
        search.insert("name_matches".into(), json!(name));
        self.0.search(&search, None, limit).await
    }

    pub async fn profile(&self) -> Result<ApiResponse, ApiError> {
        self.0.client().get_profile().await
    }
}

#[derive(Clone)]
pub struct Favorites(Resource);

impl Favorites {
    pub async fn list(&self, user_id: Option<u64>, limit: Option<u32>) -> Result<ApiResponse, ApiError> {
        let mut search = Map::new();
        if let Some(user_id) = user_id {
            search.insert("user_id".into(), json!(user_id));
        }
        self.0.search(&search, None, limit).await
    }

    pub async fn add(&self, post_id: u64) -> Result<ApiResponse, ApiError> {
        self.0
            .client()
            .post(
                self.0.prefix(),
                RequestBody::Form(json!({ "post_id": post_id })),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn remove(&self, post_id: u64) -> Result<ApiResponse, ApiError> {
        self.0.destroy(post_id).await
    }
}

/// All services sharing one client.
#[derive(Clone)]
pub struct Services {
    pub client: Arc<DanbooruClient>,
    pub posts: Posts,
    pub explore: Explore,
    pub tags: Tags,
    pub wiki: Wiki,
    pub users: Users,
    pub favorites: Favorites,
    pub artists: Resource,
    pub pools: Resource,
    pub comments: Resource,
}

impl Services {
    pub fn new(client: Arc<DanbooruClient>) -> Self {
        let resource = |prefix| Resource::new(client.clone(), prefix);
        Self {
            posts: Posts(resource("posts")),
            explore: Explore(resource("explore/posts")),
            tags: Tags(resource("tags")),
            wiki: Wiki(resource("wiki_pages")),
            users: Users(resource("users")),
            favorites: Favorites(resource("favorites")),
            artists: resource("artists"),
            pools: resource("pools"),
            comments: resource("comments"),
            client,
        }
    }
}
