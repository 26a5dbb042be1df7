use crate::error::ApiError;
use crate::http::ApiResponse;
use crate::services::Services;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub type Handler = fn(Services, Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>>;

pub struct Operation {
    pub service: &'static str,
    pub method: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub handler: Handler,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OperationDescriptor {
    pub service: String,
    pub method: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Explicit `(service, method)` table. Built once at startup.
pub struct Registry {
    operations: BTreeMap<(&'static str, &'static str), Operation>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let operations = operations()
            .into_iter()
            .map(|op| ((op.service, op.method), op))
            .collect();
        Self { operations }
    }

    pub fn lookup(&self, service: &str, method: &str) -> Result<&Operation, ApiError> {
        self.operations
            .iter()
            .find(|((s, m), _)| *s == service && *m == method)
            .map(|(_, op)| op)
            .ok_or_else(|| {
                ApiError::validation(format!("unknown operation: {}.{}", service, method))
            })
    }

    pub async fn call(
        &self,
        services: &Services,
        service: &str,
        method: &str,
        args: Value,
    ) -> Result<ApiResponse, ApiError> {
        let op = self.lookup(service, method)?;
        (op.handler)(services.clone(), args).await
    }

    pub fn descriptors(&self) -> Vec<OperationDescriptor> {
        self.operations
            .values()
            .map(|op| OperationDescriptor {
                service: op.service.into(),
                method: op.method.into(),
                description: op.description.into(),
                input_schema: op.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, ApiError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| ApiError::validation(format!("invalid arguments: {}", e)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostsListInput {
    pub tags: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdInput {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagsInput {
    pub tags: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExploreInput {
    pub date: Option<String>,
    pub scale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagSearchInput {
    pub name_matches: String,
    pub order: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TitleInput {
    pub title: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameInput {
    pub name: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FavoritesListInput {
    pub user_id: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostIdInput {
    pub post_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchInput {
    #[serde(default)]
    pub search: Map<String, Value>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
        "required": required,
    })
}

fn id_schema() -> Value {
    schema(json!({"id": {"type": "integer"}}), &["id"])
}

fn search_schema() -> Value {
    schema(
        json!({
            "search": {"type": "object"},
            "page": {"type": "integer"},
            "limit": {"type": "integer"}
        }),
        &[],
    )
}

fn posts_list(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: PostsListInput = parse(args)?;
        s.posts
            .list(input.tags.as_deref(), input.page, input.limit, true)
            .await
    }
    .boxed()
}

fn posts_get(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: IdInput = parse(args)?;
        s.posts.get(input.id).await
    }
    .boxed()
}

fn posts_random(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: TagsInput = parse(args)?;
        s.posts.random(input.tags.as_deref()).await
    }
    .boxed()
}

fn posts_count(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: TagsInput = parse(args)?;
        s.posts.count(input.tags.as_deref()).await
    }
    .boxed()
}

fn explore_popular(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: ExploreInput = parse(args)?;
        s.explore
            .popular(input.date.as_deref(), input.scale.as_deref(), true)
            .await
    }
    .boxed()
}

fn explore_curated(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: ExploreInput = parse(args)?;
        s.explore
            .curated(input.date.as_deref(), input.scale.as_deref())
            .await
    }
    .boxed()
}

fn tags_search(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: TagSearchInput = parse(args)?;
        s.tags
            .search(&input.name_matches, input.order.as_deref(), input.limit)
            .await
    }
    .boxed()
}

fn wiki_get(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: TitleInput = parse(args)?;
        if input.title.trim().is_empty() {
            return Err(ApiError::validation("title must not be empty"));
        }
        s.wiki.get(&input.title).await
    }
    .boxed()
}

fn users_search(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: NameInput = parse(args)?;
        s.users.search(&input.name, input.limit).await
    }
    .boxed()
}

fn users_get(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: IdInput = parse(args)?;
        s.users.get(input.id).await
    }
    .boxed()
}

fn users_profile(s: Services, _args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move { s.users.profile().await }.boxed()
}

fn favorites_list(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: FavoritesListInput = parse(args)?;
        s.favorites.list(input.user_id, input.limit).await
    }
    .boxed()
}

fn favorites_add(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: PostIdInput = parse(args)?;
        s.favorites.add(input.post_id).await
    }
    .boxed()
}

fn favorites_remove(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: PostIdInput = parse(args)?;
        s.favorites.remove(input.post_id).await
    }
    .boxed()
}

fn artists_search(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: SearchInput = parse(args)?;
        s.artists.search(&input.search, input.page, input.limit).await
    }
    .boxed()
}

fn artists_get(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: IdInput = parse(args)?;
        s.artists.get(input.id).await
    }
    .boxed()
}

fn pools_search(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: SearchInput = parse(args)?;
        s.pools.search(&input.search, input.page, input.limit).await
    }
    .boxed()
}

fn pools_get(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: IdInput = parse(args)?;
        s.pools.get(input.id).await
    }
    .boxed()
}

fn comments_search(s: Services, args: Value) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    async move {
        let input: SearchInput = parse(args)?;
        s.comments.search(&input.search, input.page, input.limit).await
    }
    .boxed()
}

pub fn operations() -> Vec<Operation> {
    vec![
        Operation {
            service: "posts",
            method: "list",
            description: "Search posts by tag query",
            input_schema: schema(
                json!({
                    "tags": {"type": "string"},
                    "page": {"type": "integer"},
                    "limit": {"type": "integer"}
                }),
                &[],
            ),
            handler: posts_list,
        },
        Operation {
            service: "posts",
            method: "get",
            description: "Get a single post by id",
            input_schema: id_schema(),
            handler: posts_get,
        },
        Operation {
            service: "posts",
            method: "random",
            description: "Get a random post, optionally matching tags",
            input_schema: schema(json!({"tags": {"type": "string"}}), &[]),
            handler: posts_random,
        },
        Operation {
            service: "posts",
            method: "count",
            description: "Count posts matching a tag query",
            input_schema: schema(json!({"tags": {"type": "string"}}), &[]),
            handler: posts_count,
        },
        Operation {
            service: "explore",
            method: "popular",
            description: "Popular posts for a day, week or month",
            input_schema: schema(
                json!({
                    "date": {"type": "string"},
                    "scale": {"type": "string", "enum": ["day", "week", "month"]}
                }),
                &[],
            ),
            handler: explore_popular,
        },
        Operation {
            service: "explore",
            method: "curated",
            description: "Curated posts for a day, week or month",
            input_schema: schema(
                json!({
                    "date": {"type": "string"},
                    "scale": {"type": "string", "enum": ["day", "week", "month"]}
                }),
                &[],
            ),
            handler: explore_curated,
        },
        Operation {
            service: "tags",
            method: "search",
            description: "Search tags by name pattern",
            input_schema: schema(
                json!({
                    "name_matches": {"type": "string"},
                    "order": {"type": "string", "enum": ["name", "date", "count"]},
                    "limit": {"type": "integer"}
                }),
                &["name_matches"],
            ),
            handler: tags_search,
        },
        Operation {
            service: "wiki",
            method: "get",
            description: "Get a wiki page by title",
            input_schema: schema(
                json!({"title": {"type": "string"}, "limit": {"type": "integer"}}),
                &["title"],
            ),
            handler: wiki_get,
        },
        Operation {
            service: "users",
            method: "search",
            description: "Search users by name pattern",
            input_schema: schema(
                json!({"name": {"type": "string"}, "limit": {"type": "integer"}}),
                &["name"],
            ),
            handler: users_search,
        },
        Operation {
            service: "users",
            method: "get",
            description: "Get a user by id",
            input_schema: id_schema(),
            handler: users_get,
        },
        Operation {
            service: "users",
            method: "profile",
            description: "Profile of the authenticated account",
            input_schema: schema(json!({}), &[]),
            handler: users_profile,
        },
        Operation {
            service: "favorites",
            method: "list",
            description: "List favorites, optionally for one user",
            input_schema: schema(
                json!({"user_id": {"type": "integer"}, "limit": {"type": "integer"}}),
                &[],
            ),
            handler: favorites_list,
        },
        Operation {
            service: "favorites",
            method: "add",
            description: "Favorite a post (requires auth)",
            input_schema: schema(json!({"post_id": {"type": "integer"}}), &["post_id"]),
            handler: favorites_add,
        },
        Operation {
            service: "favorites",
            method: "remove",
            description: "Unfavorite a post (requires auth)",
            input_schema: schema(json!({"post_id": {"type": "integer"}}), &["post_id"]),
            handler: favorites_remove,
        },
        Operation {
            service: "artists",
            method: "search",
            description: "Search artists",
            input_schema: search_schema(),
            handler: artists_search,
        },
        Operation {
            service: "artists",
            method: "get",
            description: "Get an artist by id",
            input_schema: id_schema(),
            handler: artists_get,
        },
        Operation {
            service: "pools",
            method: "search",
            description: "Search pools",
            input_schema: search_schema(),
            handler: pools_search,
        },
        Operation {
            service: "pools",
            method: "get",
            description: "Get a pool by id",
            input_schema: id_schema(),
            handler: pools_get,
        },
        Operation {
            service: "comments",
            method: "search",
            description: "Search comments",
            input_schema: search_schema(),
            handler: comments_search,
        },
    ]
}
