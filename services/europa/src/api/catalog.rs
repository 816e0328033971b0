//! Tag and repository listings

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use super::{Pagination, RegistryState};
use crate::error::RegistryResult;
use crate::manifest::PageIterator;

/// Router for listings
pub(super) fn router() -> Router<RegistryState> {
    Router::new()
        .route("/v2/{name}/tags/list", get(list_tags))
        .route("/v2/_catalog", get(catalog))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// Catalog response
#[derive(Debug, serde::Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// List tags for a repository
async fn list_tags(
    State(state): State<RegistryState>,
    Path(name): Path<String>,
    Query(pagination): Query<Pagination>,
) -> RegistryResult<Response> {
    let repo = state.repo(&name).await?;
    let page = PageIterator::after(pagination.page_size(), pagination.last.clone());
    let (tags, more) = state
        .ctx
        .manifests
        .list_tags(&repo.domain, &repo.id, &page)
        .await?;

    let link = match tags.last() {
        Some(last) if more => {
            Some(pagination.next_link(&format!("/v2/{name}/tags/list"), last)?)
        }
        _ => None,
    };
    let body = Json(TagList { name, tags });
    Ok(match link {
        Some(link) => ([(header::LINK, link)], body).into_response(),
        None => body.into_response(),
    })
}

/// List local repositories
async fn catalog(
    State(state): State<RegistryState>,
    Query(pagination): Query<Pagination>,
) -> RegistryResult<Response> {
    let page = PageIterator::after(pagination.page_size(), pagination.last.clone());
    let repos = state.ctx.repos.list_local_repos(&state.domain, &page).await?;

    let link = match &repos.next {
        Some(next) => Some(pagination.next_link("/v2/_catalog", next)?),
        None => None,
    };
    let body = Json(Catalog {
        repositories: repos.items.into_iter().map(|repo| repo.name).collect(),
    });
    Ok(match link {
        Some(link) => ([(header::LINK, link)], body).into_response(),
        None => body.into_response(),
    })
}
