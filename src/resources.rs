//! List endpoints of the marketplace API.
//!
//! Every list call is a `POST` with body
//! `{"options": {"pagination": {...}, <filters>}}`, where the filters are a
//! typed record per resource.

use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, instrument};

use crate::capabilities::http::{HttpBackend, HttpError, ValidatedUrl};
use crate::model::{DisputeRecord, DisputeStatus, IpAssetSummary, IpId, TransactionRecord};
use crate::pagination::{PageRequest, PageResponse, PageSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListResource {
    IpAssets,
    Transactions,
    Disputes,
}

impl ListResource {
    pub fn path(self) -> &'static str {
        match self {
            ListResource::IpAssets => "assets",
            ListResource::Transactions => "transactions",
            ListResource::Disputes => "disputes",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_asset_ids: Vec<IpId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_direction: Option<SortDirection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_id: Option<IpId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_direction: Option<SortDirection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ip_id: Option<IpId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DisputeStatus>,
}

#[derive(Serialize)]
struct ListBody<'a, F> {
    options: ListOptions<'a, F>,
}

#[derive(Serialize)]
struct ListOptions<'a, F> {
    pagination: &'a PageRequest,
    #[serde(flatten)]
    filters: &'a F,
}

/// Request body for one list call.
pub fn list_body<F: Serialize>(request: &PageRequest, filters: &F) -> Result<serde_json::Value, HttpError> {
    serde_json::to_value(ListBody {
        options: ListOptions {
            pagination: request,
            filters,
        },
    })
    .map_err(|e| HttpError::SerializationError {
        message: e.to_string(),
    })
}

/// [`PageSource`] backed by one list endpoint.
#[derive(Debug, Clone)]
pub struct HttpPageSource<T, F> {
    http: HttpBackend,
    endpoint: ValidatedUrl,
    resource: ListResource,
    filters: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> HttpPageSource<T, F> {
    pub fn new(http: HttpBackend, api_base: &ValidatedUrl, resource: ListResource, filters: F) -> Result<Self, HttpError> {
        Ok(Self {
            http,
            endpoint: api_base.join(resource.path())?,
            resource,
            filters,
            _marker: PhantomData,
        })
    }

    pub fn endpoint(&self) -> &ValidatedUrl {
        &self.endpoint
    }
}

impl HttpPageSource<IpAssetSummary, AssetFilters> {
    pub fn ip_assets(http: HttpBackend, api_base: &ValidatedUrl, filters: AssetFilters) -> Result<Self, HttpError> {
        Self::new(http, api_base, ListResource::IpAssets, filters)
    }
}

impl HttpPageSource<TransactionRecord, TransactionFilters> {
    pub fn transactions(
        http: HttpBackend,
        api_base: &ValidatedUrl,
        filters: TransactionFilters,
    ) -> Result<Self, HttpError> {
        Self::new(http, api_base, ListResource::Transactions, filters)
    }
}

impl HttpPageSource<DisputeRecord, DisputeFilters> {
    pub fn disputes(http: HttpBackend, api_base: &ValidatedUrl, filters: DisputeFilters) -> Result<Self, HttpError> {
        Self::new(http, api_base, ListResource::Disputes, filters)
    }
}

#[async_trait]
impl<T, F> PageSource<T> for HttpPageSource<T, F>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    F: Serialize + Send + Sync,
{
    #[instrument(skip(self, request), fields(resource = self.resource.path(), limit = request.limit))]
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse<T>, HttpError> {
        let body = list_body(&request, &self.filters)?;
        let page: PageResponse<T> = self.http.post_json(&self.endpoint, &body).await?;
        debug!(items = page.data.len(), has_next = page.has_next(), "list page received");
        Ok(page)
    }
}
