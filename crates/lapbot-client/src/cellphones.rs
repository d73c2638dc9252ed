//! HTTP client for the CellphoneS catalog.
//!
//! The catalog is spread over three services:
//!
//! - a product GraphQL endpoint (laptop listing, products by id)
//! - a customer GraphQL endpoint (questions and answers on the laptop page)
//! - a REST recommendation endpoint (accessories bought with a laptop)
//!
//! Product pages themselves are plain HTML and are fetched as text.
//!
//! # Examples
//!
//! ```no_run
//! use lapbot_client::CellphonesClient;
//! use lapbot_core::traits::CatalogSource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CellphonesClient::new()?;
//! let products = client.fetch_products().await?;
//! println!("{} laptops", products.len());
//! # Ok(())
//! # }
//! ```

use lapbot_core::HttpConfig;
use lapbot_core::error::AppError;
use lapbot_core::traits::{CatalogSource, PageSource};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Value, json};

use crate::retry::{Failure, RetryingHttp};

/// Endpoints and catalog parameters.
#[derive(Debug, Clone)]
pub struct CellphonesEndpoints {
    pub product_graphql: String,
    pub customer_graphql: String,
    /// Recommendation URL; `{id}` is replaced by the product id.
    pub recommendation: String,
    /// Page the laptop questions are attached to.
    pub question_page_url: String,
    /// Laptop category id.
    pub category_id: String,
    /// Province used for stock and pricing.
    pub province_id: u32,
    /// Upper bound on products returned by the listing query.
    pub listing_size: u32,
}

impl Default for CellphonesEndpoints {
    fn default() -> Self {
        Self {
            product_graphql: "https://api.cellphones.com.vn/v2/graphql/query".to_string(),
            customer_graphql: "https://api.cellphones.com.vn/graphql-customer/graphql/query"
                .to_string(),
            recommendation:
                "https://api.cellphones.com.vn/recommendation/v1/recommend?product_id={id}"
                    .to_string(),
            question_page_url: "https://cellphones.com.vn/laptop.html".to_string(),
            category_id: "380".to_string(),
            province_id: 30,
            listing_size: 5000,
        }
    }
}

/// HTTP client for the CellphoneS APIs.
#[derive(Clone)]
pub struct CellphonesClient {
    http: RetryingHttp,
    endpoints: CellphonesEndpoints,
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

const PRODUCT_FIELDS: &str = "
    general {
        product_id name sku doc_quyen manufacturer url_key url_path attributes
        child_product
        categories { categoryId name uri level similar }
        review { total_count average_rating }
    }
    filterable {
        is_installment stock_available_id company_stock_id is_parent
        price prices special_price promotion_information thumbnail
        filter { id Label }
    }";

const COMMENTS_QUERY: &str = "
    query comments($pageUrl: String!, $page: Int!) {
        comment(type: \"page\", pageUrl: $pageUrl, productId: 0, currentPage: $page) {
            total
            matches {
                id content page_name is_admin sent_from created_at product_id page_url
                customer { id fullname }
                children
            }
        }
    }";

/// Browser-like headers; the APIs reject requests without an origin.
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/html;q=0.9"));
    headers.insert(ORIGIN, HeaderValue::from_static("https://cellphones.com.vn"));
    headers.insert(REFERER, HeaderValue::from_static("https://cellphones.com.vn/"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
    );
    headers
}

fn products_query(filter: &str, size: usize) -> String {
    format!(
        "query {{ products(filter: {{ static: {{ {filter} }} }}, page: 1, size: {size}, \
         sort: [{{view: desc}}]) {{ {PRODUCT_FIELDS} }} }}"
    )
}

/// Joined messages of a GraphQL `errors` array, if it is not empty.
fn graphql_errors(body: &Value) -> Option<String> {
    let errors = body.get("errors").and_then(Value::as_array)?;
    if errors.is_empty() {
        return None;
    }
    let messages: Vec<String> = errors
        .iter()
        .map(|e| {
            e.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        })
        .collect();
    Some(messages.join("; "))
}

/// Error messages the API sends with HTTP 200 when it is overloaded.
const TRANSIENT_GRAPHQL_MESSAGES: [&str; 5] = [
    "timeout",
    "timed out",
    "try again",
    "internal server error",
    "service unavailable",
];

/// Accepts a GraphQL body, turning overload `errors` into retryable failures.
fn accept_graphql(body: String) -> Result<Value, Failure> {
    let value: Value = serde_json::from_str(&body).map_err(|e| {
        Failure::Fatal(AppError::ClientError(format!("Failed to parse response: {}", e)))
    })?;
    let Some(message) = graphql_errors(&value) else {
        return Ok(value);
    };
    let lowered = message.to_lowercase();
    if lowered.contains("too many requests") || lowered.contains("rate limit") {
        Err(Failure::RateLimited(None))
    } else if TRANSIENT_GRAPHQL_MESSAGES.iter().any(|m| lowered.contains(m)) {
        Err(Failure::Transient(AppError::GraphQlError(message)))
    } else {
        Err(Failure::Fatal(AppError::GraphQlError(message)))
    }
}

/// Extracts `data.<field>` from a GraphQL response, failing on `errors`.
fn graphql_data(mut body: Value, field: &str) -> Result<Value, AppError> {
    if let Some(message) = graphql_errors(&body) {
        return Err(AppError::GraphQlError(message));
    }

    match body.get_mut("data").and_then(|d| d.get_mut(field)) {
        Some(value) if !value.is_null() => Ok(value.take()),
        _ => Err(AppError::EmptyResponse),
    }
}

/// Products array from a `products` query; a missing list is empty.
fn parse_products(body: Value) -> Result<Vec<Value>, AppError> {
    match graphql_data(body, "products") {
        Ok(Value::Array(products)) => Ok(products),
        Ok(_) | Err(AppError::EmptyResponse) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Comment matches from a `comment` query.
fn parse_comments(body: Value) -> Result<Vec<Value>, AppError> {
    let mut comment = match graphql_data(body, "comment") {
        Ok(comment) => comment,
        Err(AppError::EmptyResponse) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    match comment.get_mut("matches").map(Value::take) {
        Some(Value::Array(matches)) => Ok(matches),
        _ => Ok(Vec::new()),
    }
}

/// Ids from a recommendation response `{ "data": [{ "product_id": .. }] }`.
fn parse_recommendations(body: &Value) -> Vec<String> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item.get("product_id")? {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

impl CellphonesClient {
    /// Creates a client for the public endpoints.
    pub fn new() -> Result<Self, AppError> {
        Self::with_endpoints(CellphonesEndpoints::default(), HttpConfig::default())
    }

    /// Creates a client for custom endpoints, e.g. a recorded mock server.
    pub fn with_endpoints(
        endpoints: CellphonesEndpoints,
        http_config: HttpConfig,
    ) -> Result<Self, AppError> {
        for url in [&endpoints.product_graphql, &endpoints.customer_graphql] {
            Url::parse(url).map_err(|_| AppError::InvalidUrl(url.clone()))?;
        }

        let client = Client::builder()
            .timeout(http_config.timeout)
            .default_headers(default_headers())
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            http: RetryingHttp::new(client, http_config),
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &CellphonesEndpoints {
        &self.endpoints
    }

    async fn post_graphql(
        &self,
        url: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value, AppError> {
        let body = GraphQlRequest { query, variables };
        self.http
            .send(url, |client| client.post(url).json(&body), accept_graphql)
            .await
    }
}

// =============================================================================
// Trait Implementation: CatalogSource
// =============================================================================

impl CatalogSource for CellphonesClient {
    async fn fetch_products(&self) -> Result<Vec<Value>, AppError> {
        let filter = format!(
            "categories: [\"{}\"], province_id: {}, stock: {{ from: 0 }}",
            self.endpoints.category_id, self.endpoints.province_id
        );
        let query = products_query(&filter, self.endpoints.listing_size as usize);
        let body = self
            .post_graphql(&self.endpoints.product_graphql, &query, json!({}))
            .await?;
        parse_products(body)
    }

    async fn fetch_comment_page(&self, page: u32) -> Result<Vec<Value>, AppError> {
        let variables = json!({
            "pageUrl": self.endpoints.question_page_url,
            "page": page,
        });
        let body = self
            .post_graphql(&self.endpoints.customer_graphql, COMMENTS_QUERY, variables)
            .await?;
        parse_comments(body)
    }

    async fn fetch_recommendations(&self, product_id: &str) -> Result<Vec<String>, AppError> {
        let url = self.endpoints.recommendation.replace("{id}", product_id.trim());
        Url::parse(&url).map_err(|_| AppError::InvalidUrl(url.clone()))?;

        let body = self.http.get_text(&url).await?;
        let body: Value = serde_json::from_str(&body)
            .map_err(|e| AppError::ClientError(format!("Failed to parse response: {}", e)))?;
        Ok(parse_recommendations(&body))
    }

    async fn fetch_products_by_ids(&self, ids: &[String]) -> Result<Vec<Value>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = serde_json::to_string(ids)?;
        let filter = format!(
            "is_parent: \"true\", province_id: {}, product_id: {id_list}",
            self.endpoints.province_id
        );
        let query = products_query(&filter, ids.len());
        let body = self
            .post_graphql(&self.endpoints.product_graphql, &query, json!({}))
            .await?;
        parse_products(body)
    }
}

impl PageSource for CellphonesClient {
    async fn fetch_page(&self, url: &str) -> Result<String, AppError> {
        Url::parse(url).map_err(|_| AppError::InvalidUrl(url.to_string()))?;
        self.http.get_text(url).await
    }
}
