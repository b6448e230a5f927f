//! Elasticsearch-compatible REST backend.

use std::fmt::Write as _;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    BackendResult, DeleteByQueryAck, IndexTemplate, MERGE_SCRIPT_ID, RolloverConditions,
    RolloverOutcome, SCROLL_KEEP_ALIVE, ScrollPage, SearchBackend, SearchHit, TaskQuery,
    index_age_order,
};
use crate::bulk::{BulkItemResult, BulkResponse, UpsertOperation};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::task::Task;

fn keep_alive() -> String {
    format!("{}s", SCROLL_KEEP_ALIVE.as_secs())
}

/// REST client for a search cluster.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/{path}", self.base_url));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> BackendResult<(StatusCode, String)> {
        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok((status, body))
    }

    /// Send and decode a JSON body, mapping non-2xx to [`BackendError::Status`].
    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: RequestBuilder,
    ) -> BackendResult<T> {
        let (status, body) = self.send(builder).await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

/// NDJSON body: one update action plus one scripted-upsert line per operation.
#[must_use]
pub fn bulk_body(operations: &[UpsertOperation]) -> String {
    let mut body = String::new();
    for op in operations {
        let action = json!({ "update": { "_index": op.index, "_id": op.id } });
        let doc = json!({
            "script": { "id": MERGE_SCRIPT_ID, "params": { "task": op.task } },
            "upsert": op.task,
        });
        let _ = writeln!(body, "{action}");
        let _ = writeln!(body, "{doc}");
    }
    body
}

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, RawBulkItem>>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Flatten a bulk response into per-item results in request order.
pub fn parse_bulk_response(body: &str) -> BackendResult<BulkResponse> {
    let raw: RawBulkResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    let items = raw
        .items
        .into_iter()
        .filter_map(|mut entry| entry.drain().next().map(|(_, item)| item))
        .map(|item| BulkItemResult {
            id: item.id,
            status: item.status,
            error: item.error.map(|e| match e.get("reason").and_then(Value::as_str) {
                Some(reason) => reason.to_string(),
                None => e.to_string(),
            }),
        })
        .collect();
    Ok(BulkResponse { items })
}

#[derive(Debug, Deserialize)]
struct RawSearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: RawHits,
}

#[derive(Debug, Deserialize)]
struct RawHits {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_source")]
    source: Task,
}

impl From<RawSearchResponse> for ScrollPage {
    fn from(raw: RawSearchResponse) -> Self {
        Self {
            scroll_id: raw.scroll_id,
            hits: raw
                .hits
                .hits
                .into_iter()
                .map(|h| SearchHit {
                    index: h.index,
                    task: h.source,
                })
                .collect(),
        }
    }
}

impl SearchBackend for HttpBackend {
    async fn bulk(&self, operations: &[UpsertOperation]) -> BackendResult<BulkResponse> {
        let builder = self
            .request(Method::POST, "_bulk")
            .header("content-type", "application/x-ndjson")
            .body(bulk_body(operations));
        let (status, body) = self.send(builder).await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_bulk_response(&body)
    }

    async fn open_scroll(
        &self,
        index: &str,
        query: &TaskQuery,
        page_size: usize,
    ) -> BackendResult<ScrollPage> {
        let builder = self
            .request(Method::POST, &format!("{index}/_search"))
            .query(&[("scroll", keep_alive())])
            .json(&json!({ "size": page_size, "query": query.to_query_dsl() }));
        let raw: RawSearchResponse = self.send_json(builder).await?;
        Ok(raw.into())
    }

    async fn scroll(&self, scroll_id: &str) -> BackendResult<ScrollPage> {
        let builder = self
            .request(Method::POST, "_search/scroll")
            .json(&json!({ "scroll": keep_alive(), "scroll_id": scroll_id }));
        let raw: RawSearchResponse = self.send_json(builder).await?;
        Ok(raw.into())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> BackendResult<()> {
        let builder = self
            .request(Method::DELETE, "_search/scroll")
            .json(&json!({ "scroll_id": [scroll_id] }));
        let (status, body) = self.send(builder).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn alias_indices(&self, alias: &str) -> BackendResult<Vec<String>> {
        let (status, body) = self
            .send(self.request(Method::GET, &format!("_alias/{alias}")))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let raw: std::collections::BTreeMap<String, Value> =
            serde_json::from_str(&body).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let mut indices: Vec<(bool, String)> = raw
            .into_iter()
            .map(|(index, meta)| {
                let is_write = meta["aliases"][alias]["is_write_index"]
                    .as_bool()
                    .unwrap_or(false);
                (is_write, index)
            })
            .collect();
        // Write index last, the rest oldest first.
        indices.sort_by(|(a_write, a), (b_write, b)| {
            a_write.cmp(b_write).then_with(|| index_age_order(a, b))
        });
        Ok(indices.into_iter().map(|(_, index)| index).collect())
    }

    async fn create_index(&self, index: &str, alias: Option<&str>) -> BackendResult<()> {
        let body = match alias {
            Some(alias) => json!({ "aliases": { alias: { "is_write_index": true } } }),
            None => json!({}),
        };
        let _: Value = self
            .send_json(self.request(Method::PUT, index).json(&body))
            .await?;
        debug!(index, alias = ?alias, "Index created");
        Ok(())
    }

    async fn put_template(&self, template: &IndexTemplate) -> BackendResult<()> {
        let _: Value = self
            .send_json(
                self.request(Method::PUT, &format!("_index_template/{}", template.name))
                    .json(&template.to_json()),
            )
            .await?;
        Ok(())
    }

    async fn put_script(&self, id: &str, source: &str) -> BackendResult<()> {
        let body = json!({ "script": { "lang": "painless", "source": source } });
        let _: Value = self
            .send_json(self.request(Method::PUT, &format!("_scripts/{id}")).json(&body))
            .await?;
        Ok(())
    }

    async fn rollover(
        &self,
        alias: &str,
        conditions: &RolloverConditions,
    ) -> BackendResult<RolloverOutcome> {
        self.send_json(
            self.request(Method::POST, &format!("{alias}/_rollover"))
                .json(&conditions.to_json()),
        )
        .await
    }

    async fn delete_by_query(
        &self,
        index: &str,
        query: &TaskQuery,
        wait: bool,
    ) -> BackendResult<DeleteByQueryAck> {
        let builder = self
            .request(Method::POST, &format!("{index}/_delete_by_query"))
            .query(&[
                ("conflicts", "proceed"),
                ("wait_for_completion", if wait { "true" } else { "false" }),
            ])
            .json(&json!({ "query": query.to_query_dsl() }));
        self.send_json(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn bulk_body_is_ndjson_pairs() {
        let ops = vec![
            UpsertOperation::new("idx", Task::new("a", TaskStatus::Success)),
            UpsertOperation::new("idx", Task::new("b", TaskStatus::Error)),
        ];
        let body = bulk_body(&ops);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["update"]["_id"], "a");
        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["script"]["id"], MERGE_SCRIPT_ID);
        assert_eq!(doc["upsert"]["status"], "SUCCESS");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn parse_bulk_response_extracts_failures() {
        let body = r#"{"took":3,"errors":true,"items":[
            {"update":{"_index":"i","_id":"a","status":200}},
            {"update":{"_index":"i","_id":"b","status":429,"error":{"type":"es_rejected_execution_exception","reason":"queue full"}}}
        ]}"#;
        let resp = parse_bulk_response(body).unwrap();
        assert_eq!(resp.items.len(), 2);
        assert!(!resp.items[0].is_failure());
        assert_eq!(resp.items[1].error.as_deref(), Some("queue full"));
    }

    #[test]
    fn parse_bulk_response_rejects_garbage() {
        assert!(matches!(
            parse_bulk_response("<html>"),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn search_response_maps_hits() {
        let body = r#"{"_scroll_id":"abc","hits":{"hits":[
            {"_index":"tm-000001","_id":"a","_source":{"id":"a","status":"UNTERMINATED"}}
        ]}}"#;
        let raw: RawSearchResponse = serde_json::from_str(body).unwrap();
        let page: ScrollPage = raw.into();
        assert_eq!(page.scroll_id.as_deref(), Some("abc"));
        assert_eq!(page.hits[0].index, "tm-000001");
        assert_eq!(page.hits[0].task.status, TaskStatus::Unterminated);
    }

    #[test]
    fn new_trims_trailing_slash() {
        let config = BackendConfig {
            url: "http://es:9200/".into(),
            ..BackendConfig::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.base_url, "http://es:9200");
    }
}
