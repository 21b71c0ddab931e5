//! Minimal ArangoDB client over the HTTP cursor API.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{InferError, Result};

/// ArangoDB error number for queries over a collection that does not exist
/// at the requested snapshot.
pub const ERR_COLLECTION_NOT_FOUND: i64 = 1203;

#[derive(Debug, Deserialize)]
struct CursorResponse {
    #[serde(default)]
    error: bool,
    #[serde(default, rename = "errorNum")]
    error_num: i64,
    #[serde(default, rename = "errorMessage")]
    error_message: String,
    #[serde(default)]
    result: Vec<Value>,
    #[serde(default, rename = "hasMore")]
    has_more: bool,
    #[serde(default)]
    id: String,
}

/// One AQL endpoint, bound to a database.
#[derive(Debug, Clone)]
pub struct ArangoClient {
    http: reqwest::Client,
    base_url: String,
    db_name: String,
}

impl ArangoClient {
    pub fn new(base_url: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            db_name: db_name.into(),
        }
    }

    fn cursor_url(&self) -> String {
        format!(
            "{}/_db/{}/_api/cursor",
            self.base_url.trim_end_matches('/'),
            self.db_name
        )
    }

    /// Runs an AQL query and drains the cursor.
    pub async fn query(&self, aql: &str, bind_vars: Value) -> Result<Vec<Value>> {
        let body = json!({
            "query": aql,
            "bindVars": bind_vars,
            "batchSize": 1000,
        });
        let resp = self
            .http
            .post(self.cursor_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| InferError::Db(format!("arangodb request failed: {e}")))?;
        let mut cursor: CursorResponse = resp
            .json()
            .await
            .map_err(|e| InferError::Db(format!("invalid arangodb response: {e}")))?;
        if cursor.error {
            return Err(api_error(&cursor));
        }

        let mut rows = std::mem::take(&mut cursor.result);
        while cursor.has_more {
            let url = format!("{}/{}", self.cursor_url(), cursor.id);
            let resp = self
                .http
                .put(url)
                .send()
                .await
                .map_err(|e| InferError::Db(format!("arangodb cursor read failed: {e}")))?;
            cursor = resp
                .json()
                .await
                .map_err(|e| InferError::Db(format!("invalid arangodb response: {e}")))?;
            if cursor.error {
                return Err(api_error(&cursor));
            }
            rows.append(&mut cursor.result);
        }
        Ok(rows)
    }

    /// Like [`query`](Self::query) but treats a missing collection as an
    /// empty result rather than an error.
    pub async fn query_optional_collection(
        &self,
        aql: &str,
        bind_vars: Value,
    ) -> Result<Vec<Value>> {
        match self.query(aql, bind_vars).await {
            Ok(rows) => Ok(rows),
            Err(InferError::Db(msg)) if is_missing_collection(&msg) => {
                tracing::debug!("{msg}");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

fn api_error(cursor: &CursorResponse) -> InferError {
    InferError::Db(format!(
        "arangodb query failed (errorNum={}): {}",
        cursor.error_num, cursor.error_message
    ))
}

fn is_missing_collection(msg: &str) -> bool {
    msg.contains(&format!("errorNum={ERR_COLLECTION_NOT_FOUND}"))
}
