//! Server-side filter route over the `modelfiles` collection.

use serde_json::Value;
use steve_core::FindOptions;
use steve_store::ResourceStore;
use tracing::info;

use crate::ApiResult;

/// Fields a query is matched against, as JSON pointers.
const SEARCH_FIELDS: &[&str] = &["/id", "/status/model", "/status/modelID", "/status/byteSize"];

/// Keep records where any searched field contains `q`, ignoring case. An
/// absent or blank query keeps everything.
pub fn filter_modelfiles(records: Vec<Value>, q: Option<&str>) -> Vec<Value> {
    let Some(q) = q.map(str::trim).filter(|q| !q.is_empty()) else {
        return records;
    };
    let needle = q.to_lowercase();
    records
        .into_iter()
        .filter(|r| {
            SEARCH_FIELDS.iter().any(|ptr| match r.pointer(ptr) {
                Some(Value::String(s)) => s.to_lowercase().contains(&needle),
                Some(Value::Number(n)) => n.to_string().contains(&needle),
                _ => false,
            })
        })
        .collect()
}

/// `findAll("modelfiles")` followed by [`filter_modelfiles`].
pub async fn list_modelfiles(store: &ResourceStore, q: Option<&str>) -> ApiResult<Vec<Value>> {
    let all = store.find_all("modelfiles", &FindOptions::default()).await?;
    let total = all.len();
    let records: Vec<Value> = all.iter().map(|r| r.data().as_ref().clone()).collect();
    let out = filter_modelfiles(records, q);
    info!(total, matched = out.len(), q = %q.unwrap_or(""), "api: modelfiles ok");
    Ok(out)
}
