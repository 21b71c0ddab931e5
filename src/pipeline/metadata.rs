//! Metadata refresher task.
//!
//! Consumes the observation-metadata topic for the lifetime of the process
//! and keeps the shared registry fresh. Runs concurrently with the inference
//! loop; the registry is the only object shared between them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::pipeline::consumer::EventSource;
use crate::schemas::metadata::ObserveMetaRegistry;

/// Spawns the background refresher. The task never ends on its own; process
/// teardown takes it down.
pub fn spawn_metadata_refresher<S>(
    mut source: S,
    registry: Arc<ObserveMetaRegistry>,
) -> JoinHandle<()>
where
    S: EventSource + 'static,
{
    tokio::spawn(async move {
        tracing::info!("metadata refresher started");
        loop {
            match source.poll().await {
                Ok(Some(payload)) => {
                    let data: Value = match serde_json::from_slice(&payload) {
                        Ok(data) => data,
                        Err(err) => {
                            tracing::warn!("invalid metadata message: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = registry.apply_update(&data) {
                        tracing::debug!("{err}");
                    }
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(err) => {
                    tracing::warn!("{err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::consumer::VecEventSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_refresher_applies_updates() {
        let registry = Arc::new(ObserveMetaRegistry::new("gala_gopher"));
        let payload = json!({
            "entity_name": "proc",
            "keys": ["machine_id", "tgid"],
            "metrics": ["gala_gopher_proc_cpu_util"],
        })
        .to_string()
        .into_bytes();

        let source = VecEventSource::new([payload, b"garbage".to_vec()]);
        let handle = spawn_metadata_refresher(source, registry.clone());

        // the drained source keeps returning None; poll until the update
        // lands, then stop the task
        for _ in 0..100 {
            if registry.get("proc").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        let meta = registry.get("proc").expect("metadata update applied");
        assert_eq!(meta.keys.len(), 2);
    }
}
