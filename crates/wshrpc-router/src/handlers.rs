//! Commands served by the router process itself.
//!
//! Object metadata lives in an in-memory store keyed by object reference;
//! the streaming commands exist so frontends can exercise each call type
//! against a live router.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sysinfo::System;
use tracing::info;
use wshrpc_core::types::{
    command, CommandGetMetaData, CommandMessageData, CommandSetMetaData, CpuDataRequest,
    FileInfo, MetaMapType, ORef, TimeSeriesData, TIME_SERIES_CPU,
};
use wshrpc_core::{HandlerRegistry, RpcError};

/// Number of elements `streamtest` emits.
pub const STREAM_TEST_COUNT: u64 = 5;
const STREAM_TEST_INTERVAL: Duration = Duration::from_millis(100);

/// In-memory object metadata.
#[derive(Debug, Default)]
pub struct MetaStore {
    objects: RwLock<HashMap<ORef, MetaMapType>>,
}

impl MetaStore {
    pub fn get(&self, oref: &ORef) -> MetaMapType {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(oref)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge `meta` into the object's map; `null` values delete keys.
    pub fn merge(&self, oref: ORef, meta: MetaMapType) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let entry = objects.entry(oref).or_default();
        for (key, value) in meta {
            if value.is_null() {
                entry.remove(&key);
            } else {
                entry.insert(key, value);
            }
        }
    }
}

fn require_oref(oref: &ORef) -> anyhow::Result<()> {
    if oref.is_empty() {
        anyhow::bail!("oref is required");
    }
    Ok(())
}

/// Register every command this process serves.
pub fn register(handlers: &HandlerRegistry, store: Arc<MetaStore>) {
    let get_store = store.clone();
    handlers.register_call(command::GET_META, move |_ctx, req: CommandGetMetaData| {
        let store = get_store.clone();
        async move {
            require_oref(&req.oref)?;
            anyhow::Ok(store.get(&req.oref))
        }
    });

    handlers.register_call(command::SET_META, move |_ctx, req: CommandSetMetaData| {
        let store = store.clone();
        async move {
            require_oref(&req.oref)?;
            store.merge(req.oref, req.meta);
            anyhow::Ok(())
        }
    });

    handlers.register_call(command::MESSAGE, |ctx, req: CommandMessageData| async move {
        info!(
            "message from {} [{}]: {}",
            ctx.source.as_deref().unwrap_or("-"),
            req.oref,
            req.message
        );
        anyhow::Ok(())
    });

    handlers.register_call(command::TEST, |_ctx, data: Value| async move { anyhow::Ok(data) });

    handlers.register_call(command::REMOTE_FILE_INFO, |_ctx, path: String| async move {
        anyhow::Ok(file_info(&path).await?)
    });

    handlers.register_response_stream(command::STREAM_TEST, |_ctx, _data: Value, sink| async move {
        for i in 1..=STREAM_TEST_COUNT {
            sink.send(i).await?;
            tokio::time::sleep(STREAM_TEST_INTERVAL).await;
        }
        anyhow::Ok(())
    });

    handlers.register_response_stream(
        command::STREAM_CPU_DATA,
        |_ctx, req: CpuDataRequest, sink| async move {
            let mut system = System::new();
            system.refresh_cpu_usage();
            let mut sent = 0;
            while req.count == 0 || sent < req.count {
                tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_secs(1)))
                    .await;
                system.refresh_cpu_usage();
                let sample = TimeSeriesData {
                    ts: Utc::now().timestamp_millis(),
                    values: HashMap::from([(
                        TIME_SERIES_CPU.to_string(),
                        f64::from(system.global_cpu_usage()),
                    )]),
                };
                sink.send(sample).await?;
                sent += 1;
            }
            anyhow::Ok(())
        },
    );
}

async fn file_info(path: &str) -> Result<FileInfo, RpcError> {
    let p = Path::new(path);
    let mut info = FileInfo {
        path: path.to_string(),
        dir: p
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default(),
        name: p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        ..FileInfo::default()
    };

    let meta = match tokio::fs::metadata(p).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info.not_found = true;
            return Ok(info);
        }
        Err(e) => return Err(e.into()),
    };

    info.size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
    info.is_dir = meta.is_dir();
    info.read_only = meta.permissions().readonly();
    info.mod_time = meta
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or_default();
    if info.is_dir {
        info.mime_type = "directory".to_string();
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wshrpc_core::{Router, RouterOptions, RpcClient, RpcContext, RpcOpts};

    async fn setup() -> (Arc<wshrpc_core::Router>, RpcClient) {
        let router = Router::new(RouterOptions::default());
        register(router.handlers(), Arc::new(MetaStore::default()));
        router.start();
        let client = RpcClient::new(router.connect_local().unwrap());
        client
            .connect(RpcContext::block_controller("b1"))
            .await
            .unwrap();
        (router, client)
    }

    #[test]
    fn test_merge_deletes_null_keys() {
        let store = MetaStore::default();
        let oref = ORef::block("b1");
        let meta = json!({"view": "term", "title": "x"});
        store.merge(oref.clone(), meta.as_object().cloned().unwrap());
        let patch = json!({"title": null});
        store.merge(oref.clone(), patch.as_object().cloned().unwrap());
        assert_eq!(Value::Object(store.get(&oref)), json!({"view": "term"}));
    }

    #[tokio::test]
    async fn test_setmeta_then_getmeta_uses_block_context() {
        let (_router, client) = setup().await;
        let _: Value = client
            .call(command::SET_META, json!({"meta": {"view": "term"}}), RpcOpts::default())
            .await
            .unwrap();
        let meta: Value = client
            .call(command::GET_META, json!({}), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(meta, json!({"view": "term"}));
    }

    #[tokio::test]
    async fn test_getmeta_without_context_is_rejected() {
        let router = Router::new(RouterOptions::default());
        register(router.handlers(), Arc::new(MetaStore::default()));
        router.start();
        let client = RpcClient::new(router.connect_local().unwrap());
        client.connect(RpcContext::default()).await.unwrap();

        let err = client
            .call::<Value>(command::GET_META, json!({}), RpcOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), wshrpc_core::ErrorKind::HandlerError);
        assert_eq!(err.to_string(), "oref is required");
    }

    #[tokio::test]
    async fn test_streamtest_emits_sequence() {
        let (_router, client) = setup().await;
        let mut stream = client
            .response_stream(command::STREAM_TEST, Value::Null, RpcOpts::default())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(item) = stream.recv_as::<u64>().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, (1..=STREAM_TEST_COUNT).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_remote_file_info_missing_path() {
        let (_router, client) = setup().await;
        let info: FileInfo = client
            .call(
                command::REMOTE_FILE_INFO,
                "/definitely/not/here.txt",
                RpcOpts::default(),
            )
            .await
            .unwrap();
        assert!(info.not_found);
        assert_eq!(info.name, "here.txt");
    }
}
