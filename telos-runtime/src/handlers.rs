//! Runtime-registered bridge operations
//!
//! The built-in compute kernels live in the bridge crate; the operations
//! below need the live memory fabric or the bridge itself, so the runtime
//! registers them at initialize. Handlers run on worker threads and stay
//! read-only toward L3: writes go through cognitive operators and their
//! transactions, not through the task ABI.

use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use telos_bridge::{BridgeError, BridgeResult, OperationRegistry, SynapticBridge, TaskContext};
use telos_federation::FederatedMemory;
use telos_kernel::ConceptId;

fn config_u64(ctx: &TaskContext, key: &str) -> BridgeResult<u64> {
    ctx.config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::InvalidTask(format!("missing config.{key}")))
}

fn config_vector(ctx: &TaskContext, key: &str) -> BridgeResult<Vec<f32>> {
    let values = ctx
        .config
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| BridgeError::InvalidTask(format!("missing config.{key}")))?;
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| BridgeError::InvalidTask(format!("non-numeric entry in {key}")))
        })
        .collect()
}

fn worker_error(err: impl std::fmt::Display) -> BridgeError {
    BridgeError::WorkerError {
        message: err.to_string(),
    }
}

/// Register `ann_*`, `federated_memory.*`, and `bridge_metrics.*` against
/// the live fabric and bridge.
pub fn register_runtime_operations(
    registry: &OperationRegistry,
    fabric: FederatedMemory,
    bridge: Weak<SynapticBridge>,
) {
    {
        let fabric = fabric.clone();
        registry.register_fn("ann_search", move |ctx| {
            ctx.check_cancelled()?;
            let query = config_vector(ctx, "query")?;
            let k = config_u64(ctx, "k")? as usize;
            let threshold = ctx
                .config
                .get("threshold")
                .and_then(Value::as_f64)
                .map(|t| t as f32);
            let results = fabric.search(&query, k, threshold).map_err(worker_error)?;
            Ok(json!({
                "results": results
                    .iter()
                    .map(|(id, score)| json!([id.as_u64(), score]))
                    .collect::<Vec<_>>()
            }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("ann_add", move |ctx| {
            ctx.check_cancelled()?;
            let id = ConceptId(config_u64(ctx, "id")?);
            let vector = config_vector(ctx, "vector")?;
            fabric.index().insert(id, vector).map_err(worker_error)?;
            Ok(json!({ "indexed": id.as_u64() }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("ann_update", move |ctx| {
            ctx.check_cancelled()?;
            let id = ConceptId(config_u64(ctx, "id")?);
            let vector = config_vector(ctx, "vector")?;
            fabric.index().update(id, vector).map_err(worker_error)?;
            Ok(json!({ "updated": id.as_u64() }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("ann_remove", move |ctx| {
            ctx.check_cancelled()?;
            let id = ConceptId(config_u64(ctx, "id")?);
            let removed = fabric.index().remove(id).map_err(worker_error)?;
            Ok(json!({ "removed": removed }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("federated_memory.read_vector", move |ctx| {
            ctx.check_cancelled()?;
            let id = ConceptId(config_u64(ctx, "id")?);
            let vector = fabric.read_vector(id).map_err(worker_error)?;
            Ok(json!({ "vector": vector.map(|v| v.as_ref().clone()) }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("federated_memory.search", move |ctx| {
            ctx.check_cancelled()?;
            let query = config_vector(ctx, "query")?;
            let k = config_u64(ctx, "k")? as usize;
            let results = fabric.search(&query, k, None).map_err(worker_error)?;
            Ok(json!({
                "results": results
                    .iter()
                    .map(|(id, score)| json!([id.as_u64(), score]))
                    .collect::<Vec<_>>()
            }))
        });
    }

    {
        let fabric = fabric.clone();
        registry.register_fn("federated_memory.stats", move |ctx| {
            ctx.check_cancelled()?;
            let stats = fabric.stats().map_err(worker_error)?;
            serde_json::to_value(stats).map_err(|e| worker_error(e))
        });
    }

    {
        let bridge = bridge.clone();
        registry.register_fn("bridge_metrics.snapshot", move |ctx| {
            ctx.check_cancelled()?;
            let Some(bridge) = bridge.upgrade() else {
                return Err(BridgeError::BridgeDown);
            };
            serde_json::to_value(bridge.metrics()).map_err(|e| worker_error(e))
        });
    }

    {
        registry.register_fn("bridge_metrics.status", move |ctx| {
            ctx.check_cancelled()?;
            let Some(bridge) = bridge.upgrade() else {
                return Err(BridgeError::BridgeDown);
            };
            serde_json::to_value(bridge.status()).map_err(|e| worker_error(e))
        });
    }
}
