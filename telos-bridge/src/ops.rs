//! Built-in compute operations
//!
//! The numeric kernels every deployment carries: hyperdimensional
//! bind/unbind/cleanup over f32 buffers and a deterministic local text
//! embedding. ANN and federated-memory operations are registered by the
//! runtime against the live memory fabric, not here.

use crate::error::{BridgeError, BridgeResult};
use crate::registry::{OperationRegistry, TaskContext};
use serde_json::{json, Value};

/// Reciprocals below this magnitude are treated as zero during unbind
const UNBIND_EPSILON: f32 = 1e-12;

/// Register the built-in kernels into a registry
pub fn register_builtins(registry: &OperationRegistry) {
    registry.register_fn("vsa_bind", vsa_bind);
    registry.register_fn("vsa_unbind", vsa_unbind);
    registry.register_fn("vsa_cleanup", vsa_cleanup);
    registry.register_fn("embed_text", embed_text);
}

fn binary_inputs(ctx: &TaskContext) -> BridgeResult<(Vec<f32>, Vec<f32>)> {
    let a = ctx.input(0)?.read_f32()?;
    let b = ctx.input(1)?.read_f32()?;
    if a.len() != b.len() {
        return Err(BridgeError::InvalidTask(format!(
            "operand lengths differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok((a, b))
}

/// Elementwise (Hadamard) binding of two hypervectors
fn vsa_bind(ctx: &mut TaskContext) -> BridgeResult<Value> {
    ctx.check_cancelled()?;
    let (a, b) = binary_inputs(ctx)?;
    let bound: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x * y).collect();
    ctx.output(0)?.write_f32(&bound)?;
    Ok(json!({ "elements": bound.len() }))
}

/// Unbind a key from a bound hypervector via the elementwise inverse
fn vsa_unbind(ctx: &mut TaskContext) -> BridgeResult<Value> {
    ctx.check_cancelled()?;
    let (bound, key) = binary_inputs(ctx)?;
    let recovered: Vec<f32> = bound
        .iter()
        .zip(&key)
        .map(|(v, k)| if k.abs() < UNBIND_EPSILON { 0.0 } else { v / k })
        .collect();
    ctx.output(0)?.write_f32(&recovered)?;
    Ok(json!({ "elements": recovered.len() }))
}

/// Snap a noisy hypervector onto the bipolar codebook
fn vsa_cleanup(ctx: &mut TaskContext) -> BridgeResult<Value> {
    ctx.check_cancelled()?;
    let noisy = ctx.input(0)?.read_f32()?;
    let mut flipped = 0usize;
    let clean: Vec<f32> = noisy
        .iter()
        .map(|v| {
            let snapped = if *v > 0.0 {
                1.0
            } else if *v < 0.0 {
                -1.0
            } else {
                0.0
            };
            if snapped != *v {
                flipped += 1;
            }
            snapped
        })
        .collect();
    ctx.output(0)?.write_f32(&clean)?;
    Ok(json!({ "elements": clean.len(), "snapped": flipped }))
}

/// Deterministic local embedding of a text into the output buffer.
///
/// The embedding is seeded from the text digest, so identical texts always
/// embed identically; the result is L2-normalized.
fn embed_text(ctx: &mut TaskContext) -> BridgeResult<Value> {
    ctx.check_cancelled()?;
    let text = ctx
        .config
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidTask("embed_text requires config.text".to_string()))?;

    let out = ctx.output(0)?;
    let dimensions = out.href().element_count;
    if dimensions == 0 {
        return Err(BridgeError::InvalidTask("embed_text output is empty".to_string()));
    }

    let digest = blake3::hash(text.as_bytes());
    let seed = u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap_or_default());
    let mut rng = fastrand::Rng::with_seed(seed);

    let mut embedding: Vec<f32> = (0..dimensions)
        .map(|_| rng.f32() * 2.0 - 1.0)
        .collect();
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut embedding {
            *v /= norm;
        }
    }
    out.write_f32(&embedding)?;
    Ok(json!({ "dimensions": dimensions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use telos_kernel::Dtype;
    use telos_shm::{HandleTable, SegmentView};

    struct Fixture {
        table: HandleTable,
        owner: telos_shm::OwnerToken,
    }

    impl Fixture {
        fn new() -> Self {
            let table = HandleTable::new();
            let owner = table.register_owner();
            Self { table, owner }
        }

        fn seg(&self, data: &[f32]) -> SegmentView {
            let h = self
                .table
                .allocate(data.len(), Dtype::F32, self.owner)
                .unwrap();
            let view = self.table.map(h.href()).unwrap();
            view.write_f32(data).unwrap();
            view
        }

        fn ctx(&self, config: Value, inputs: Vec<SegmentView>, outputs: Vec<SegmentView>) -> TaskContext {
            TaskContext::new(config, 0, inputs, outputs, Arc::new(AtomicBool::new(false)))
        }
    }

    #[test]
    fn bind_is_elementwise_product() {
        let f = Fixture::new();
        let mut ctx = f.ctx(
            Value::Null,
            vec![f.seg(&[1.0, -2.0, 3.0]), f.seg(&[2.0, 2.0, -1.0])],
            vec![f.seg(&[0.0; 3])],
        );
        vsa_bind(&mut ctx).unwrap();
        assert_eq!(ctx.output(0).unwrap().read_f32().unwrap(), vec![2.0, -4.0, -3.0]);
    }

    #[test]
    fn unbind_recovers_bound_operand() {
        let f = Fixture::new();
        let a = [0.5f32, -1.5, 2.0, 4.0];
        let key = [2.0f32, 0.5, -1.0, 0.25];
        let bound: Vec<f32> = a.iter().zip(&key).map(|(x, y)| x * y).collect();

        let mut ctx = f.ctx(
            Value::Null,
            vec![f.seg(&bound), f.seg(&key)],
            vec![f.seg(&[0.0; 4])],
        );
        vsa_unbind(&mut ctx).unwrap();
        let recovered = ctx.output(0).unwrap().read_f32().unwrap();
        for (r, expected) in recovered.iter().zip(&a) {
            assert!((r - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn unbind_guards_zero_keys() {
        let f = Fixture::new();
        let mut ctx = f.ctx(
            Value::Null,
            vec![f.seg(&[1.0, 2.0]), f.seg(&[0.0, 2.0])],
            vec![f.seg(&[9.0, 9.0])],
        );
        vsa_unbind(&mut ctx).unwrap();
        assert_eq!(ctx.output(0).unwrap().read_f32().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn cleanup_snaps_to_bipolar() {
        let f = Fixture::new();
        let mut ctx = f.ctx(
            Value::Null,
            vec![f.seg(&[0.3, -0.7, 0.0, 1.0])],
            vec![f.seg(&[0.0; 4])],
        );
        let payload = vsa_cleanup(&mut ctx).unwrap();
        assert_eq!(ctx.output(0).unwrap().read_f32().unwrap(), vec![1.0, -1.0, 0.0, 1.0]);
        assert_eq!(payload["snapped"], 2);
    }

    #[test]
    fn mismatched_operands_rejected() {
        let f = Fixture::new();
        let mut ctx = f.ctx(
            Value::Null,
            vec![f.seg(&[1.0, 2.0]), f.seg(&[1.0])],
            vec![f.seg(&[0.0; 2])],
        );
        assert!(matches!(vsa_bind(&mut ctx), Err(BridgeError::InvalidTask(_))));
    }

    #[test]
    fn embed_text_is_deterministic_and_normalized() {
        let f = Fixture::new();
        let config = json!({"text": "the entropic garden"});
        let mut ctx1 = f.ctx(config.clone(), vec![], vec![f.seg(&[0.0; 64])]);
        let mut ctx2 = f.ctx(config, vec![], vec![f.seg(&[0.0; 64])]);
        embed_text(&mut ctx1).unwrap();
        embed_text(&mut ctx2).unwrap();

        let e1 = ctx1.output(0).unwrap().read_f32().unwrap();
        let e2 = ctx2.output(0).unwrap().read_f32().unwrap();
        assert_eq!(e1, e2);

        let norm: f32 = e1.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn embed_text_requires_text() {
        let f = Fixture::new();
        let mut ctx = f.ctx(json!({}), vec![], vec![f.seg(&[0.0; 8])]);
        assert!(matches!(embed_text(&mut ctx), Err(BridgeError::InvalidTask(_))));
    }
}
