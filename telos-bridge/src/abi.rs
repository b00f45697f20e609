//! Task ABI - the wire protocol of the synaptic bridge
//!
//! Each frame is a length-prefixed (u32 little-endian), schema-tagged
//! bincode record. Nested structured payloads travel as UTF-8 JSON text
//! inside the binary envelope, because the envelope codec is
//! non-self-describing. Handle descriptors carry `{name, dtype, shape}`
//! with row-major shapes.

use crate::error::{BridgeError, BridgeResult};
use crate::task::{Task, TaskResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use telos_kernel::{Dtype, HandleRef};

/// Current ABI version tag
pub const ABI_VERSION: u16 = 1;

/// Maximum accepted frame body, guarding against corrupt length prefixes
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Wire descriptor for a shared-memory handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHandle {
    /// Segment name
    pub name: String,
    /// Element dtype tag (`f32`, `f64`, `i32`, `i64`, `u8`)
    pub dtype: String,
    /// Row-major shape; product is the element count
    pub shape: Vec<u64>,
}

impl WireHandle {
    /// Build a descriptor from a runtime handle (one-dimensional shape)
    pub fn from_href(href: &HandleRef) -> Self {
        Self {
            name: href.name.clone(),
            dtype: href.dtype.as_str().to_string(),
            shape: vec![href.element_count as u64],
        }
    }

    /// Convert back into a runtime handle reference
    pub fn to_href(&self) -> BridgeResult<HandleRef> {
        let dtype = Dtype::parse(&self.dtype)
            .ok_or_else(|| BridgeError::InvalidTask(format!("unknown dtype {}", self.dtype)))?;
        let element_count: u64 = self.shape.iter().product();
        Ok(HandleRef {
            name: self.name.clone(),
            dtype,
            element_count: element_count as usize,
        })
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFrame {
    /// ABI version; frames with an unknown version are rejected
    pub version: u16,
    /// Operation tag from the closed registry
    pub operation: String,
    /// Configuration payload as JSON text
    pub config_json: String,
    /// Input handle descriptors
    pub input_handles: Vec<WireHandle>,
    /// Pre-allocated output handle descriptors
    pub output_handles: Vec<WireHandle>,
    /// Deadline in milliseconds from receipt
    pub deadline_ms: u32,
    /// Correlation id
    pub correlation_id: u64,
}

impl TaskFrame {
    /// Build a frame from a runtime task
    pub fn from_task(task: &Task) -> BridgeResult<Self> {
        Ok(Self {
            version: ABI_VERSION,
            operation: task.operation.clone(),
            config_json: serde_json::to_string(&task.config)
                .map_err(|e| BridgeError::InvalidTask(e.to_string()))?,
            input_handles: task.input_handles.iter().map(WireHandle::from_href).collect(),
            output_handles: task.output_handles.iter().map(WireHandle::from_href).collect(),
            deadline_ms: task.deadline.as_millis().min(u32::MAX as u128) as u32,
            correlation_id: task.correlation_id,
        })
    }

    /// Reconstruct a runtime task (interactive priority by default)
    pub fn into_task(self) -> BridgeResult<Task> {
        if self.version != ABI_VERSION {
            return Err(BridgeError::InvalidTask(format!(
                "unsupported ABI version {}",
                self.version
            )));
        }
        let config = serde_json::from_str(&self.config_json)
            .map_err(|e| BridgeError::InvalidTask(e.to_string()))?;
        let input_handles = self
            .input_handles
            .iter()
            .map(WireHandle::to_href)
            .collect::<BridgeResult<Vec<_>>>()?;
        let output_handles = self
            .output_handles
            .iter()
            .map(WireHandle::to_href)
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Task {
            operation: self.operation,
            config,
            input_handles,
            output_handles,
            deadline: std::time::Duration::from_millis(self.deadline_ms as u64),
            correlation_id: self.correlation_id,
            priority: crate::task::Priority::Interactive,
        })
    }
}

/// Response envelope, sharing the request frame's outer layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseFrame {
    /// Successful completion
    Ok {
        /// Operation payload as JSON text
        payload_json: String,
        /// Populated output descriptors
        output_handles: Vec<WireHandle>,
        /// Correlation id echoed from the request
        correlation_id: u64,
    },
    /// Failure in the closed taxonomy
    Err {
        /// Wire tag of the error kind
        kind: String,
        /// Human-readable message
        message: String,
        /// Verbatim worker trace, if one was captured
        worker_trace: Option<String>,
        /// Correlation id echoed from the request
        correlation_id: u64,
    },
}

impl ResponseFrame {
    /// Build an `Ok` response from a runtime result
    pub fn ok(result: &TaskResult) -> BridgeResult<Self> {
        Ok(ResponseFrame::Ok {
            payload_json: serde_json::to_string(&result.payload)
                .map_err(|e| BridgeError::InvalidTask(e.to_string()))?,
            output_handles: result
                .output_handles
                .iter()
                .map(WireHandle::from_href)
                .collect(),
            correlation_id: result.correlation_id,
        })
    }

    /// Build an `Err` response from a bridge error
    pub fn err(error: &BridgeError, correlation_id: u64, trace: Option<String>) -> Self {
        ResponseFrame::Err {
            kind: error.wire_kind().to_string(),
            message: error.to_string(),
            worker_trace: trace,
            correlation_id,
        }
    }
}

/// Encode a frame with its u32 little-endian length prefix
pub fn encode_frame<T: Serialize>(frame: &T) -> BridgeResult<Vec<u8>> {
    let body =
        bincode::serialize(frame).map_err(|e| BridgeError::InvalidTask(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a length-prefixed frame; returns the frame and bytes consumed
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> BridgeResult<(T, usize)> {
    if bytes.len() < 4 {
        return Err(BridgeError::InvalidTask("truncated frame prefix".to_string()));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(BridgeError::InvalidTask(format!("frame length {len} exceeds cap")));
    }
    let end = 4 + len as usize;
    if bytes.len() < end {
        return Err(BridgeError::InvalidTask("truncated frame body".to_string()));
    }
    let frame = bincode::deserialize(&bytes[4..end])
        .map_err(|e| BridgeError::InvalidTask(e.to_string()))?;
    Ok((frame, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sample_task() -> Task {
        Task::builder("vsa_bind")
            .config(json!({"dimensions": 128}))
            .input(HandleRef {
                name: "seg-a".into(),
                dtype: Dtype::F32,
                element_count: 128,
            })
            .output(HandleRef {
                name: "seg-out".into(),
                dtype: Dtype::F32,
                element_count: 128,
            })
            .deadline(Duration::from_millis(2500))
            .correlation_id(42)
            .build()
    }

    #[test]
    fn task_frame_round_trip() {
        let task = sample_task();
        let frame = TaskFrame::from_task(&task).unwrap();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, consumed): (TaskFrame, usize) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);

        let back = decoded.into_task().unwrap();
        assert_eq!(back.operation, task.operation);
        assert_eq!(back.config, task.config);
        assert_eq!(back.input_handles, task.input_handles);
        assert_eq!(back.correlation_id, 42);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut frame = TaskFrame::from_task(&sample_task()).unwrap();
        frame.version = 99;
        assert!(frame.into_task().is_err());
    }

    #[test]
    fn truncated_frames_rejected() {
        let frame = TaskFrame::from_task(&sample_task()).unwrap();
        let bytes = encode_frame(&frame).unwrap();
        assert!(decode_frame::<TaskFrame>(&bytes[..2]).is_err());
        assert!(decode_frame::<TaskFrame>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn multi_dim_shape_products_to_element_count() {
        let wire = WireHandle {
            name: "m".into(),
            dtype: "f64".into(),
            shape: vec![4, 32],
        };
        let href = wire.to_href().unwrap();
        assert_eq!(href.element_count, 128);
        assert_eq!(href.dtype, Dtype::F64);
    }

    #[test]
    fn error_response_carries_wire_kind() {
        let resp = ResponseFrame::err(&BridgeError::Timeout, 7, None);
        let bytes = encode_frame(&resp).unwrap();
        let (decoded, _): (ResponseFrame, usize) = decode_frame(&bytes).unwrap();
        match decoded {
            ResponseFrame::Err { kind, correlation_id, .. } => {
                assert_eq!(kind, "timeout");
                assert_eq!(correlation_id, 7);
            }
            _ => panic!("expected error frame"),
        }
    }
}
