//! # TELOS SHM - Handle Table
//!
//! Process-wide registry of shared-memory segments with reference-counted
//! lifetime and capability tokens. Handles are the only cross-component
//! mutable resource in TELOS; their reference-count discipline is the sole
//! mechanism coordinating shared-memory lifetime.
//!
//! ## Contract
//!
//! - `allocate` creates a segment with reference count 1
//! - `retain` / `release` adjust the count; the release that drops it to
//!   zero unregisters the segment before returning
//! - `map` after the final `release` fails with `HandleExpired`
//! - concurrent `map` calls return independent views over the same bytes
//! - segment names are globally unique within a process generation
//! - a reaper releases segments orphaned by crashed owners
//!
//! ## Example
//!
//! ```
//! use telos_shm::HandleTable;
//! use telos_kernel::Dtype;
//!
//! let table = HandleTable::new();
//! let owner = table.register_owner();
//! let handle = table.allocate(128, Dtype::F32, owner).unwrap();
//!
//! let view = table.map(handle.href()).unwrap();
//! view.fill_f32(1.0).unwrap();
//! assert_eq!(view.read_f32().unwrap()[0], 1.0);
//!
//! table.release(handle.href()).unwrap();
//! assert!(table.map(handle.href()).is_err());
//! ```

mod table;
mod view;

pub use table::{HandleTable, OwnerToken, SharedHandle, ShmError, ShmStats};
pub use view::SegmentView;

/// Result type for handle table operations
pub type Result<T> = std::result::Result<T, ShmError>;
