//! Dataset grouper for BIDS multi-echo gradient-echo data.
//!
//! Walks a dataset tree, classifies every file by the naming grammar and
//! emits an ordered list of [`WorkUnit`]s, each bundling the raw images,
//! sidecars and pre-existing derivatives of one acquisition.
//!
//! # Example
//!
//! ```ignore
//! use qsm_ci::bids::{FieldDirectionMap, Grouper};
//!
//! let directions = FieldDirectionMap::load(Path::new("qsm-forward-params.json"))?;
//! let grouping = Grouper::new().with_field_directions(directions).run(Path::new("bids"))?;
//! for unit in &grouping.units {
//!     println!("{} ({} echoes)", unit.key(), unit.echo_times.len());
//! }
//! ```

pub mod derivatives;
pub mod entities;
pub mod grouper;
pub mod selection;
pub mod sidecar;
pub mod work_unit;

pub use derivatives::{attachment_policy, AttachmentPolicy, PendingDerivative};
pub use entities::{EntityParser, FileEntities, FileKind, Part};
pub use grouper::{group, save_groups, Grouper, Grouping, GroupingContext};
pub use selection::{select_units, DatasetFamily, RunSelection, RunSelectionError};
pub use sidecar::{FieldDirectionMap, SidecarMetadata};
pub use work_unit::{MaskPaths, UnitKey, WorkUnit, DEFAULT_FIELD_DIRECTION};
