//! Resumable builder for device images.
//!
//! An image is produced by running the ordered steps of one flavor through a
//! [`Machine`]. Progress is recorded after every step so an interrupted or
//! deliberately bounded build can be picked up again later.
//!
//! - **Machine** - step ordering, `--until`/`--thru` bounds, resume metadata
//! - **Assertions** - model assertion decoding and validation
//! - **Flavors** - snap (Ubuntu Core) and classic step lists and setup
//!
//! # Architecture
//!
//! ```text
//! image-builder (binary)
//!     │
//!     ├── Builds: CommonOptions + SnapOptions / ClassicOptions
//!     └── Runs:   Machine::new -> setup -> run
//!
//! machine ──────────────────────┐
//!     │                         │
//!     ├── Drives: Box<dyn Flavor>
//!     ├── Persists: build-state.json in the workdir
//!     └── Locks:  .build.lock while running
//!
//! flavor::snap / flavor::classic
//!     │
//!     ├── Uses: assertion, gadget, disk, filesystem, host
//!     └── Defines: the step list and setup hooks
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use image_builder::flavor::{SnapFlavor, SnapOptions};
//! use image_builder::{CommonOptions, Machine};
//!
//! # fn main() -> image_builder::Result<()> {
//! let flavor = SnapFlavor::new(SnapOptions {
//!     model: "pc-amd64.model".into(),
//!     ..Default::default()
//! });
//! let common = CommonOptions {
//!     workdir: Some("/tmp/pc-build".into()),
//!     thru: Some("prepare_image".into()),
//!     ..Default::default()
//! };
//! let mut machine = Machine::new(common, Box::new(flavor))?;
//! machine.setup()?;
//! machine.run()?;
//! # Ok(())
//! # }
//! ```

pub mod assertion;
pub mod disk;
pub mod error;
pub mod filesystem;
pub mod flavor;
pub mod gadget;
pub mod host;
pub mod machine;
pub mod validate;

pub use assertion::ModelAssertion;
pub use error::{Error, Phase, Result};
pub use machine::{CommonOptions, Flavor, Machine, Status, Step, StepList};
