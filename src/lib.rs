//! fixelstats: statistical analysis of fixel-specific measures
//!
//! Whole-brain group statistics on fixel-based diffusion MRI measurements
//! using connectivity-based fixel enhancement (CFE) and non-parametric
//! permutation testing.
//!
//! # Modules
//! - `fixel`: fixel record, sparse mask image, fixel table and voxel index
//! - `msf_io`: sparse fixel image (.msf) reading and writing
//! - `tracks`: streamline (.tck) reading and track-to-voxel mapping
//! - `connectivity`: fixel-fixel connectivity accumulation and finalisation
//! - `subjects`: subject loading and along-tract smoothing
//! - `matrix`: numeric matrix text I/O and small dense linear algebra
//! - `glm`: general linear model fitting and t-statistics
//! - `cfe`: connectivity-based enhancement
//! - `permutation`: permutation engine, null distributions and p-values
//! - `pipeline`: the end-to-end analysis driver

// Core data structures
pub mod fixel;

// I/O modules
pub mod matrix;
pub mod msf_io;
pub mod tracks;

// Analysis stages
pub mod cfe;
pub mod connectivity;
pub mod glm;
pub mod permutation;
pub mod subjects;

// Orchestration
pub mod pipeline;
