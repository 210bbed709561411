//! Algorithm descriptors: the directory, entry script and sandbox directives
//! of one reconstruction algorithm.

pub mod descriptor;

pub use descriptor::{
    AlgorithmDescriptor, Directives, VmResources, DEFAULT_APPTAINER_IMAGE, DEFAULT_DOCKER_IMAGE,
    DEFAULT_TINYRANGE_IMAGE, ENTRY_SCRIPT,
};
