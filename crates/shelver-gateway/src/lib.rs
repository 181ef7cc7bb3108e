//! shelver-gateway — the controller's view of the outside world.
//!
//! Two leaf collaborators are modelled as traits so the lifecycle core can
//! be driven by fakes in tests:
//!
//! ```text
//! ComputeGateway            ObjectStore
//!   ├── start_instance()      └── put_object(container, key, payload)
//!   ├── shelve_instance()
//!   └── instance_status()
//! ```
//!
//! Every call made by the controller goes through [`with_timeout`], so a
//! hung control plane surfaces as [`GatewayError::Timeout`] instead of
//! blocking a background loop.
//!
//! Implementations:
//! - [`CommandComputeGateway`] drives the `openstack` CLI.
//! - [`HttpObjectStore`] PUTs objects to a Swift-compatible endpoint.
//! - [`DirectoryObjectStore`] writes objects below a local directory.
//! - [`fake`] holds in-memory doubles used across the workspace's tests.

pub mod compute;
pub mod error;
pub mod fake;
pub mod object_store;

pub use compute::{CommandComputeGateway, ComputeGateway, PowerState};
pub use error::{GatewayError, GatewayResult, with_timeout};
pub use object_store::{DirectoryObjectStore, HttpObjectStore, ObjectStore};
