//! Connection settings and the model registry.

pub mod connection;
pub mod model;
pub mod registry;

pub use connection::{ConnectionSettings, DatabaseKind, DriverMode, IsolationLevel};
pub use model::{
    Capabilities, ColumnDef, ColumnDefault, ColumnType, FieldSet, Model, ModelDescriptor,
    SORT_MODEL, SORT_PRIMARY_KEY, SORT_SOFT_DELETE, SORT_TIMESTAMPS, SORT_USER_AUDIT, snake_case,
};
pub use registry::{DiscoveryScope, ModelRegistry, ModelSource, RegistryHandle, StaticModelSource};
