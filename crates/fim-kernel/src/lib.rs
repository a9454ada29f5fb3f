// path module
pub mod path;

// schema module
pub mod schema;
pub use schema::{DataType, SchemaTree};

// model module
pub mod model;
pub use model::{DataInstance, ModelInstance, PrimitiveValue, ReadonlyInstance};

// mapping module
pub mod mapping;
pub use mapping::{MappingRuleRaw, ModelConverter};

// error module
pub mod error;
pub use error::*;

// connector contracts
pub mod connector;

// dispatch contracts
pub mod dispatch;

// bus module
pub mod bus;

// config module
pub mod config;
