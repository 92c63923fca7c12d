pub mod generation;
pub mod instance;
pub mod migration;
pub mod patch;
pub mod registry;

pub use generation::{GenerationIterator, ReflectionSystem, GENERATOR_NAME_PREFIX};
pub use instance::RawInstance;
pub use migration::{
    FieldAction, FieldPlan, MigrationSeed, NumericConversion, StructMigrator, StructPlan,
};
pub use patch::{Patch, PatchBuilder, PatchWrite};
pub use registry::{
    Archetype, Argument, EnumType, EnumValue, Field, FunctionCall, FunctionType, FunctionValue,
    Lifecycle, Meta, NumericFamily, Registry, StructType,
};
