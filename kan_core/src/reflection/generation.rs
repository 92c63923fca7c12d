//! Reflection generation driver.
//!
//! Produces the current registry at startup and on explicit invalidation.
//! Population and finalization callbacks run serially; per-iteration work is
//! dispatched as one parallel task per connection and per discovered
//! generator, with a strict barrier between iterations. Tasks submit new
//! descriptors through a [`GenerationIterator`], which appends into the
//! this-iteration queues under a lock; the loop exits when a full iteration
//! produces nothing.

use crate::interning::{intern, InternedString};
use crate::reflection::instance::RawInstance;
use crate::reflection::migration::{MigrationSeed, StructMigrator};
use crate::reflection::registry::{
    Archetype, EnumType, FunctionType, FunctionValue, Meta, Registry, StructType,
};
use derivative::Derivative;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, trace};

/// Structs named `kan_reflection_generator_<NAME>[_t]` are picked up as
/// generators; companion functions share the prefix.
pub const GENERATOR_NAME_PREFIX: &str = "kan_reflection_generator_";

#[derive(Error, Debug)]
pub enum FunctorMismatch {
    #[error("function \"{name}\" must take exactly {expected} arguments")]
    ArgumentCount {
        name: InternedString,
        expected: usize,
    },
    #[error("function \"{name}\" argument {index} has an unexpected archetype")]
    ArgumentArchetype {
        name: InternedString,
        index: usize,
    },
}

#[derive(Default)]
pub(crate) struct PendingQueues {
    added_enums: Vec<Arc<EnumType>>,
    added_structs: Vec<Arc<StructType>>,
    added_functions: Vec<Arc<FunctionType>>,
    changed_enums: Vec<Arc<EnumType>>,
    changed_structs: Vec<Arc<StructType>>,
    changed_functions: Vec<Arc<FunctionType>>,

    added_enum_meta: Vec<(InternedString, InternedString, Arc<dyn Meta>)>,
    added_enum_value_meta: Vec<(InternedString, InternedString, InternedString, Arc<dyn Meta>)>,
    added_struct_meta: Vec<(InternedString, InternedString, Arc<dyn Meta>)>,
    added_struct_field_meta:
        Vec<(InternedString, InternedString, InternedString, Arc<dyn Meta>)>,
    added_function_meta: Vec<(InternedString, InternedString, Arc<dyn Meta>)>,
    added_function_argument_meta:
        Vec<(InternedString, InternedString, InternedString, Arc<dyn Meta>)>,
}

impl PendingQueues {
    fn is_empty(&self) -> bool {
        self.added_enums.is_empty()
            && self.added_structs.is_empty()
            && self.added_functions.is_empty()
            && self.changed_enums.is_empty()
            && self.changed_structs.is_empty()
            && self.changed_functions.is_empty()
            && self.added_enum_meta.is_empty()
            && self.added_enum_value_meta.is_empty()
            && self.added_struct_meta.is_empty()
            && self.added_struct_field_meta.is_empty()
            && self.added_function_meta.is_empty()
            && self.added_function_argument_meta.is_empty()
    }
}

/// View over the previous iteration's additions plus submission into the
/// this-iteration queues. Every task receives its own cursor state.
pub struct GenerationIterator<'a> {
    previous: &'a PendingQueues,
    pending: &'a Mutex<PendingQueues>,

    added_enum_cursor: usize,
    added_struct_cursor: usize,
    added_function_cursor: usize,
    changed_enum_cursor: usize,
    changed_struct_cursor: usize,
    changed_function_cursor: usize,
    added_enum_meta_cursor: usize,
    added_enum_value_meta_cursor: usize,
    added_struct_meta_cursor: usize,
    added_struct_field_meta_cursor: usize,
    added_function_meta_cursor: usize,
    added_function_argument_meta_cursor: usize,
}

macro_rules! iterator_next_name {
    ($method:ident, $queue:ident, $cursor:ident) => {
        pub fn $method(&mut self) -> Option<InternedString> {
            let entry = self.previous.$queue.get(self.$cursor)?;
            self.$cursor += 1;
            Some(entry.name)
        }
    };
}

macro_rules! iterator_next_top_level_meta {
    ($method:ident, $queue:ident, $cursor:ident) => {
        pub fn $method(&mut self) -> Option<(InternedString, InternedString)> {
            let entry = self.previous.$queue.get(self.$cursor)?;
            self.$cursor += 1;
            Some((entry.0, entry.1))
        }
    };
}

macro_rules! iterator_next_lower_level_meta {
    ($method:ident, $queue:ident, $cursor:ident) => {
        pub fn $method(&mut self) -> Option<(InternedString, InternedString, InternedString)> {
            let entry = self.previous.$queue.get(self.$cursor)?;
            self.$cursor += 1;
            Some((entry.0, entry.1, entry.2))
        }
    };
}

impl<'a> GenerationIterator<'a> {
    fn new(previous: &'a PendingQueues, pending: &'a Mutex<PendingQueues>) -> Self {
        GenerationIterator {
            previous,
            pending,
            added_enum_cursor: 0,
            added_struct_cursor: 0,
            added_function_cursor: 0,
            changed_enum_cursor: 0,
            changed_struct_cursor: 0,
            changed_function_cursor: 0,
            added_enum_meta_cursor: 0,
            added_enum_value_meta_cursor: 0,
            added_struct_meta_cursor: 0,
            added_struct_field_meta_cursor: 0,
            added_function_meta_cursor: 0,
            added_function_argument_meta_cursor: 0,
        }
    }

    iterator_next_name!(next_added_enum, added_enums, added_enum_cursor);
    iterator_next_name!(next_added_struct, added_structs, added_struct_cursor);
    iterator_next_name!(next_added_function, added_functions, added_function_cursor);
    iterator_next_name!(next_changed_enum, changed_enums, changed_enum_cursor);
    iterator_next_name!(next_changed_struct, changed_structs, changed_struct_cursor);
    iterator_next_name!(
        next_changed_function,
        changed_functions,
        changed_function_cursor
    );

    iterator_next_top_level_meta!(next_added_enum_meta, added_enum_meta, added_enum_meta_cursor);
    iterator_next_lower_level_meta!(
        next_added_enum_value_meta,
        added_enum_value_meta,
        added_enum_value_meta_cursor
    );
    iterator_next_top_level_meta!(
        next_added_struct_meta,
        added_struct_meta,
        added_struct_meta_cursor
    );
    iterator_next_lower_level_meta!(
        next_added_struct_field_meta,
        added_struct_field_meta,
        added_struct_field_meta_cursor
    );
    iterator_next_top_level_meta!(
        next_added_function_meta,
        added_function_meta,
        added_function_meta_cursor
    );
    iterator_next_lower_level_meta!(
        next_added_function_argument_meta,
        added_function_argument_meta,
        added_function_argument_meta_cursor
    );

    pub fn add_enum(&self, data: Arc<EnumType>) {
        self.pending.lock().added_enums.push(data);
    }

    pub fn add_struct(&self, data: Arc<StructType>) {
        self.pending.lock().added_structs.push(data);
    }

    pub fn add_function(&self, data: Arc<FunctionType>) {
        self.pending.lock().added_functions.push(data);
    }

    pub fn change_enum(&self, data: Arc<EnumType>) {
        self.pending.lock().changed_enums.push(data);
    }

    pub fn change_struct(&self, data: Arc<StructType>) {
        self.pending.lock().changed_structs.push(data);
    }

    pub fn change_function(&self, data: Arc<FunctionType>) {
        self.pending.lock().changed_functions.push(data);
    }

    pub fn add_enum_meta(
        &self,
        enum_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_enum_meta
            .push((enum_name, meta_type_name, meta));
    }

    pub fn add_enum_value_meta(
        &self,
        enum_name: InternedString,
        value_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_enum_value_meta
            .push((enum_name, value_name, meta_type_name, meta));
    }

    pub fn add_struct_meta(
        &self,
        struct_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_struct_meta
            .push((struct_name, meta_type_name, meta));
    }

    pub fn add_struct_field_meta(
        &self,
        struct_name: InternedString,
        field_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_struct_field_meta
            .push((struct_name, field_name, meta_type_name, meta));
    }

    pub fn add_function_meta(
        &self,
        function_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_function_meta
            .push((function_name, meta_type_name, meta));
    }

    pub fn add_function_argument_meta(
        &self,
        function_name: InternedString,
        argument_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        self.pending
            .lock()
            .added_function_argument_meta
            .push((function_name, argument_name, meta_type_name, meta));
    }
}

struct GeneratorInstance {
    instance: RawInstance,
    iterate: Option<Arc<FunctionType>>,
    finalize: Option<Arc<FunctionType>>,
}

/// Generator instances are touched by exactly one task per iteration.
struct SendPointer(*mut u8);
unsafe impl Send for SendPointer {}

fn expect_argument_count(
    function: &FunctionType,
    expected: usize,
) -> Result<(), FunctorMismatch> {
    if function.arguments.len() != expected {
        return Err(FunctorMismatch::ArgumentCount {
            name: function.name,
            expected,
        });
    }
    Ok(())
}

fn expect_struct_pointer(
    function: &FunctionType,
    index: usize,
    type_name: InternedString,
) -> Result<(), FunctorMismatch> {
    match &function.arguments[index].archetype {
        Archetype::StructPointer { type_name: pointed } if *pointed == type_name => Ok(()),
        _ => Err(FunctorMismatch::ArgumentArchetype {
            name: function.name,
            index,
        }),
    }
}

fn expect_external_pointer(function: &FunctionType, index: usize) -> Result<(), FunctorMismatch> {
    match &function.arguments[index].archetype {
        Archetype::ExternalPointer => Ok(()),
        _ => Err(FunctorMismatch::ArgumentArchetype {
            name: function.name,
            index,
        }),
    }
}

fn expect_unsigned(function: &FunctionType, index: usize) -> Result<(), FunctorMismatch> {
    let argument = &function.arguments[index];
    match argument.archetype {
        Archetype::UnsignedInt if argument.size == 8 => Ok(()),
        _ => Err(FunctorMismatch::ArgumentArchetype {
            name: function.name,
            index,
        }),
    }
}

fn validate_bootstrap(
    function: &FunctionType,
    own_type: InternedString,
) -> Result<(), FunctorMismatch> {
    expect_argument_count(function, 2)?;
    expect_struct_pointer(function, 0, own_type)?;
    expect_unsigned(function, 1)
}

fn validate_iterate(
    function: &FunctionType,
    own_type: InternedString,
) -> Result<(), FunctorMismatch> {
    expect_argument_count(function, 4)?;
    expect_struct_pointer(function, 0, own_type)?;
    expect_external_pointer(function, 1)?;
    expect_external_pointer(function, 2)?;
    expect_unsigned(function, 3)
}

fn validate_finalize(
    function: &FunctionType,
    own_type: InternedString,
) -> Result<(), FunctorMismatch> {
    expect_argument_count(function, 2)?;
    expect_struct_pointer(function, 0, own_type)?;
    expect_external_pointer(function, 1)
}

fn demote_on_mismatch(
    function: Option<Arc<FunctionType>>,
    validate: impl Fn(&FunctionType) -> Result<(), FunctorMismatch>,
) -> Option<Arc<FunctionType>> {
    let function = function?;
    match validate(&function) {
        Ok(()) => Some(function),
        Err(mismatch) => {
            error!("{}", mismatch);
            None
        }
    }
}

type PopulateFn = Box<dyn Fn(&mut Registry) + Send + Sync>;
type IterateFn = Box<dyn Fn(&Registry, &mut GenerationIterator<'_>, u64) + Send + Sync>;
type FinalizeFn = Box<dyn Fn(&mut Registry) + Send + Sync>;
type GeneratedFn = Box<
    dyn Fn(Option<&Arc<Registry>>, &Arc<Registry>, Option<&MigrationSeed>, Option<&StructMigrator>)
        + Send
        + Sync,
>;
type CleanupFn = Box<dyn Fn() + Send + Sync>;

/// The registry lifecycle owner: builds a fresh registry on `generate`, runs
/// the cooperative multi-pass generation, migrates from the previous registry
/// and installs the result.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ReflectionSystem {
    #[derivative(Debug = "ignore")]
    statics: Vec<PopulateFn>,
    #[derivative(Debug = "ignore")]
    populate: Vec<PopulateFn>,
    #[derivative(Debug = "ignore")]
    generation_iterate: Vec<IterateFn>,
    #[derivative(Debug = "ignore")]
    finalize: Vec<FinalizeFn>,
    #[derivative(Debug = "ignore")]
    generated: Vec<GeneratedFn>,
    #[derivative(Debug = "ignore")]
    cleanup: Vec<CleanupFn>,

    #[derivative(Debug = "ignore")]
    current: Option<Arc<Registry>>,
    #[derivative(Debug = "ignore")]
    current_generators: Vec<GeneratorInstance>,
    generation_count: u64,
}

impl ReflectionSystem {
    pub fn new() -> Self {
        ReflectionSystem {
            statics: Vec::new(),
            populate: Vec::new(),
            generation_iterate: Vec::new(),
            finalize: Vec::new(),
            generated: Vec::new(),
            cleanup: Vec::new(),
            current: None,
            current_generators: Vec::new(),
            generation_count: 0,
        }
    }

    /// Registers a generated-module statics entry point.
    pub fn add_statics(&mut self, register: impl Fn(&mut Registry) + Send + Sync + 'static) {
        self.statics.push(Box::new(register));
    }

    pub fn on_populate(&mut self, functor: impl Fn(&mut Registry) + Send + Sync + 'static) {
        self.populate.push(Box::new(functor));
    }

    pub fn on_generation_iterate(
        &mut self,
        functor: impl Fn(&Registry, &mut GenerationIterator<'_>, u64) + Send + Sync + 'static,
    ) {
        self.generation_iterate.push(Box::new(functor));
    }

    pub fn on_finalize(&mut self, functor: impl Fn(&mut Registry) + Send + Sync + 'static) {
        self.finalize.push(Box::new(functor));
    }

    /// Fires after every generation with the outgoing and freshly built
    /// registries. The old registry, seed and migrator are absent when there
    /// was no previous registry; consumers must handle that.
    pub fn on_generated(
        &mut self,
        functor: impl Fn(
                Option<&Arc<Registry>>,
                &Arc<Registry>,
                Option<&MigrationSeed>,
                Option<&StructMigrator>,
            ) + Send
            + Sync
            + 'static,
    ) {
        self.generated.push(Box::new(functor));
    }

    pub fn on_cleanup(&mut self, functor: impl Fn() + Send + Sync + 'static) {
        self.cleanup.push(Box::new(functor));
    }

    pub fn registry(&self) -> Option<&Arc<Registry>> {
        self.current.as_ref()
    }

    pub fn generation_count(&self) -> u64 {
        self.generation_count
    }

    /// Regenerates the registry, migrating from the installed one.
    pub fn invalidate(&mut self) {
        self.generate();
    }

    fn discover_generator(
        registry: &Registry,
        descriptor: &Arc<StructType>,
        bootstrap_iteration: u64,
        generators: &mut Vec<GeneratorInstance>,
    ) {
        let stripped = match descriptor.name.as_str().strip_prefix(GENERATOR_NAME_PREFIX) {
            Some(stripped) => stripped,
            None => return,
        };

        let generator_name = if stripped.len() > 2 && stripped.ends_with("_t") {
            &stripped[..stripped.len() - 2]
        } else {
            stripped
        };

        if generator_name.is_empty() {
            // Cannot extract a usable generator name.
            return;
        }

        trace!(generator = generator_name, "discovered reflection generator");
        let instance = RawInstance::for_struct(descriptor);

        let bootstrap = demote_on_mismatch(
            registry
                .query_function(intern(&format!(
                    "{}{}_bootstrap",
                    GENERATOR_NAME_PREFIX, generator_name
                )))
                .cloned(),
            |function| validate_bootstrap(function, descriptor.name),
        );
        let iterate = demote_on_mismatch(
            registry
                .query_function(intern(&format!(
                    "{}{}_iterate",
                    GENERATOR_NAME_PREFIX, generator_name
                )))
                .cloned(),
            |function| validate_iterate(function, descriptor.name),
        );
        let finalize = demote_on_mismatch(
            registry
                .query_function(intern(&format!(
                    "{}{}_finalize",
                    GENERATOR_NAME_PREFIX, generator_name
                )))
                .cloned(),
            |function| validate_finalize(function, descriptor.name),
        );

        if let Some(bootstrap) = &bootstrap {
            let mut arguments = [
                FunctionValue::StructPointer(instance.ptr() as *mut ()),
                FunctionValue::Unsigned(bootstrap_iteration),
            ];
            bootstrap.call.call(&mut arguments);
        }

        generators.push(GeneratorInstance {
            instance,
            iterate,
            finalize,
        });
    }

    pub fn generate(&mut self) {
        info!("starting reflection registry generation");
        let mut registry = Registry::new();

        for register in &self.statics {
            register(&mut registry);
        }

        info!("calling connected population functors");
        for populate in &self.populate {
            populate(&mut registry);
        }

        info!("collecting initial reflection generators");
        let mut generators = Vec::new();
        let initial_structs: Vec<Arc<StructType>> =
            registry.iterate_structs().cloned().collect();
        for descriptor in &initial_structs {
            Self::discover_generator(&registry, descriptor, 0, &mut generators);
        }

        info!("starting generation iterations");
        let pending = Mutex::new(PendingQueues::default());
        let mut iteration_index: u64 = 0;

        loop {
            trace!(iteration_index, "running generation iteration");
            let previous = std::mem::take(&mut *pending.lock());

            for data in &previous.added_enums {
                registry.add_enum(data.clone());
            }

            for data in &previous.added_structs {
                registry.add_struct(data.clone());
                // Late-arriving generators bootstrap with the current index.
                Self::discover_generator(&registry, data, iteration_index, &mut generators);
            }

            for data in &previous.added_functions {
                registry.add_function(data.clone());
            }

            for data in &previous.changed_enums {
                registry.replace_enum(data.clone());
            }

            for data in &previous.changed_structs {
                registry.replace_struct(data.clone());
            }

            for data in &previous.changed_functions {
                registry.replace_function(data.clone());
            }

            for (owner, meta_type, meta) in &previous.added_enum_meta {
                registry.add_enum_meta(*owner, *meta_type, meta.clone());
            }

            for (owner, lower, meta_type, meta) in &previous.added_enum_value_meta {
                registry.add_enum_value_meta(*owner, *lower, *meta_type, meta.clone());
            }

            for (owner, meta_type, meta) in &previous.added_struct_meta {
                registry.add_struct_meta(*owner, *meta_type, meta.clone());
            }

            for (owner, lower, meta_type, meta) in &previous.added_struct_field_meta {
                registry.add_struct_field_meta(*owner, *lower, *meta_type, meta.clone());
            }

            for (owner, meta_type, meta) in &previous.added_function_meta {
                registry.add_function_meta(*owner, *meta_type, meta.clone());
            }

            for (owner, lower, meta_type, meta) in &previous.added_function_argument_meta {
                registry.add_function_argument_meta(*owner, *lower, *meta_type, meta.clone());
            }

            let registry_ref = &registry;
            let pending_ref = &pending;
            let previous_ref = &previous;

            rayon::scope(|scope| {
                for connection in &self.generation_iterate {
                    scope.spawn(move |_| {
                        let mut iterator = GenerationIterator::new(previous_ref, pending_ref);
                        connection(registry_ref, &mut iterator, iteration_index);
                    });
                }

                for generator in &generators {
                    if let Some(iterate) = &generator.iterate {
                        let iterate = iterate.clone();
                        let instance = SendPointer(generator.instance.ptr());

                        scope.spawn(move |_| {
                            let mut iterator =
                                GenerationIterator::new(previous_ref, pending_ref);
                            let mut arguments = [
                                FunctionValue::StructPointer(instance.0 as *mut ()),
                                FunctionValue::ExternalPointer(
                                    registry_ref as *const Registry as *mut (),
                                ),
                                FunctionValue::ExternalPointer(
                                    &mut iterator as *mut GenerationIterator as *mut (),
                                ),
                                FunctionValue::Unsigned(iteration_index),
                            ];
                            iterate.call.call(&mut arguments);
                        });
                    }
                }
            });

            iteration_index += 1;
            if pending.lock().is_empty() {
                break;
            }
        }

        info!(
            iterations = iteration_index,
            "generation reached its fixed point"
        );

        info!("calling connected finalization functors");
        for finalize in &self.finalize {
            finalize(&mut registry);
        }

        for generator in &generators {
            if let Some(finalize) = &generator.finalize {
                let mut arguments = [
                    FunctionValue::StructPointer(generator.instance.ptr() as *mut ()),
                    FunctionValue::ExternalPointer(&mut registry as *mut Registry as *mut ()),
                ];
                finalize.call.call(&mut arguments);
            }
        }

        info!("running generated callbacks");
        let new_registry = Arc::new(registry);

        if let Some(old_registry) = self.current.take() {
            info!("creating migration data");
            let seed = MigrationSeed::build(&old_registry, &new_registry);
            let migrator = StructMigrator::build(&seed);

            info!("migrating patches");
            migrator.migrate_patches(&old_registry, &new_registry);

            for generated in &self.generated {
                generated(Some(&old_registry), &new_registry, Some(&seed), Some(&migrator));
            }

            info!("destroying old reflection registry");
            for cleanup in &self.cleanup {
                cleanup();
            }

            // Dropping the instances runs the descriptors' shutdown functors.
            self.current_generators.clear();
            drop(old_registry);
        } else {
            for generated in &self.generated {
                generated(None, &new_registry, None, None);
            }
        }

        self.current = Some(new_registry);
        self.current_generators = generators;
        self.generation_count += 1;
        info!("generation routine finished successfully");
    }
}

impl Default for ReflectionSystem {
    fn default() -> Self {
        ReflectionSystem::new()
    }
}
