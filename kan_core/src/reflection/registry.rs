//! Typed in-memory description store.
//!
//! A registry is append-only while the generation driver builds it and frozen
//! once installed; consumers hold it behind `Arc` and read it lock-free.
//! Duplicate registrations and malformed descriptors are construction errors
//! and panic.

use crate::ids::RegistryId;
use crate::interning::InternedString;
use crate::reflection::patch::Patch;
use downcast_rs::{impl_downcast, DowncastSync};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

/// Metadata record attached to a registry entry. Concrete meta types opt in
/// and get recovered by downcast at the query site.
pub trait Meta: DowncastSync {}
impl_downcast!(sync Meta);

/// Value initializer/finalizer pair invoked against a type-erased instance
/// location. Type erasure stays at this boundary only.
pub trait Lifecycle: Send + Sync {
    fn init(&self, _instance: *mut u8) {}
    fn shutdown(&self, _instance: *mut u8) {}
}

/// Storage shape of a field or argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Archetype {
    SignedInt,
    UnsignedInt,
    Floating,
    InternedString,
    Enum {
        type_name: InternedString,
    },
    ExternalPointer,
    Struct {
        type_name: InternedString,
    },
    StringPointer,
    StructPointer {
        type_name: InternedString,
    },
    InlineArray {
        item: Box<Archetype>,
        item_size: u32,
        capacity: u32,
        size_field: Option<InternedString>,
    },
    DynamicArray {
        item: Box<Archetype>,
        item_size: u32,
        item_alignment: u32,
    },
    Patch,
}

impl Archetype {
    /// Primitive family used by the migration engine: conversions are legal
    /// inside a family and illegal across families.
    pub fn numeric_family(&self) -> Option<NumericFamily> {
        match self {
            Archetype::SignedInt => Some(NumericFamily::Signed),
            Archetype::UnsignedInt => Some(NumericFamily::Unsigned),
            Archetype::Floating => Some(NumericFamily::Floating),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NumericFamily {
    Signed,
    Unsigned,
    Floating,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: InternedString,
    pub offset: u32,
    pub size: u32,
    pub archetype: Archetype,
}

#[derive(Clone, Debug)]
pub struct EnumValue {
    pub name: InternedString,
    pub value: i64,
}

#[derive(Clone, Debug)]
pub struct EnumType {
    pub name: InternedString,
    pub flags: bool,
    pub values: Vec<EnumValue>,
}

pub struct StructType {
    pub name: InternedString,
    pub size: u32,
    pub alignment: u32,
    pub lifecycle: Option<Arc<dyn Lifecycle>>,
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn field(&self, name: InternedString) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn validate(&self) {
        assert!(
            self.alignment.is_power_of_two(),
            "struct \"{}\" alignment must be a power of two",
            self.name
        );

        let mut previous_offset = 0u32;
        for field in &self.fields {
            assert!(
                field.offset >= previous_offset,
                "struct \"{}\" field offsets must be monotonically non-decreasing",
                self.name
            );
            assert!(
                field.offset + field.size <= self.size,
                "struct \"{}\" field \"{}\" escapes the struct bounds",
                self.name,
                field.name
            );
            previous_offset = field.offset;
        }
    }
}

/// Type-erased value passed through reflected function calls.
pub enum FunctionValue {
    Unsigned(u64),
    Signed(i64),
    Floating(f64),
    InternedString(InternedString),
    ExternalPointer(*mut ()),
    StructPointer(*mut ()),
}

impl FunctionValue {
    pub fn as_unsigned(&self) -> u64 {
        match self {
            FunctionValue::Unsigned(value) => *value,
            _ => panic!("function value is not an unsigned integer"),
        }
    }

    pub fn as_external_pointer(&self) -> *mut () {
        match self {
            FunctionValue::ExternalPointer(pointer) => *pointer,
            _ => panic!("function value is not an external pointer"),
        }
    }

    pub fn as_struct_pointer(&self) -> *mut u8 {
        match self {
            FunctionValue::StructPointer(pointer) => *pointer as *mut u8,
            _ => panic!("function value is not a struct pointer"),
        }
    }
}

/// Invocation target of a reflected function.
pub trait FunctionCall: Send + Sync {
    fn call(&self, arguments: &mut [FunctionValue]);
}

impl<F> FunctionCall for F
where
    F: Fn(&mut [FunctionValue]) + Send + Sync,
{
    fn call(&self, arguments: &mut [FunctionValue]) {
        self(arguments)
    }
}

#[derive(Clone, Debug)]
pub struct Argument {
    pub name: InternedString,
    pub archetype: Archetype,
    pub size: u32,
}

pub struct FunctionType {
    pub name: InternedString,
    pub arguments: Vec<Argument>,
    pub call: Arc<dyn FunctionCall>,
}

type TopLevelMetaKey = (InternedString, InternedString);
type LowerLevelMetaKey = (InternedString, InternedString, InternedString);

pub struct Registry {
    id: RegistryId,
    enums: FxHashMap<InternedString, Arc<EnumType>>,
    structs: FxHashMap<InternedString, Arc<StructType>>,
    functions: FxHashMap<InternedString, Arc<FunctionType>>,

    enum_meta: FxHashMap<TopLevelMetaKey, Arc<dyn Meta>>,
    enum_value_meta: FxHashMap<LowerLevelMetaKey, Arc<dyn Meta>>,
    struct_meta: FxHashMap<TopLevelMetaKey, Arc<dyn Meta>>,
    struct_field_meta: FxHashMap<LowerLevelMetaKey, Arc<dyn Meta>>,
    function_meta: FxHashMap<TopLevelMetaKey, Arc<dyn Meta>>,
    function_argument_meta: FxHashMap<LowerLevelMetaKey, Arc<dyn Meta>>,

    patches: Mutex<Vec<Patch>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            id: RegistryId::new(NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed)),
            enums: FxHashMap::default(),
            structs: FxHashMap::default(),
            functions: FxHashMap::default(),
            enum_meta: FxHashMap::default(),
            enum_value_meta: FxHashMap::default(),
            struct_meta: FxHashMap::default(),
            struct_field_meta: FxHashMap::default(),
            function_meta: FxHashMap::default(),
            function_argument_meta: FxHashMap::default(),
            patches: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn add_enum(&mut self, data: Arc<EnumType>) {
        let previous = self.enums.insert(data.name, data);
        assert!(previous.is_none(), "duplicate enum registration");
    }

    pub fn add_struct(&mut self, data: Arc<StructType>) {
        data.validate();
        let previous = self.structs.insert(data.name, data);
        assert!(previous.is_none(), "duplicate struct registration");
    }

    pub fn add_function(&mut self, data: Arc<FunctionType>) {
        let previous = self.functions.insert(data.name, data);
        assert!(previous.is_none(), "duplicate function registration");
    }

    // Change events swap an already-registered descriptor for its reworked
    // version; registering a change for an unknown name is a construction
    // error just like a duplicate add.
    pub(crate) fn replace_enum(&mut self, data: Arc<EnumType>) {
        let name = data.name;
        assert!(
            self.enums.insert(name, data).is_some(),
            "changed enum was never registered"
        );
    }

    pub(crate) fn replace_struct(&mut self, data: Arc<StructType>) {
        data.validate();
        let name = data.name;
        assert!(
            self.structs.insert(name, data).is_some(),
            "changed struct was never registered"
        );
    }

    pub(crate) fn replace_function(&mut self, data: Arc<FunctionType>) {
        let name = data.name;
        assert!(
            self.functions.insert(name, data).is_some(),
            "changed function was never registered"
        );
    }

    pub fn query_enum(&self, name: InternedString) -> Option<&Arc<EnumType>> {
        self.enums.get(&name)
    }

    pub fn query_struct(&self, name: InternedString) -> Option<&Arc<StructType>> {
        self.structs.get(&name)
    }

    pub fn query_function(&self, name: InternedString) -> Option<&Arc<FunctionType>> {
        self.functions.get(&name)
    }

    pub fn iterate_enums(&self) -> impl Iterator<Item = &Arc<EnumType>> {
        self.enums.values()
    }

    pub fn iterate_structs(&self) -> impl Iterator<Item = &Arc<StructType>> {
        self.structs.values()
    }

    pub fn iterate_functions(&self) -> impl Iterator<Item = &Arc<FunctionType>> {
        self.functions.values()
    }

    pub fn add_enum_meta(
        &mut self,
        enum_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self.enum_meta.insert((enum_name, meta_type_name), meta);
        assert!(previous.is_none(), "duplicate enum meta registration");
    }

    pub fn add_enum_value_meta(
        &mut self,
        enum_name: InternedString,
        value_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self
            .enum_value_meta
            .insert((enum_name, value_name, meta_type_name), meta);
        assert!(previous.is_none(), "duplicate enum value meta registration");
    }

    pub fn add_struct_meta(
        &mut self,
        struct_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self.struct_meta.insert((struct_name, meta_type_name), meta);
        assert!(previous.is_none(), "duplicate struct meta registration");
    }

    pub fn add_struct_field_meta(
        &mut self,
        struct_name: InternedString,
        field_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self
            .struct_field_meta
            .insert((struct_name, field_name, meta_type_name), meta);
        assert!(previous.is_none(), "duplicate struct field meta registration");
    }

    pub fn add_function_meta(
        &mut self,
        function_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self
            .function_meta
            .insert((function_name, meta_type_name), meta);
        assert!(previous.is_none(), "duplicate function meta registration");
    }

    pub fn add_function_argument_meta(
        &mut self,
        function_name: InternedString,
        argument_name: InternedString,
        meta_type_name: InternedString,
        meta: Arc<dyn Meta>,
    ) {
        let previous = self
            .function_argument_meta
            .insert((function_name, argument_name, meta_type_name), meta);
        assert!(
            previous.is_none(),
            "duplicate function argument meta registration"
        );
    }

    pub fn enum_meta(
        &self,
        enum_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&Arc<dyn Meta>> {
        self.enum_meta.get(&(enum_name, meta_type_name))
    }

    pub fn struct_meta(
        &self,
        struct_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&Arc<dyn Meta>> {
        self.struct_meta.get(&(struct_name, meta_type_name))
    }

    pub fn struct_field_meta(
        &self,
        struct_name: InternedString,
        field_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&Arc<dyn Meta>> {
        self.struct_field_meta
            .get(&(struct_name, field_name, meta_type_name))
    }

    pub fn function_meta(
        &self,
        function_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&Arc<dyn Meta>> {
        self.function_meta.get(&(function_name, meta_type_name))
    }

    /// Typed meta lookup helpers downcast at the query site.
    pub fn struct_meta_as<M: Meta>(
        &self,
        struct_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&M> {
        self.struct_meta(struct_name, meta_type_name)
            .and_then(|meta| meta.downcast_ref::<M>())
    }

    pub fn struct_field_meta_as<M: Meta>(
        &self,
        struct_name: InternedString,
        field_name: InternedString,
        meta_type_name: InternedString,
    ) -> Option<&M> {
        self.struct_field_meta(struct_name, field_name, meta_type_name)
            .and_then(|meta| meta.downcast_ref::<M>())
    }

    pub fn register_patch(&self, patch: Patch) {
        self.patches.lock().push(patch);
    }

    pub fn patches(&self) -> Vec<Patch> {
        self.patches.lock().clone()
    }

    pub(crate) fn take_patches(&self) -> Vec<Patch> {
        std::mem::take(&mut *self.patches.lock())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;

    fn simple_struct(name: &str) -> Arc<StructType> {
        Arc::new(StructType {
            name: intern(name),
            size: 8,
            alignment: 8,
            lifecycle: None,
            fields: vec![Field {
                name: intern("value"),
                offset: 0,
                size: 8,
                archetype: Archetype::UnsignedInt,
            }],
        })
    }

    #[test]
    fn query_by_name_after_add() {
        let mut registry = Registry::new();
        registry.add_struct(simple_struct("config"));

        let found = registry.query_struct(intern("config")).unwrap();
        assert_eq!(found.size, 8);
        assert!(registry.query_struct(intern("missing")).is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate struct registration")]
    fn duplicate_struct_name_panics() {
        let mut registry = Registry::new();
        registry.add_struct(simple_struct("config"));
        registry.add_struct(simple_struct("config"));
    }

    #[test]
    #[should_panic(expected = "escapes the struct bounds")]
    fn field_escaping_struct_bounds_panics() {
        let mut registry = Registry::new();
        registry.add_struct(Arc::new(StructType {
            name: intern("broken"),
            size: 4,
            alignment: 4,
            lifecycle: None,
            fields: vec![Field {
                name: intern("value"),
                offset: 0,
                size: 8,
                archetype: Archetype::UnsignedInt,
            }],
        }));
    }

    struct TagMeta {
        priority: u32,
    }

    impl Meta for TagMeta {}

    #[test]
    fn typed_meta_round_trip() {
        let mut registry = Registry::new();
        registry.add_struct(simple_struct("config"));
        registry.add_struct_meta(
            intern("config"),
            intern("tag"),
            Arc::new(TagMeta { priority: 3 }),
        );

        let meta = registry
            .struct_meta_as::<TagMeta>(intern("config"), intern("tag"))
            .unwrap();
        assert_eq!(meta.priority, 3);
    }
}
