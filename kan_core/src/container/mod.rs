pub mod dynamic_array;
pub mod event_queue;
pub mod spatial_tree;

pub use dynamic_array::DynamicArray;
pub use event_queue::{EventQueue, EventSender};
pub use spatial_tree::{
    InsertionIterator, NodeId, QuantizedPath, RayIterator, ShapeIterator, SpatialTree,
};
