//! Communication primitives shared between sessions and the background
//! completion task.
pub mod completion;
