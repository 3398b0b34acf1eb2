mod array_value;
mod bytes_value;
pub mod index_encoder;
pub mod json;
mod map_value;
mod ordering;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use ordering::{compare_doubles, compare_values, type_order, TypeOrder};
pub use value::{FirestoreValue, ValueKind};
