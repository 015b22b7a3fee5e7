pub mod serializer;
pub mod token;


pub use serializer::{Serializer, SerializerGuard};
pub use token::{Token, TokenGuard};
