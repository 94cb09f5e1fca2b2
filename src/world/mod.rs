pub mod coordinate;
pub mod filter;
pub mod objects;
pub mod zone;
