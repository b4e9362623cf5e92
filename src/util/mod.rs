pub mod arena;
pub mod index_list;
pub mod random;
pub mod safe_converter;
