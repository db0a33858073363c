//! Byte-level encodings: compressed integers, heaps, indices, table rows,
//! method headers and the metadata streams.

pub mod cli;
pub mod compressed;
pub mod heap;
pub mod index;
pub mod method;
pub mod opcodes;
pub mod signature;
pub mod stream;
pub mod table;
