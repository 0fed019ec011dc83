pub mod entropy;
pub mod global;
pub mod header;
pub mod randomizer;
pub mod raw;
pub mod reserve;
