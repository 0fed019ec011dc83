#[cfg(test)]
pub mod assert;
pub mod hint;
pub mod num;
pub mod print;
