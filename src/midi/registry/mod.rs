#[cfg(test)]
pub mod inmem;
pub mod model;
pub mod shared;
pub mod source;
