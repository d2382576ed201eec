pub mod config;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod local_mapping;
pub mod map;
pub mod matching;

#[cfg(test)]
pub(crate) mod test_support;
