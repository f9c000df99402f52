pub mod fixed_buffer;
pub mod fragment_pool;
