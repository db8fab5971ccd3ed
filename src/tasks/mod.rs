pub mod recognition;
pub mod speaker;
