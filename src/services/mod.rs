pub mod dataset;
pub mod invoker;
pub mod job_store;
pub mod pipeline;
pub mod quality;
pub mod staging;
