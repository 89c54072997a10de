pub mod fetch;
pub mod resample;
pub mod source;
pub mod streaming;
