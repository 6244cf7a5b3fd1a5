//! Distribution strategies, the surrogate-key service, and the
//! post-fix pass, built on `etlmr-core`'s row/dimension/store model.

pub mod keys;
pub mod keyserver;
pub mod postfix;
pub mod strategies;
