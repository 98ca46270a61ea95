mod runtime;

pub use runtime::*;
