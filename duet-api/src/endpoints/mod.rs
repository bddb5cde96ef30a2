//! API endpoint implementations, one module per backend area.

pub mod e2ee;
