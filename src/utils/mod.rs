//! Binary support utilities.

pub mod bootstrap;
