//! Mock implementations for exercising handler and settlement logic
//! without a broker.

pub mod mocks;
