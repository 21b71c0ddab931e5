//! Inference analytics: correlation scoring, causal graph construction,
//! cross-host cause locating, and the ranking policies.

pub mod causal_graph;
pub mod correlation;
pub mod locator;
pub mod policy;
pub mod trend;
