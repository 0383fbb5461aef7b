//! Analytical projections over stored runs (the builder's view).

mod query;

pub use query::{
    BuilderQuery, CommonChoice, DecisionPatterns, FailureAnalysis, Improvement, NodePerformance,
    PatternAnalysis, RunComparison, RunDigest,
};
