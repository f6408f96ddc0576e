pub mod archetype;
pub mod events;
pub mod llm_provider;
pub mod profile_aggregator;
pub mod reveal;
pub mod risk_report;
pub mod spaced_repetition;
pub mod student_context;
