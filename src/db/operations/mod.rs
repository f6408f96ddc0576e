pub mod archetype_profiles;
pub mod events;
pub mod topic_profiles;
