//! Repository layer: one struct per table, plain `sqlx::query_as` calls.

pub mod match_repo;
pub mod participant_repo;
pub mod session_repo;

pub use match_repo::MatchRepo;
pub use participant_repo::ParticipantRepo;
pub use session_repo::SessionRepo;

/// Status values for a `= ANY($n)` guard.
pub(crate) fn status_list<T>(statuses: &[T], as_str: impl Fn(&T) -> &'static str) -> Vec<String> {
    statuses.iter().map(|s| as_str(s).to_string()).collect()
}
