//! Time budget, polling and the top-level episode

pub mod budget;
pub mod episode;
pub mod poll;

pub use budget::DeadlineBudget;
pub use episode::{BootstrapEpisode, EpisodeServices};
pub use poll::{poll_until, PollOutcome, Probe};
