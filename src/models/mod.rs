pub mod request;
pub mod stats;
pub mod verdict;
