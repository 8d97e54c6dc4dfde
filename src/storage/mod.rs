pub mod blacklist;
pub mod history;
pub mod slot_clock;
