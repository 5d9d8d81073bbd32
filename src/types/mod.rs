pub mod job;
pub mod protocol;
pub mod serialisable;
pub mod session;
pub mod states;
pub mod tube;
