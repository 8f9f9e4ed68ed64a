pub mod beacon;
pub mod matching;
pub mod session;
