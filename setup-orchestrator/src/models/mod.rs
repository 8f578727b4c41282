pub mod actions;
pub mod requests;
pub mod responses;
pub mod state;
