pub mod store;
pub mod transition;
pub mod ui;

pub use store::{StateChange, WizardStore};
pub use transition::{apply, transition, Disposition};
