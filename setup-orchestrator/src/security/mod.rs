pub mod crypto;
pub mod secret_box;
