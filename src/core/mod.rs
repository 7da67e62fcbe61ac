pub mod connectivity;
pub mod error;
pub mod keyring;
pub mod models;
pub mod store;
pub mod text;
