pub mod auth;
pub mod clock;
pub mod dirs;
pub mod envelope;
pub mod handlers;
pub mod pow;
pub mod response;
pub mod server;
pub mod store;
pub mod token;
pub mod validation;
pub mod wire;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::SecretStore,
    pub issuer: token::TokenIssuer,
    /// Enforce the consumed-nonce ledger on create.
    pub single_use_tokens: bool,
}

pub use server::{resolve_data_dir, router, run, ServerConfig, StorageKind};
