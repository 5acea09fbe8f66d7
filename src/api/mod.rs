//! Inbound HTTP surface — split across two axum `Router`s bound to separate
//! ports (§4.8): `client` carries the Ollama/OpenAI-facing surface, the rest
//! are mounted on the admin port so they can be network-restricted
//! independently.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod metrics;
pub mod request_id;
pub mod status;
