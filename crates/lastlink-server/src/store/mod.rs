pub mod api_keys;
pub mod crypto;
pub mod db;
pub mod model;
pub mod users;

pub use api_keys::ApiKeyRecord;
pub use db::{NewSecret, Store, ViewOutcome};
pub use model::{SecretMeta, SecretRecord, SwitchConfig, SwitchStatus, SwitchUpdate, UserRecord};
