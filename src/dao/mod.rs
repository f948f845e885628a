/// Local key-value storage backends.
pub mod storage;
/// Credentials and cached preferences on top of the storage backends.
pub mod token_store;
