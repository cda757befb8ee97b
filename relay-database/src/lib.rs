use log::info;

pub use errors::StoreError;
pub use interfaces::CompletionStore;

mod errors;
pub mod in_memory;
pub mod interfaces;
mod mappers;
pub mod postgres;
pub mod sqlite;

pub async fn initialize_store(store: &impl CompletionStore) -> Result<(), StoreError> {
    info!("Setting up database tables");
    store.create_table().await?;
    info!("Table fcm_job created or already exists");
    Ok(())
}
