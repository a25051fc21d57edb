pub mod revision_store;
