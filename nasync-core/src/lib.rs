mod client;

pub use client::{ApiErrorClass, EntryList, EntryType, NasClient, NasError, RemoteEntry};
