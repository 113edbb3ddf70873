//! Shared fixtures for adapter tests against a mock HTTP server

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sd_core::{
    AccessTokenCache, DatasetRef, Direction, Locator, Provider, RetryBuilder, SessionContext,
    StaticCredentials, TokenScope, TransferOrchestrator,
};
use sd_storage::{AdapterRegistry, StorageSettings};

pub const BUCKET: &str = "bucket";
pub const PREFIX: &str = "datasets/abc";

pub fn dataset() -> DatasetRef {
    DatasetRef::new("tenant", "subproject", Locator::new(BUCKET, PREFIX))
}

pub fn context(provider: Provider, token: &str) -> SessionContext {
    SessionContext {
        provider,
        direction: Direction::Upload,
        locator: dataset().locator,
        tokens: Arc::new(AccessTokenCache::new(
            Arc::new(StaticCredentials::new(token)),
            TokenScope::new("tenant", "subproject", false),
        )),
    }
}

pub fn orchestrator(provider: Provider, settings: StorageSettings, token: &str) -> TransferOrchestrator {
    TransferOrchestrator::new(
        provider,
        Arc::new(AdapterRegistry::new(settings)),
        Arc::new(StaticCredentials::new(token)),
    )
    .with_retry(
        RetryBuilder::new()
            .max_attempts(3)
            .backoff_base_ms(1)
            .backoff_factor_ms(1)
            .build(),
    )
}

pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn write_source(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let data = content(len);
    let path = dir.join("source.bin");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}
