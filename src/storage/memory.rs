//! In-memory object sink
//!
//! Keeps committed objects in a concurrent map. Bodies are collected in full
//! before anything is inserted, so a failed body never leaves an object
//! behind.

use super::{ObjectSink, StoreError, StoredObject, WriteOptions};
use crate::upload::ByteStream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;

const DEFAULT_PUBLIC_URL: &str = "https://storage.local";

/// An object held by [`MemorySink`]
#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Bytes,
    pub options: WriteOptions,
}

/// Object sink backed by process memory
#[derive(Debug)]
pub struct MemorySink {
    bucket: String,
    public_url: String,
    objects: DashMap<String, MemoryObject>,
}

impl MemorySink {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            objects: DashMap::new(),
        }
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<MemoryObject> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectSink for MemorySink {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_base_url(&self) -> String {
        self.public_url.clone()
    }

    async fn put(
        &self,
        key: &str,
        options: &WriteOptions,
        mut body: ByteStream,
    ) -> Result<StoredObject, StoreError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }

        let data = buf.freeze();
        let bytes = data.len() as u64;
        self.objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                options: options.clone(),
            },
        );
        tracing::debug!(key, bytes, "Stored object in memory");

        Ok(StoredObject {
            key: key.to_string(),
            bytes,
            etag: None,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }
}
