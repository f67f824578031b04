//! Per-request lookups
//!
//! Before any byte is stored the engine asks four resolvers, in order, where
//! the file goes and under what name:
//!
//! 1. destination - directory the objects are stored under
//! 2. filename - base name of the stored objects
//! 3. sizes - variants to produce, if any
//! 4. key prefix - prepended to variant names
//!
//! A resolver is either a fixed value ([`Static`]) or an async lookup against
//! the request ([`Dynamic`]).
//!
//! # Example
//!
//! ```
//! use mizuchi_fanout::resolve::{Dynamic, RequestContext, Resolver, Static};
//! use mizuchi_fanout::upload::FileInfo;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let by_user = Dynamic(|ctx: &RequestContext, _file: &FileInfo| {
//!     let user = ctx.field("user").map(String::from);
//!     async move { Ok::<_, anyhow::Error>(user.map(|u| format!("users/{}", u))) }
//! });
//!
//! let ctx = RequestContext::new().with_field("user", "alice");
//! let file = FileInfo::new("cat.png", "image/png");
//! assert_eq!(by_user.resolve(&ctx, &file).await?, Some("users/alice".to_string()));
//! assert_eq!(Static(7u32).resolve(&ctx, &file).await?, 7);
//! # Ok(())
//! # }
//! ```

use crate::config::UploadConfig;
use crate::transform::VariantSpec;
use crate::upload::{FileInfo, UploadError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Request data resolvers may look at, such as form fields
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    fields: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A value looked up per request
#[async_trait]
pub trait Resolver<T: Send + 'static>: Send + Sync {
    async fn resolve(&self, ctx: &RequestContext, file: &FileInfo) -> anyhow::Result<T>;
}

/// The same value for every request
#[derive(Debug, Clone)]
pub struct Static<T>(pub T);

#[async_trait]
impl<T> Resolver<T> for Static<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn resolve(&self, _ctx: &RequestContext, _file: &FileInfo) -> anyhow::Result<T> {
        Ok(self.0.clone())
    }
}

/// A value computed from the request by an async function
///
/// The returned future may not borrow the context; copy what it needs out
/// first.
pub struct Dynamic<F>(pub F);

#[async_trait]
impl<T, F, Fut> Resolver<T> for Dynamic<F>
where
    T: Send + 'static,
    F: Fn(&RequestContext, &FileInfo) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    async fn resolve(&self, ctx: &RequestContext, file: &FileInfo) -> anyhow::Result<T> {
        (self.0)(ctx, file).await
    }
}

/// Random 32 hex character name, the default filename
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomName;

#[async_trait]
impl Resolver<String> for RandomName {
    async fn resolve(&self, _ctx: &RequestContext, _file: &FileInfo) -> anyhow::Result<String> {
        Ok(uuid::Uuid::new_v4().simple().to_string())
    }
}

pub type DestinationResolver = Arc<dyn Resolver<Option<String>>>;
pub type FilenameResolver = Arc<dyn Resolver<String>>;
pub type SizesResolver = Arc<dyn Resolver<Option<Vec<VariantSpec>>>>;
pub type PrefixResolver = Arc<dyn Resolver<Option<String>>>;

/// Everything the resolvers decided for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Lookups {
    pub destination: Option<String>,
    pub filename: String,
    /// `None` means single-output mode
    pub sizes: Option<Vec<VariantSpec>>,
    pub key_prefix: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn resolver_error(resolver: &'static str) -> impl FnOnce(anyhow::Error) -> UploadError {
    move |source| UploadError::Resolver { resolver, source }
}

/// The four lookups of the engine
#[derive(Clone)]
pub struct Resolvers {
    pub destination: DestinationResolver,
    pub filename: FilenameResolver,
    pub sizes: SizesResolver,
    pub key_prefix: PrefixResolver,
}

impl Resolvers {
    /// Static lookups from configuration, random filenames
    pub fn from_config(config: &UploadConfig) -> Self {
        let sizes = if config.sizes.is_empty() {
            None
        } else {
            Some(config.sizes.clone())
        };
        Self {
            destination: Arc::new(Static(config.destination.clone())),
            filename: Arc::new(RandomName),
            sizes: Arc::new(Static(sizes)),
            key_prefix: Arc::new(Static(config.key_prefix.clone())),
        }
    }

    pub async fn destination(
        &self,
        ctx: &RequestContext,
        file: &FileInfo,
    ) -> Result<Option<String>, UploadError> {
        self.destination
            .resolve(ctx, file)
            .await
            .map(non_empty)
            .map_err(resolver_error("destination"))
    }

    /// Run every lookup, strictly one after the other
    ///
    /// Stops at the first failing lookup.
    pub async fn resolve_all(
        &self,
        ctx: &RequestContext,
        file: &FileInfo,
    ) -> Result<Lookups, UploadError> {
        let destination = self.destination(ctx, file).await?;

        let filename = self
            .filename
            .resolve(ctx, file)
            .await
            .map_err(resolver_error("filename"))?;
        if filename.is_empty() {
            return Err(UploadError::Resolver {
                resolver: "filename",
                source: anyhow::anyhow!("lookup returned an empty name"),
            });
        }

        let sizes = self
            .sizes
            .resolve(ctx, file)
            .await
            .map_err(resolver_error("sizes"))?
            .filter(|sizes| !sizes.is_empty());

        let key_prefix = self
            .key_prefix
            .resolve(ctx, file)
            .await
            .map(non_empty)
            .map_err(resolver_error("key prefix"))?;

        Ok(Lookups {
            destination,
            filename,
            sizes,
            key_prefix,
        })
    }
}
