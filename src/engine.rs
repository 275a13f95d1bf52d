//! Engine wiring.
//!
//! [`Engine::assemble`] connects the collaborators (transport, stores,
//! identity, clock, status reporter) into one engine.  [`Engine::from_config`]
//! picks the production collaborators described by a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cache::policy::CachePolicy;
use crate::cache::store::{FileStore, MemoryStore, Store};
use crate::cache::{EvictionController, ListingCache, SessionCache};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::context::EngineContext;
use crate::credentials::{IdentitySession, StaticIdentity, TokenResolver};
use crate::forge::http::ReqwestTransport;
use crate::forge::{ForgeClient, GitHub, Transport};
use crate::status::{LogReporter, StatusReporter};
use crate::sync::SyncOrchestrator;

/// Collaborators supplied by the embedding front end.
pub struct EngineParts {
    pub transport: Arc<dyn Transport>,
    pub cache_store: Arc<dyn Store>,
    pub token_store: Arc<dyn Store>,
    pub identity: Arc<dyn IdentitySession>,
    pub clock: SharedClock,
    pub reporter: Arc<dyn StatusReporter>,
}

pub struct Engine {
    pub config: Arc<Config>,
    pub context: Arc<EngineContext>,
    pub tokens: Arc<TokenResolver>,
    pub github: GitHub,
    pub sync: SyncOrchestrator,
}

impl Engine {
    pub fn assemble(config: Config, parts: EngineParts) -> Self {
        let context = Arc::new(EngineContext::new(Arc::clone(&parts.clock)));

        let tokens = Arc::new(TokenResolver::new(
            parts.token_store,
            parts.identity,
            Arc::clone(&parts.clock),
            &config.credentials,
        ));
        let client = ForgeClient::new(
            parts.transport,
            Arc::clone(&tokens),
            Arc::clone(&context),
            &config.upstream,
        );
        let github = GitHub::new(client, &config);

        let listing_policy =
            CachePolicy::stale_while_revalidate(config.cache.listing_ttl_millis());
        let listings = ListingCache::new(
            Arc::clone(&parts.cache_store),
            Arc::clone(&parts.clock),
            listing_policy,
        );
        let session = SessionCache::new(Arc::clone(&parts.cache_store), Arc::clone(&parts.clock));
        let eviction = EvictionController::new(
            parts.cache_store,
            parts.clock,
            config.cache.max_listing_entries,
            context.metrics.metrics.evictions.clone(),
        );

        let sync = SyncOrchestrator::new(
            github.clone(),
            config.listing.clone(),
            listings,
            session,
            eviction,
            parts.reporter,
        );

        Self {
            config: Arc::new(config),
            context,
            tokens,
            github,
            sync,
        }
    }

    /// Production engine: reqwest transport, the configured cache backend, a
    /// file-backed token store, and the identity named in the config.
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.upstream.user_agent)?;

        let cache_store: Arc<dyn Store> = match config.cache.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File => Arc::new(
                FileStore::open(&config.cache.path)
                    .with_context(|| format!("failed to open cache store {}", config.cache.path))?,
            ),
        };
        let token_store = FileStore::open(&config.credentials.store_path).with_context(|| {
            format!(
                "failed to open credentials store {}",
                config.credentials.store_path
            )
        })?;

        info!(
            api_url = %config.upstream.api_url,
            backend = ?config.cache.backend,
            "engine initialised"
        );

        let identity = StaticIdentity::from_config(&config.credentials);
        Ok(Self::assemble(
            config,
            EngineParts {
                transport: Arc::new(transport),
                cache_store,
                token_store: Arc::new(token_store),
                identity: Arc::new(identity),
                clock: Arc::new(SystemClock),
                reporter: Arc::new(LogReporter),
            },
        ))
    }
}
