//! Destination resolution
//!
//! The handler reaches DNS through the [`Resolver`] seam so that embedders
//! can substitute their own transport (caching resolvers, test scripts). The
//! default [`SystemResolver`] uses the operating system's resolver via tokio.

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{Destination, ResolveFamily, ResolveMode};
use crate::error::ResolveError;

/// Resolves a destination host to concrete socket addresses
///
/// Implementations must honor the destination's family filter and its
/// `NoResolve` mode (literal addresses only, no lookup traffic).
#[async_trait]
pub trait Resolver: Send + Sync + Debug {
    /// Resolve `dest` to a non-empty address list
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the lookup fails, yields no address passing
    /// the family filter, or a non-literal host is given under `NoResolve`.
    async fn resolve(&self, dest: &Destination) -> Result<Vec<SocketAddr>, ResolveError>;
}

/// Resolver backed by the operating system (getaddrinfo semantics)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a new system resolver
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, dest: &Destination) -> Result<Vec<SocketAddr>, ResolveError> {
        // Literal hosts never hit the network, regardless of mode
        if let Some(addr) = dest.literal_addr() {
            if !dest.family.admits(&addr) {
                return Err(ResolveError::NoAddresses {
                    host: dest.host.clone(),
                    family: dest.family.to_string(),
                });
            }
            return Ok(vec![addr]);
        }

        if dest.resolve == ResolveMode::NoResolve {
            return Err(ResolveError::NotLiteral {
                host: dest.host.clone(),
            });
        }

        let query = format!("{}:{}", dest.host, dest.port);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(query.as_str())
            .await
            .map_err(|e| ResolveError::lookup(&dest.host, e.to_string()))?
            .filter(|addr| dest.family.admits(addr))
            .collect();

        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses {
                host: dest.host.clone(),
                family: dest.family.to_string(),
            });
        }

        debug!(host = %dest.host, count = addrs.len(), "resolved destination");
        Ok(addrs)
    }
}

/// Convert an address list into resolved destination descriptors
///
/// Used when reporting resolve-only results to the embedder.
#[must_use]
pub fn resolved_destinations(dest: &Destination, addrs: &[SocketAddr]) -> Vec<Destination> {
    addrs.iter().map(|addr| dest.resolved_to(*addr)).collect()
}
