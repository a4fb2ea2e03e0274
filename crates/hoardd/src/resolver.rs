//! Cache resolution: (scope, name) to a backing cache handle

use std::sync::Arc;

use grid::{AsyncCache, GridCache, GridSession, InstanceRegistry, DEFAULT_NAME};

use crate::error::ProxyError;

/// Container context of a multi-tenant deployment
#[derive(Debug, Clone)]
pub struct AppContext {
  pub app_name: String,
}

impl AppContext {
  /// The derived instance name for this tenant.
  pub fn mt_name(&self) -> String {
    format!("${}", self.app_name)
  }
}

/// A resolved cache: the session it lives in and the byte-level handle
/// the proxy operates on.
pub struct ResolvedCache {
  pub session: Arc<GridSession>,
  pub cache: Arc<GridCache>,
  pub async_cache: AsyncCache,
}

/// Maps (scope, cache) onto grid handles, applying tenant scoping and the
/// near-cache strip.
pub struct CacheResolver {
  registry: Arc<InstanceRegistry>,
  context: Option<AppContext>,
  default_scope: String,
}

impl CacheResolver {
  pub fn new(
    registry: Arc<InstanceRegistry>,
    context: Option<AppContext>,
    default_scope: impl Into<String>,
  ) -> Arc<Self> {
    Arc::new(Self {
      registry,
      context,
      default_scope: default_scope.into(),
    })
  }

  /// Resolve the session for a request scope.
  ///
  /// With a container context the effective scope is `appName + scope`,
  /// except that an empty scope, the app name itself, or the derived
  /// MT-name must not be concatenated again.
  pub fn resolve_session(&self, scope: &str) -> Result<Arc<GridSession>, ProxyError> {
    let scope = if scope.is_empty() {
      self.default_scope.as_str()
    } else {
      scope
    };

    let (instance_name, effective_scope) = match &self.context {
      Some(ctx) => {
        let mt_name = ctx.mt_name();
        let effective = if scope.is_empty() || scope == ctx.app_name || scope == mt_name {
          ctx.app_name.clone()
        } else {
          format!("{}{}", ctx.app_name, scope)
        };
        (mt_name, effective)
      }
      None => (DEFAULT_NAME.to_string(), scope.to_string()),
    };

    let instance = self
      .registry
      .get(&instance_name)
      .ok_or(ProxyError::NoInstance(instance_name))?;
    instance
      .session(&effective_scope)
      .ok_or(ProxyError::ScopeNotFound(effective_scope))
  }

  /// Resolve a cache handle. Near-fronted caches are bypassed when the
  /// partitioned service stores data locally; operating through the front
  /// would deliver every listener event twice.
  pub fn resolve(&self, scope: &str, name: &str) -> Result<ResolvedCache, ProxyError> {
    if name.trim().is_empty() {
      return Err(ProxyError::invalid(
        "invalid request, cache name cannot be null or empty",
      ));
    }

    let session = self.resolve_session(scope)?;
    let cache = if session.is_near_configured(name) && session.service().is_local_storage_enabled()
    {
      // strip the front tier; raw bytes go straight to the back cache
      session.ensure_near(name).back().clone()
    } else {
      session.ensure_cache(name)
    };

    let async_cache = AsyncCache::new(cache.clone(), session.service().clone());
    Ok(ResolvedCache {
      session,
      cache,
      async_cache,
    })
  }
}
