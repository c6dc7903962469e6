//! Auto-redirect lifecycle: install, incremental updates, teardown

use crate::address::{InterfaceFinder, LocalAddressSet, SystemInterfaces};
use crate::companion::{CompanionFirewall, NoCompanion};
use crate::config::{ConfigValidator, RedirectPolicy, RouteAddresses};
use crate::error::{RedirectError, Result};
use crate::monitor::{CallbackRegistry, NetworkMonitor, SubscriptionToken};
use crate::ruleset::RuleGraph;
use crate::sync::Synchronizer;
use crate::transport::{NftBackend, NftCli};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

/// Builder wiring the collaborators of an [`AutoRedirect`]
pub struct AutoRedirectBuilder {
    policy: RedirectPolicy,
    backend: Arc<dyn NftBackend>,
    finder: Arc<dyn InterfaceFinder>,
    monitor: Arc<dyn NetworkMonitor>,
    companion: Box<dyn CompanionFirewall>,
}

impl AutoRedirectBuilder {
    /// Validate the policy; collaborators default to the system ones
    pub fn new(policy: RedirectPolicy) -> Result<Self> {
        ConfigValidator::validate(&policy)?;

        Ok(Self {
            policy,
            backend: Arc::new(NftCli::new()),
            finder: Arc::new(SystemInterfaces),
            monitor: CallbackRegistry::new(),
            companion: Box::new(NoCompanion),
        })
    }

    pub fn backend(mut self, backend: Arc<dyn NftBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn interfaces(mut self, finder: Arc<dyn InterfaceFinder>) -> Self {
        self.finder = finder;
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn companion(mut self, companion: Box<dyn CompanionFirewall>) -> Self {
        self.companion = companion;
        self
    }

    pub fn build(self) -> AutoRedirect {
        AutoRedirect {
            inner: Arc::new(Inner {
                policy: self.policy,
                backend: self.backend,
                finder: self.finder,
                monitor: self.monitor,
                companion: self.companion,
                state: Mutex::new(State::default()),
                ready: AtomicBool::new(false),
            }),
        }
    }
}

/// Redirects host traffic into a local proxy for the lifetime between
/// [`start`](Self::start) and [`stop`](Self::stop).
///
/// Mutating calls are serialized on an internal lock; the network callback
/// takes the same lock, so it never interleaves with install or teardown.
pub struct AutoRedirect {
    inner: Arc<Inner>,
}

struct Inner {
    policy: RedirectPolicy,
    backend: Arc<dyn NftBackend>,
    finder: Arc<dyn InterfaceFinder>,
    monitor: Arc<dyn NetworkMonitor>,
    companion: Box<dyn CompanionFirewall>,
    state: Mutex<State>,
    /// Set once install committed; the callback ignores notifications before
    ready: AtomicBool,
}

#[derive(Default)]
struct State {
    local: LocalAddressSet,
    routes: RouteAddresses,
    subscription: Option<SubscriptionToken>,
}

impl AutoRedirect {
    pub fn builder(policy: RedirectPolicy) -> Result<AutoRedirectBuilder> {
        AutoRedirectBuilder::new(policy)
    }

    pub fn policy(&self) -> &RedirectPolicy {
        &self.inner.policy
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Install the ruleset and subscribe to network changes
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock()?;

        let local = LocalAddressSet::discover(inner.finder.as_ref())?;
        let routes = inner.policy.route_addresses();
        let graph = RuleGraph::build(&inner.policy, &local, &routes)?;

        inner
            .synchronizer()
            .install(&graph, inner.companion.as_ref())?;
        state.local = local;
        state.routes = routes;

        if state.subscription.is_none() {
            let weak = Arc::downgrade(inner);
            let token = inner
                .monitor
                .register_callback(Arc::new(move || on_network_change(&weak)));
            state.subscription = Some(token);
        }

        inner.ready.store(true, Ordering::Release);
        info!(
            "Redirecting {} traffic to port {}",
            inner.policy.tun_name, inner.policy.redirect_port
        );
        Ok(())
    }

    /// Re-read interfaces and patch the local address sets
    pub fn update_local_addresses(&self) -> Result<()> {
        self.inner.update_local_addresses()
    }

    /// Replace the route address sets without a reinstall
    pub fn update_route_addresses(&self, routes: RouteAddresses) -> Result<()> {
        let inner = &self.inner;
        ConfigValidator::validate_routes(&inner.policy, &routes)?;

        let mut state = inner.lock()?;
        inner
            .synchronizer()
            .update_route_addresses(&state.routes, &routes)?;
        state.routes = routes;
        Ok(())
    }

    /// Unsubscribe, remove the table and revert the companion
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ready.store(false, Ordering::Release);
        let mut state = inner.lock()?;

        if let Some(token) = state.subscription.take() {
            if let Err(e) = inner.monitor.unregister_callback(token) {
                warn!("Failed to unregister network callback: {}", e);
            }
        }

        let result = inner.synchronizer().teardown(inner.companion.as_ref());
        state.local = LocalAddressSet::default();
        state.routes = RouteAddresses::default();
        result
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            RedirectError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "redirect state lock poisoned",
            ))
        })
    }

    fn synchronizer(&self) -> Synchronizer<'_> {
        Synchronizer::new(self.backend.as_ref(), &self.policy)
    }

    fn update_local_addresses(&self) -> Result<()> {
        let mut state = self.lock()?;
        let new = LocalAddressSet::discover(self.finder.as_ref())?;
        self.synchronizer()
            .update_local_addresses(&state.local, &new)?;
        state.local = new;
        Ok(())
    }
}

fn on_network_change(weak: &Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !inner.ready.load(Ordering::Acquire) {
        debug!("Network change before install, ignoring");
        return;
    }
    if let Err(e) = inner.update_local_addresses() {
        error!("Failed to update local address set: {}", e);
    }
}
