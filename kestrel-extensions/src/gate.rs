//! Script Injection Gating
//!
//! Per-page-view consent tracking for extension content scripts. Extensions
//! whose scripts need user approval register deferred injections here; the
//! gate runs them when approval arrives and throws them away when the page
//! navigates or the extension goes away.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};
use spin::Mutex;

use crate::action::{ActionDescriptor, ActionProvider, ClickAction, ScriptStatus};
use crate::{Extension, ExtensionId, ExtensionManager, PageId, RequestId};

/// Deferred injection action. Run at most once, only while the page it was
/// registered against is still current.
pub type InjectionCallback = Box<dyn FnOnce()>;

/// Reply path for an inbound permission request, correlated by request ID.
pub type PermissionReply = Box<dyn FnOnce(RequestId)>;

/// Gate configuration, injected at construction.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Whether consent is enforced. When false the gate is a pass-through:
    /// nothing requires consent and no actions are rendered.
    pub enforce: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { enforce: true }
    }
}

/// A single pending injection request.
struct PendingRequest {
    /// Deferred injection.
    callback: InjectionCallback,
    /// Page the request was made against.
    page_id: PageId,
}

/// Mutable gate state, all of it scoped to the current document.
struct GateState {
    /// Page the view currently shows.
    current_page: PageId,
    /// Extensions granted consent on the current page.
    permitted: HashSet<ExtensionId>,
    /// Pending injection requests, FIFO per extension.
    pending: HashMap<ExtensionId, Vec<PendingRequest>>,
    /// Derived toolbar descriptors, regenerated on demand.
    actions: HashMap<ExtensionId, ActionDescriptor>,
    /// Extensions reported as ad injectors on the current page.
    ad_injectors: HashSet<ExtensionId>,
}

/// Consent gate for one page view.
///
/// Owned and driven by the thread that owns the page view; every method is
/// synchronous and none blocks. The state lock is never held while a
/// deferred callback runs, so callbacks are free to call back into the gate.
pub struct InjectionGate {
    /// Consent enforcement switch.
    enforce: bool,
    /// Per-document state.
    state: Mutex<GateState>,
}

impl InjectionGate {
    /// Create a gate for a page view currently showing `page`.
    pub fn new(config: GateConfig, page: PageId) -> Self {
        Self {
            enforce: config.enforce,
            state: Mutex::new(GateState {
                current_page: page,
                permitted: HashSet::new(),
                pending: HashMap::new(),
                actions: HashMap::new(),
                ad_injectors: HashSet::new(),
            }),
        }
    }

    /// Whether the extension's script must wait for user consent before
    /// running on the current page.
    pub fn requires_consent(&self, extension: &Extension) -> bool {
        if !self.enforce {
            return false;
        }
        !self.state.lock().permitted.contains(&extension.id)
    }

    /// Register a deferred injection for `extension` on the page identified
    /// by `page_id`.
    ///
    /// The callback runs at most once, only while `page_id` is still the
    /// current page. It runs synchronously right here if the extension is
    /// already permitted (or the gate is not enforcing); otherwise it waits
    /// for [`grant_permission`](Self::grant_permission). It may never run at
    /// all: consent may never arrive, or the page may navigate away first.
    pub fn request_injection(
        &self,
        extension: &Extension,
        page_id: PageId,
        callback: InjectionCallback,
    ) {
        let mut state = self.state.lock();
        if state.current_page != page_id {
            debug!(
                "dropping injection request from {}: page {} is gone",
                extension.id.as_str(),
                page_id.0
            );
            return;
        }

        if !self.enforce || state.permitted.contains(&extension.id) {
            drop(state);
            callback();
            return;
        }

        state
            .pending
            .entry(extension.id.clone())
            .or_default()
            .push(PendingRequest { callback, page_id });
        // Status moved to Pending; the cached descriptor is stale.
        state.actions.remove(&extension.id);
        debug!(
            "queued injection request from {} on page {}",
            extension.id.as_str(),
            page_id.0
        );
    }

    /// Grant the extension consent on the current page and run its pending
    /// injections, oldest first.
    pub fn grant_permission(&self, extension: &Extension) {
        let detached = {
            let mut state = self.state.lock();
            state.permitted.insert(extension.id.clone());
            state.actions.remove(&extension.id);
            state.pending.remove(&extension.id).unwrap_or_default()
        };

        // Invoke from the detached queue with the lock released: a callback
        // may re-enter the gate, navigate, or unload the extension. The page
        // and the grant are re-checked before each invocation.
        for request in detached {
            if self.still_runnable(&extension.id, request.page_id) {
                (request.callback)();
            } else {
                debug!(
                    "dropping drained injection for {}: page {} is gone",
                    extension.id.as_str(),
                    request.page_id.0
                );
            }
        }
    }

    fn still_runnable(&self, extension_id: &ExtensionId, page_id: PageId) -> bool {
        let state = self.state.lock();
        state.current_page == page_id && state.permitted.contains(extension_id)
    }

    /// Record extensions an external detector flagged as ad injectors on the
    /// current page. Policy and reporting live elsewhere; permission state is
    /// not touched.
    pub fn on_ad_injection_detected(&self, extension_ids: &[ExtensionId]) {
        let mut state = self.state.lock();
        for id in extension_ids {
            if state.ad_injectors.insert(id.clone()) {
                warn!("ad injection detected from extension {}", id.as_str());
            }
        }
    }

    /// Extensions flagged as ad injectors on the current page.
    pub fn ad_injectors(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<ExtensionId> =
            self.state.lock().ad_injectors.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Page the gate currently considers current.
    pub fn current_page(&self) -> PageId {
        self.state.lock().current_page
    }

    /// Inbound permission request from the page's script injection runtime,
    /// already decoded by the page-view host.
    ///
    /// `reply` carries `request_id` back across the boundary once (and if)
    /// consent exists; the gate itself does not retain request IDs. Requests
    /// naming an extension the registry does not know, or a page that is no
    /// longer current, are ignored: they are ordinary races between
    /// navigation, unload, and in-flight messages.
    pub fn on_permission_request(
        &self,
        registry: &ExtensionManager,
        extension_id: &ExtensionId,
        page_id: PageId,
        request_id: RequestId,
        reply: PermissionReply,
    ) {
        let Some(extension) = registry.get_extension(extension_id) else {
            debug!(
                "ignoring permission request from unknown extension {}",
                extension_id.as_str()
            );
            return;
        };

        if self.current_page() != page_id {
            debug!(
                "ignoring permission request from {}: page {} is gone",
                extension_id.as_str(),
                page_id.0
            );
            return;
        }

        if !self.requires_consent(&extension) {
            reply(request_id);
        } else {
            self.request_injection(&extension, page_id, Box::new(move || reply(request_id)));
        }
    }

    fn status_of(state: &GateState, extension_id: &ExtensionId) -> ScriptStatus {
        if state.permitted.contains(extension_id) {
            ScriptStatus::Running
        } else if state.pending.contains_key(extension_id) {
            ScriptStatus::Pending
        } else {
            ScriptStatus::Blocked
        }
    }
}

impl ActionProvider for InjectionGate {
    fn action_for_extension(&self, extension: &Extension) -> Option<ActionDescriptor> {
        if !self.enforce {
            return None;
        }

        let mut state = self.state.lock();
        if let Some(action) = state.actions.get(&extension.id) {
            return Some(action.clone());
        }

        let status = Self::status_of(&state, &extension.id);
        let action = ActionDescriptor::derive(extension, status);
        state
            .actions
            .insert(extension.id.clone(), action.clone());
        Some(action)
    }

    fn on_clicked(&self, extension: &Extension) -> ClickAction {
        self.grant_permission(extension);
        match &extension.manifest.action {
            Some(decl) if decl.has_popup() => ClickAction::ShowPopup,
            _ => ClickAction::None,
        }
    }

    fn on_navigated(&self, page: PageId) {
        let mut state = self.state.lock();
        if !state.ad_injectors.is_empty() {
            info!(
                "page {} had {} ad-injecting extension(s)",
                state.current_page.0,
                state.ad_injectors.len()
            );
        }

        state.permitted.clear();
        state.actions.clear();
        state.ad_injectors.clear();
        // Discard, without invoking, every request scoped to another page.
        state.pending.retain(|_, queue| {
            queue.retain(|request| request.page_id == page);
            !queue.is_empty()
        });
        state.current_page = page;
    }

    fn on_extension_unloaded(&self, extension_id: &ExtensionId) {
        let mut state = self.state.lock();
        state.pending.remove(extension_id);
        state.permitted.remove(extension_id);
        state.actions.remove(extension_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ActionDecl, Manifest};
    use alloc::rc::Rc;
    use alloc::string::ToString;
    use alloc::vec;
    use core::cell::{Cell, RefCell};

    fn extension(name: &str) -> Extension {
        Extension::new(ExtensionId::from_name(name), Manifest::new(name, "1.0"))
    }

    fn gate_on(page: u64) -> InjectionGate {
        InjectionGate::new(GateConfig::default(), PageId(page))
    }

    fn counting(counter: &Rc<Cell<u32>>) -> InjectionCallback {
        let counter = counter.clone();
        Box::new(move || counter.set(counter.get() + 1))
    }

    #[test]
    fn test_requires_consent() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        assert!(gate.requires_consent(&ext));

        gate.grant_permission(&ext);
        assert!(!gate.requires_consent(&ext));

        let disabled = InjectionGate::new(GateConfig { enforce: false }, PageId(1));
        assert!(!disabled.requires_consent(&ext));
    }

    #[test]
    fn test_grant_runs_queue_in_order() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        let order = Rc::new(RefCell::new(vec![]));

        for tag in [1u8, 2, 3] {
            let order = order.clone();
            gate.request_injection(
                &ext,
                PageId(1),
                Box::new(move || order.borrow_mut().push(tag)),
            );
        }

        assert!(order.borrow().is_empty());
        gate.grant_permission(&ext);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);

        // Nothing left to run on a second grant.
        gate.grant_permission(&ext);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_grant_then_request_runs_immediately() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.grant_permission(&ext);
        gate.request_injection(&ext, PageId(1), counting(&runs));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_disabled_gate_is_pass_through() {
        let gate = InjectionGate::new(GateConfig { enforce: false }, PageId(1));
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.request_injection(&ext, PageId(1), counting(&runs));
        assert_eq!(runs.get(), 1);
        assert_eq!(gate.action_for_extension(&ext), None);
    }

    #[test]
    fn test_navigation_discards_pending() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.request_injection(&ext, PageId(1), counting(&runs));
        gate.on_navigated(PageId(2));
        gate.grant_permission(&ext);

        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn test_navigation_clears_permission() {
        let gate = gate_on(1);
        let ext = extension("alpha");

        gate.grant_permission(&ext);
        assert!(!gate.requires_consent(&ext));

        gate.on_navigated(PageId(2));
        assert!(gate.requires_consent(&ext));
    }

    #[test]
    fn test_stale_page_request_never_queued() {
        let gate = gate_on(2);
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        // Request races a navigation that already happened.
        gate.request_injection(&ext, PageId(1), counting(&runs));
        gate.grant_permission(&ext);
        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn test_unload_discards_pending() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.request_injection(&ext, PageId(1), counting(&runs));
        gate.grant_permission(&ext);
        assert_eq!(runs.get(), 1);

        gate.request_injection(&ext, PageId(1), counting(&runs));
        assert_eq!(runs.get(), 2);

        gate.on_extension_unloaded(&ext.id);
        assert!(gate.requires_consent(&ext));
    }

    #[test]
    fn test_unload_before_grant() {
        let gate = gate_on(1);
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.request_injection(&ext, PageId(1), counting(&runs));
        gate.on_extension_unloaded(&ext.id);
        gate.grant_permission(&ext);

        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn test_consent_scenario() {
        let gate = gate_on(10);
        let ext = extension("ext1");
        let runs = Rc::new(Cell::new(0));

        assert!(gate.requires_consent(&ext));
        gate.request_injection(&ext, PageId(10), counting(&runs));
        gate.grant_permission(&ext);

        assert_eq!(runs.get(), 1);
        assert!(!gate.requires_consent(&ext));
    }

    #[test]
    fn test_reentrant_request_during_drain() {
        let gate = Rc::new(gate_on(1));
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        let inner_gate = gate.clone();
        let inner_ext = ext.clone();
        let inner_runs = runs.clone();
        gate.request_injection(
            &ext,
            PageId(1),
            Box::new(move || {
                // Permitted by now, so this runs in-line.
                inner_gate.request_injection(&inner_ext, PageId(1), {
                    let runs = inner_runs.clone();
                    Box::new(move || runs.set(runs.get() + 1))
                });
            }),
        );

        gate.grant_permission(&ext);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_navigation_during_drain_stops_queue() {
        let gate = Rc::new(gate_on(1));
        let ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        let nav_gate = gate.clone();
        gate.request_injection(
            &ext,
            PageId(1),
            Box::new(move || nav_gate.on_navigated(PageId(2))),
        );
        gate.request_injection(&ext, PageId(1), counting(&runs));

        gate.grant_permission(&ext);
        // The second callback was detached but its page went away mid-drain.
        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn test_queues_are_independent_per_extension() {
        let gate = gate_on(1);
        let alpha = extension("alpha");
        let beta = extension("beta");
        let alpha_runs = Rc::new(Cell::new(0));
        let beta_runs = Rc::new(Cell::new(0));

        gate.request_injection(&alpha, PageId(1), counting(&alpha_runs));
        gate.request_injection(&beta, PageId(1), counting(&beta_runs));

        gate.grant_permission(&beta);
        assert_eq!(alpha_runs.get(), 0);
        assert_eq!(beta_runs.get(), 1);
    }

    #[test]
    fn test_action_descriptor_tracks_status() {
        let gate = gate_on(1);
        let ext = extension("alpha");

        let blocked = gate.action_for_extension(&ext).unwrap();
        assert_eq!(blocked.status, ScriptStatus::Blocked);
        // Idempotent while nothing changes.
        assert_eq!(gate.action_for_extension(&ext).unwrap(), blocked);

        gate.request_injection(&ext, PageId(1), Box::new(|| {}));
        let pending = gate.action_for_extension(&ext).unwrap();
        assert_eq!(pending.status, ScriptStatus::Pending);
        assert_eq!(pending.badge_text, "!");

        gate.grant_permission(&ext);
        let running = gate.action_for_extension(&ext).unwrap();
        assert_eq!(running.status, ScriptStatus::Running);

        gate.on_navigated(PageId(2));
        let cleared = gate.action_for_extension(&ext).unwrap();
        assert_eq!(cleared.status, ScriptStatus::Blocked);
    }

    #[test]
    fn test_click_grants_and_reports_popup() {
        let gate = gate_on(1);
        let mut ext = extension("alpha");
        let runs = Rc::new(Cell::new(0));

        gate.request_injection(&ext, PageId(1), counting(&runs));
        assert_eq!(gate.on_clicked(&ext), ClickAction::None);
        assert_eq!(runs.get(), 1);
        assert!(!gate.requires_consent(&ext));

        ext.manifest.action = Some(ActionDecl {
            default_popup: Some("popup.html".to_string()),
            ..Default::default()
        });
        assert_eq!(gate.on_clicked(&ext), ClickAction::ShowPopup);
    }

    #[test]
    fn test_permission_request_boundary() {
        let registry = ExtensionManager::new();
        let id = registry
            .load_extension(Manifest::new("alpha", "1.0"))
            .unwrap();
        let ext = registry.get_extension(&id).unwrap();

        let gate = gate_on(1);
        let replies = Rc::new(RefCell::new(vec![]));

        let reply = |replies: &Rc<RefCell<alloc::vec::Vec<RequestId>>>| -> PermissionReply {
            let replies = replies.clone();
            Box::new(move |request_id| replies.borrow_mut().push(request_id))
        };

        // Unknown extension: silently ignored.
        gate.on_permission_request(
            &registry,
            &ExtensionId::new("nope"),
            PageId(1),
            RequestId(7),
            reply(&replies),
        );
        assert!(replies.borrow().is_empty());

        // Known but not yet permitted: answered on grant.
        gate.on_permission_request(&registry, &id, PageId(1), RequestId(8), reply(&replies));
        assert!(replies.borrow().is_empty());
        gate.grant_permission(&ext);
        assert_eq!(*replies.borrow(), vec![RequestId(8)]);

        // Already permitted: answered synchronously.
        gate.on_permission_request(&registry, &id, PageId(1), RequestId(9), reply(&replies));
        assert_eq!(*replies.borrow(), vec![RequestId(8), RequestId(9)]);
    }

    #[test]
    fn test_permission_request_for_stale_page_ignored() {
        let registry = ExtensionManager::new();
        let id = registry
            .load_extension(Manifest::new("alpha", "1.0"))
            .unwrap();
        let ext = registry.get_extension(&id).unwrap();

        let gate = gate_on(2);
        let replies = Rc::new(RefCell::new(vec![]));

        let reply = |replies: &Rc<RefCell<alloc::vec::Vec<RequestId>>>| -> PermissionReply {
            let replies = replies.clone();
            Box::new(move |request_id| replies.borrow_mut().push(request_id))
        };

        // Not yet permitted: a request from a navigated-away page must not
        // be queued, so a later grant must not answer it.
        gate.on_permission_request(&registry, &id, PageId(1), RequestId(41), reply(&replies));
        gate.grant_permission(&ext);
        assert!(replies.borrow().is_empty());

        // Already permitted: the stale page must not be answered in-line
        // either.
        gate.on_permission_request(&registry, &id, PageId(1), RequestId(42), reply(&replies));
        assert!(replies.borrow().is_empty());

        // The current page still gets its synchronous answer.
        gate.on_permission_request(&registry, &id, PageId(2), RequestId(43), reply(&replies));
        assert_eq!(*replies.borrow(), vec![RequestId(43)]);
    }

    #[test]
    fn test_ad_injectors_scoped_to_page() {
        let gate = gate_on(1);
        let alpha = ExtensionId::new("alpha");
        let beta = ExtensionId::new("beta");

        gate.on_ad_injection_detected(&[alpha.clone(), beta.clone(), alpha.clone()]);
        assert_eq!(gate.ad_injectors(), vec![alpha, beta]);

        gate.on_navigated(PageId(2));
        assert!(gate.ad_injectors().is_empty());
    }

    #[test]
    fn test_grant_without_queue_is_noop() {
        let gate = gate_on(1);
        let ext = extension("alpha");

        gate.grant_permission(&ext);
        assert!(!gate.requires_consent(&ext));
        assert_eq!(gate.current_page(), PageId(1));
    }
}
