//! End-to-end refresh scenarios against an in-process assertion service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assertrefresh_core::{
    ActionError, ActionRequest, ActionResponse, Assertion, AssertionRef, AssertionResult,
    AssertionType, AtRevision, DeclarationRefresher, DeviceContext, GroupError, Grouping,
    MemoryTrustDb, Model, PackageState, PoolError, RefreshConfig, RefreshError, RefreshState,
    ResolveFailure, SharedState, Transport, TransportError, TrustDb, UserId, UserIdentity,
    STORE_GROUP,
};
use async_trait::async_trait;
use proptest::prelude::*;

// =============================================================================
// Fixtures
// =============================================================================

fn account(id: &str) -> AssertionRef {
    AssertionRef::new(AssertionType::Account, vec![id.into()])
}

fn account_key() -> AssertionRef {
    AssertionRef::new(AssertionType::AccountKey, vec!["publisher-key".into()])
}

fn decl(id: &str, rev: i32) -> Assertion {
    Assertion::new(AssertionRef::declaration("16", id), rev)
        .with_prerequisite(account_key())
        .with_prerequisite(account("publisher"))
}

fn package_id(i: usize) -> String {
    format!("pkg{i:03}-id")
}

fn url_of(reference: &AssertionRef) -> String {
    format!(
        "https://assertions.example/{}/{}",
        reference.assertion_type,
        reference.primary_key.join("/")
    )
}

struct Host {
    db: Arc<MemoryTrustDb>,
    transport: Arc<FakeTransport>,
    users: HashMap<UserId, UserIdentity>,
}

impl RefreshState for Host {
    fn assertion_db(&self) -> Arc<dyn TrustDb> {
        self.db.clone()
    }

    fn user(&self, id: UserId) -> Option<UserIdentity> {
        self.users.get(&id).cloned()
    }

    fn transport(&self, _device: &DeviceContext) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

/// Serves the latest revisions in `server`.
#[derive(Default)]
struct FakeTransport {
    server: Mutex<BTreeMap<AssertionRef, Assertion>>,
    status: Mutex<Option<u16>>,
    failing_downloads: Mutex<HashSet<String>>,
    /// Label every result with this grouping instead of the requested one.
    grouping_override: Mutex<Option<Grouping>>,
    lock_watch: Mutex<Option<SharedState<Host>>>,
    lock_held_during_call: AtomicBool,
    request_calls: AtomicUsize,
    download_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    requested: Mutex<Vec<AtRevision>>,
    users_seen: Mutex<Vec<Option<UserId>>>,
}

impl FakeTransport {
    fn publish(&self, assertion: Assertion) {
        self.server
            .lock()
            .unwrap()
            .insert(assertion.reference(), assertion);
    }

    fn observe(&self, user: Option<&UserIdentity>) {
        self.users_seen.lock().unwrap().push(user.map(|u| u.id));
        if let Some(shared) = self.lock_watch.lock().unwrap().as_ref() {
            if shared.is_locked() {
                self.lock_held_during_call.store(true, Ordering::SeqCst);
            }
        }
    }

    fn requested_declarations(&self) -> Vec<AssertionRef> {
        self.requested
            .lock()
            .unwrap()
            .iter()
            .filter(|at| at.reference.assertion_type == AssertionType::PackageDeclaration)
            .map(|at| at.reference.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request_assertions(
        &self,
        request: &ActionRequest,
        user: Option<&UserIdentity>,
    ) -> Result<ActionResponse, TransportError> {
        self.observe(user);
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.status.lock().unwrap() {
            return Err(TransportError::UnexpectedHttpStatus {
                status,
                method: "POST".into(),
                url: "https://assertions.example/v2/refresh".into(),
            });
        }

        let server = self.server.lock().unwrap();
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for group in &request.groups {
            let mut stream_urls = Vec::new();
            for at in &group.assertions {
                self.requested.lock().unwrap().push(at.clone());
                match server.get(&at.reference) {
                    None => failures.push(ResolveFailure::Assertion {
                        reference: at.reference.clone(),
                        error: GroupError::NotFound(at.reference.clone()),
                    }),
                    Some(latest) if !at.is_revision_known() || latest.revision > at.revision => {
                        stream_urls.push(url_of(&at.reference))
                    }
                    Some(_) => {}
                }
            }
            if !stream_urls.is_empty() {
                let grouping = self.grouping_override.lock().unwrap().clone();
                results.push(AssertionResult {
                    grouping: grouping.unwrap_or_else(|| group.grouping.clone()),
                    stream_urls,
                });
            }
        }

        if results.is_empty() {
            return Err(ActionError {
                no_results: true,
                other: Vec::new(),
                failures,
            }
            .into());
        }
        Ok(ActionResponse { results, failures })
    }

    async fn download_assertions(
        &self,
        urls: &[String],
        user: Option<&UserIdentity>,
    ) -> Result<Vec<Assertion>, TransportError> {
        self.observe(user);
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_downloads.lock().unwrap();
        let server = self.server.lock().unwrap();
        urls.iter()
            .map(|url| {
                if failing.contains(url) {
                    return Err(TransportError::Network(format!("connection reset fetching {url}")));
                }
                server
                    .iter()
                    .find(|(r, _)| url_of(r) == *url)
                    .map(|(_, a)| a.clone())
                    .ok_or_else(|| TransportError::Network(format!("no stream at {url}")))
            })
            .collect()
    }

    async fn fetch_assertion(
        &self,
        reference: &AssertionRef,
        user: Option<&UserIdentity>,
    ) -> Result<Assertion, TransportError> {
        self.observe(user);
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.server
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(reference.clone()))
    }
}

struct Fixture {
    shared: SharedState<Host>,
    db: Arc<MemoryTrustDb>,
    transport: Arc<FakeTransport>,
    packages: BTreeMap<String, PackageState>,
}

/// `n` packages installed at declaration revision 1; the server has `server_rev`.
fn fixture(n: usize, server_rev: i32) -> Fixture {
    let mut local = vec![
        Assertion::new(account("publisher"), 0),
        Assertion::new(account_key(), 0).with_prerequisite(account("publisher")),
    ];
    let transport = Arc::new(FakeTransport::default());
    for a in &local {
        transport.publish(a.clone());
    }

    let mut packages = BTreeMap::new();
    for i in 0..n {
        let id = package_id(i);
        local.push(decl(&id, 1));
        transport.publish(decl(&id, server_rev));
        packages.insert(format!("pkg{i:03}"), PackageState::with_declaration(id));
    }

    let db = Arc::new(MemoryTrustDb::with_assertions(local));
    let users = HashMap::from([(
        7,
        UserIdentity {
            id: 7,
            username: "alice".into(),
            macaroon: "macaroon".into(),
        },
    )]);
    let shared = SharedState::new(Host {
        db: db.clone(),
        transport: transport.clone(),
        users,
    });
    *transport.lock_watch.lock().unwrap() = Some(shared.clone());

    Fixture {
        shared,
        db,
        transport,
        packages,
    }
}

fn refresher(max_groups: usize) -> DeclarationRefresher {
    DeclarationRefresher::new(RefreshConfig::builder().max_groups(max_groups).build().unwrap())
}

fn no_store() -> DeviceContext {
    DeviceContext::new(Model {
        brand_id: "brand".into(),
        model: "kiosk".into(),
        store: None,
    })
}

fn with_store(store: &str) -> DeviceContext {
    DeviceContext::new(Model {
        brand_id: "brand".into(),
        model: "kiosk".into(),
        store: Some(store.into()),
    })
}

fn declaration_revision(db: &MemoryTrustDb, id: &str) -> i32 {
    db.find(&AssertionRef::declaration("16", id)).unwrap().revision
}

// =============================================================================
// Chunking
// =============================================================================

#[tokio::test]
async fn three_hundred_packages_take_two_passes() {
    let fx = fixture(300, 2);
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .expect("refresh should succeed");

    assert_eq!(refresher.metrics().passes_total.get(), 2);
    assert_eq!(refresher.metrics().groups_failed.get(), 0);
    for i in 0..300 {
        assert_eq!(declaration_revision(&fx.db, &package_id(i)), 2);
    }

    let requested = fx.transport.requested_declarations();
    let distinct: HashSet<_> = requested.iter().collect();
    assert_eq!(requested.len(), 300);
    assert_eq!(distinct.len(), 300);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn passes_follow_chunk_size(n in 0usize..40, max_groups in 1usize..9) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (passes, requested) = rt.block_on(async {
            let fx = fixture(n, 1);
            let refresher = refresher(max_groups);
            let mut guard = fx.shared.lock().await;
            refresher
                .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
                .await
                .unwrap();
            (
                refresher.metrics().passes_total.get() as usize,
                fx.transport.requested_declarations(),
            )
        });

        prop_assert_eq!(passes, n / max_groups + 1);
        let distinct: HashSet<_> = requested.iter().collect();
        prop_assert_eq!(requested.len(), n);
        prop_assert_eq!(distinct.len(), n);
    }
}

// =============================================================================
// Per-group errors
// =============================================================================

#[tokio::test]
async fn unresolvable_declaration_is_one_entry() {
    let fx = fixture(1, 1);
    fx.transport
        .server
        .lock()
        .unwrap()
        .remove(&AssertionRef::declaration("16", &package_id(0)));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .unwrap_err();

    let resolve = err.as_resolve().expect("aggregated error");
    assert_eq!(resolve.errors.len(), 1);
    assert!(resolve.errors["pkg000"].is_not_found());
    assert!(err
        .to_string()
        .starts_with("cannot refresh package-declarations for packages:\n - pkg000: "));
}

#[tokio::test]
async fn download_failure_is_scoped_to_its_group() {
    let fx = fixture(2, 3);
    let broken = url_of(&AssertionRef::declaration("16", &package_id(0)));
    fx.transport.failing_downloads.lock().unwrap().insert(broken);
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .unwrap_err();

    let resolve = err.as_resolve().expect("aggregated error");
    assert_eq!(resolve.errors.keys().collect::<Vec<_>>(), vec!["pkg000"]);
    assert!(matches!(resolve.errors["pkg000"], GroupError::Fetch(_)));
    assert_eq!(declaration_revision(&fx.db, &package_id(0)), 1);
    assert_eq!(declaration_revision(&fx.db, &package_id(1)), 3);
    assert_eq!(refresher.metrics().download_failures.get(), 1);
}

#[tokio::test]
async fn too_new_format_keeps_local_revision() {
    let fx = fixture(1, 1);
    fx.transport.publish(decl(&package_id(0), 2).with_format(99));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .expect("unsupported format is tolerated");

    assert_eq!(declaration_revision(&fx.db, &package_id(0)), 1);
}

#[tokio::test]
async fn result_for_unknown_grouping_aborts_the_pass() {
    let fx = fixture(2, 2);
    *fx.transport.grouping_override.lock().unwrap() = Some(Grouping("99".into()));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .unwrap_err();

    assert!(
        matches!(&err, RefreshError::Pool(PoolError::UnknownGrouping(g)) if g.as_str() == "99"),
        "{err}"
    );
    assert!(err.as_resolve().is_none());
    assert!(!err.is_fallback());
    assert!(guard.is_locked());
    assert_eq!(declaration_revision(&fx.db, &package_id(0)), 1);
    assert_eq!(declaration_revision(&fx.db, &package_id(1)), 1);
}

// =============================================================================
// Store assertion
// =============================================================================

#[tokio::test]
async fn store_never_found_is_not_a_failure() {
    let fx = fixture(3, 2);
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &with_store("acme"))
        .await
        .expect("missing store is suppressed");

    assert!(!fx.db.contains(&AssertionRef::store("acme")));
    let requested = fx.transport.requested.lock().unwrap().clone();
    assert!(requested
        .iter()
        .any(|at| at.reference == AssertionRef::store("acme") && !at.is_revision_known()));
}

#[tokio::test]
async fn missing_store_is_fetched_with_prerequisites() {
    let fx = fixture(1, 1);
    let operator = account("acme-operator");
    fx.transport.publish(Assertion::new(operator.clone(), 0));
    fx.transport.publish(
        Assertion::new(AssertionRef::store("acme"), 1).with_prerequisite(operator.clone()),
    );
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &with_store("acme"))
        .await
        .unwrap();

    assert!(fx.db.contains(&operator));
    assert_eq!(fx.db.find(&AssertionRef::store("acme")).unwrap().revision, 1);
}

#[tokio::test]
async fn local_store_is_updated() {
    let fx = fixture(0, 1);
    fx.db
        .add(Assertion::new(AssertionRef::store("acme"), 1))
        .unwrap();
    fx.transport
        .publish(Assertion::new(AssertionRef::store("acme"), 4));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &with_store("acme"))
        .await
        .unwrap();

    assert_eq!(fx.db.find(&AssertionRef::store("acme")).unwrap().revision, 4);
    assert_eq!(refresher.metrics().passes_total.get(), 1);
}

// =============================================================================
// Fallback and fatal errors
// =============================================================================

#[tokio::test]
async fn client_status_requests_fallback() {
    for status in [400, 450, 500] {
        let fx = fixture(2, 2);
        *fx.transport.status.lock().unwrap() = Some(status);
        let refresher = refresher(256);
        let mut guard = fx.shared.lock().await;

        let err = refresher
            .bulk_refresh(&mut guard, &fx.packages, 0, &no_store())
            .await
            .unwrap_err();
        assert!(err.is_fallback(), "status {status}: {err}");
        assert!(guard.is_locked());
    }
}

#[tokio::test]
async fn server_status_above_500_is_fatal() {
    let fx = fixture(2, 2);
    *fx.transport.status.lock().unwrap() = Some(501);
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RefreshError::Transport(TransportError::UnexpectedHttpStatus { status: 501, .. })
    ));
    assert_eq!(fx.transport.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refresh_falls_back_to_one_by_one() {
    let fx = fixture(3, 5);
    *fx.transport.status.lock().unwrap() = Some(450);
    let operator = account("acme-operator");
    fx.transport.publish(Assertion::new(operator.clone(), 0));
    fx.transport
        .publish(Assertion::new(AssertionRef::store("acme"), 1).with_prerequisite(operator));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .refresh(&mut guard, &fx.packages, 0, &with_store("acme"))
        .await
        .expect("fallback should succeed");

    assert_eq!(refresher.metrics().fallbacks_total.get(), 1);
    for i in 0..3 {
        assert_eq!(declaration_revision(&fx.db, &package_id(i)), 5);
    }
    assert!(fx.db.contains(&AssertionRef::store("acme")));
    assert!(fx.transport.fetch_calls.load(Ordering::SeqCst) >= 5);
    assert!(!fx.transport.lock_held_during_call.load(Ordering::SeqCst));
}

#[tokio::test]
async fn one_by_one_reports_missing_declarations() {
    let fx = fixture(2, 2);
    fx.transport
        .server
        .lock()
        .unwrap()
        .remove(&AssertionRef::declaration("16", &package_id(1)));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .refresh_one_by_one(&mut guard, &fx.packages, 0, &with_store("nowhere"))
        .await
        .unwrap_err();

    let resolve = err.as_resolve().expect("aggregated error");
    assert_eq!(resolve.errors.keys().collect::<Vec<_>>(), vec!["pkg001"]);
    assert!(!resolve.errors.contains_key(STORE_GROUP));
    assert_eq!(declaration_revision(&fx.db, &package_id(0)), 2);
}

#[tokio::test]
async fn disabled_fallback_surfaces_the_signal() {
    let fx = fixture(1, 2);
    *fx.transport.status.lock().unwrap() = Some(400);
    let refresher =
        DeclarationRefresher::new(RefreshConfig::builder().fallback(false).build().unwrap());
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .refresh(&mut guard, &fx.packages, 0, &no_store())
        .await
        .unwrap_err();
    assert!(err.is_fallback());
    assert_eq!(fx.transport.fetch_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Lock discipline and users
// =============================================================================

#[tokio::test]
async fn lock_is_released_for_every_transport_call() {
    let fx = fixture(10, 2);
    let refresher = refresher(4);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 0, &with_store("acme"))
        .await
        .unwrap();

    assert!(fx.transport.request_calls.load(Ordering::SeqCst) > 0);
    assert!(fx.transport.download_calls.load(Ordering::SeqCst) > 0);
    assert!(!fx.transport.lock_held_during_call.load(Ordering::SeqCst));
    assert!(guard.is_locked());
    assert!(fx.shared.is_locked());
}

#[tokio::test]
async fn user_credentials_reach_the_transport() {
    let fx = fixture(1, 2);
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    refresher
        .bulk_refresh(&mut guard, &fx.packages, 7, &no_store())
        .await
        .unwrap();
    let seen = fx.transport.users_seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|u| *u == Some(7)));

    let err = refresher
        .bulk_refresh(&mut guard, &fx.packages, 42, &no_store())
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::UnknownUser(42)));
}

#[tokio::test]
async fn missing_local_declaration_aborts_preparation() {
    let fx = fixture(1, 2);
    let mut packages = fx.packages.clone();
    packages.insert("stray".into(), PackageState::with_declaration("not-installed-id"));
    let refresher = refresher(256);
    let mut guard = fx.shared.lock().await;

    let err = refresher
        .bulk_refresh(&mut guard, &packages, 0, &no_store())
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::Prepare { ref package, .. } if package == "stray"));
    assert_eq!(fx.transport.request_calls.load(Ordering::SeqCst), 0);
}
