/// Integration tests for primary/standby startup and failover.
///
/// Most tests run the full control plane against the in-process registry
/// and selector, with real `SO_REUSEPORT` sockets. The kernel test at the
/// bottom needs root, bpffs and a compiled selector object.
use std::net::SocketAddr;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hotstandby::registrar::SelectorState;
use hotstandby::service::{self, ServiceInfo};
use hotstandby::{
    select, DegradationKind, Error, MemoryRegistry, MemorySelector, PinnedPath, ProcNetProbe,
    Registrar, RegistryView, Resolution, Role, Selection, Startup, TargetRegistry,
};

fn no_peer(_: SocketAddr) -> hotstandby::Result<bool> {
    Ok(false)
}

/// A loopback address whose port is currently free.
fn free_addr() -> SocketAddr {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap()
}

fn spawn_service(startup: Startup, name: &str) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let info = ServiceInfo {
        node_name: name.to_owned(),
        role: startup.role,
    };
    let listener = startup.listener.into_inner();
    let handle = tokio::spawn(service::serve_until(listener, info, async {
        let _ = rx.await;
    }));
    (tx, handle)
}

async fn hello(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split("\r\n\r\n")
        .nth(1)
        .unwrap_or_default()
        .to_owned()
}

#[tokio::test]
async fn invalid_role_has_no_side_effects() {
    let registry = MemoryRegistry::new();
    let selector = MemorySelector::new();
    let registrar = Registrar::new(&registry, &selector);
    let addr = free_addr();

    for bad in ["", "PRIMARY!", "standy", "backup", "1"] {
        let err = registrar.start(bad, addr, &no_peer).unwrap_err();
        assert!(matches!(err, Error::InvalidRole(_)), "{bad:?} gave {err}");
        assert!(err.is_fatal());
    }

    assert_eq!(selector.attach_count(), 0);
    for role in Role::ALL {
        assert!(matches!(registry.get(role), Err(Error::NotFound(_))));
    }
    // Nothing was bound: a plain listener can still take the port.
    assert!(std::net::TcpListener::bind(addr).is_ok());
}

/// Replays one startup race. Every process resolves first (so every primary
/// sees `peer_present = false`), then registers in an order drawn from `seed`.
async fn replay_race(seed: u64) -> Vec<(Role, SelectorState)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let primaries = rng.gen_range(2..=8);
    let mut roles = vec![Role::Primary; primaries];
    if rng.gen_bool(0.5) {
        roles.push(Role::Standby);
    }
    roles.shuffle(&mut rng);

    let registry = Arc::new(MemoryRegistry::new());
    let selector = MemorySelector::new();
    let resolutions: Vec<Resolution> = roles
        .iter()
        .map(|&role| Resolution {
            role,
            peer_present: false,
        })
        .collect();

    let mut addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut started = Vec::new();
    for resolution in resolutions {
        // Each process has its own handle onto the shared group state.
        let installer = selector.clone();
        let registrar = Registrar::new(&*registry, &installer);
        let startup = registrar.register(addr, resolution).unwrap();
        addr = startup.listener.local_addr().unwrap();
        started.push(startup);
    }

    assert_eq!(selector.attach_count(), 1, "seed {seed}");
    started.iter().map(|s| (s.role, s.selector)).collect()
}

#[tokio::test]
async fn concurrent_primaries_install_exactly_once() {
    for seed in 0..32 {
        let outcome = replay_race(seed).await;
        let installed = outcome
            .iter()
            .filter(|(_, s)| *s == SelectorState::Installed)
            .count();
        assert_eq!(installed, 1, "seed {seed}: {outcome:?}");
        for (role, state) in &outcome {
            match role {
                Role::Standby => assert_eq!(*state, SelectorState::Skipped),
                Role::Primary => assert!(matches!(
                    state,
                    SelectorState::Installed | SelectorState::AlreadyInstalled
                )),
            }
        }
        // Same seed, same interleaving, same result.
        assert_eq!(outcome, replay_race(seed).await);
    }
}

#[test]
fn racing_primary_threads_install_exactly_once() {
    let n = 8;
    let selector = MemorySelector::new();
    let registry = Arc::new(MemoryRegistry::new());
    let barrier = Arc::new(Barrier::new(n));

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let selector = selector.clone();
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let registrar = Registrar::new(&*registry, &selector);
                    barrier.wait();
                    let startup = registrar
                        .start("primary", "127.0.0.1:0".parse().unwrap(), &no_peer)
                        .unwrap();
                    (startup.selector, startup.installation)
                })
            })
        })
        .collect();

    // Installations stay alive until every thread has finished.
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let installed = results
        .iter()
        .filter(|(s, _)| *s == SelectorState::Installed)
        .count();
    assert_eq!(installed, 1);
    assert_eq!(selector.attach_count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|(_, i)| i.as_ref().map(|i| i.attached()).unwrap_or(false))
            .count(),
        1
    );
}

#[tokio::test]
async fn standby_takes_over_when_primary_dies() {
    let registry = Arc::new(MemoryRegistry::new());
    let selector = MemorySelector::new();
    let probe = ProcNetProbe::default();
    let addr = free_addr();

    let primary = Registrar::new(&*registry, &selector)
        .start("primary", addr, &probe)
        .unwrap();
    assert!(!primary.peer_present);
    assert_eq!(primary.selector, SelectorState::Installed);
    let primary_ref = primary.published.unwrap();

    let standby = Registrar::new(&*registry, &selector)
        .start("standby", addr, &probe)
        .unwrap();
    assert!(standby.peer_present, "standby should see the primary's listener");
    assert_eq!(standby.selector, SelectorState::Skipped);
    let standby_ref = standby.published.unwrap();
    assert_eq!(selector.attach_count(), 1);

    assert_eq!(registry.get(Role::Primary).unwrap(), primary_ref);
    assert_eq!(registry.get(Role::Standby).unwrap(), standby_ref);

    let view = RegistryView::capture(&*registry, |_| true);
    assert_eq!(
        select(&view),
        Selection::Route { role: Role::Primary, listener: primary_ref }
    );

    let _primary_install = primary.installation;
    let (stop_primary, primary_task) = spawn_service(
        Startup {
            installation: None,
            ..primary
        },
        "primary-node",
    );
    let (stop_standby, standby_task) = spawn_service(standby, "standby-node");

    // Kill the primary: its socket closes, its registry slot goes stale.
    stop_primary.send(()).unwrap();
    primary_task.await.unwrap();

    let view = RegistryView::capture(&*registry, |r| r == standby_ref);
    assert_eq!(view.primary.map(|t| t.live), Some(false));
    assert_eq!(
        select(&view),
        Selection::Route { role: Role::Standby, listener: standby_ref }
    );

    for _ in 0..5 {
        assert_eq!(hello(addr).await, "hello from standby-node (standby)\n");
    }

    stop_standby.send(()).unwrap();
    standby_task.await.unwrap();
}

#[tokio::test]
async fn unreachable_registry_at_standby_startup() {
    let path = std::env::temp_dir().join(format!("hotstandby-missing-{}", rand::random::<u64>()));
    let registry = PinnedPath(path);
    let selector = MemorySelector::new();
    let addr = free_addr();

    let standby = Registrar::new(&registry, &selector)
        .start("standby", addr, &no_peer)
        .unwrap();
    assert_eq!(standby.published, None);
    assert_eq!(standby.degradations.len(), 1);
    assert_eq!(standby.degradations[0].kind, DegradationKind::RegistryUnavailable);

    // Reads fail the same way every time; nothing is cached.
    for _ in 0..3 {
        assert!(matches!(
            registry.get(Role::Primary),
            Err(Error::RegistryUnavailable { .. })
        ));
    }

    let (stop, task) = spawn_service(standby, "lonely-standby");
    assert_eq!(hello(addr).await, "hello from lonely-standby (standby)\n");
    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn missing_selector_artifact_still_serves() {
    let registry = MemoryRegistry::new();
    let selector = MemorySelector::failing("artifact ./bpf/failover_select.o unreadable");
    let addr = free_addr();

    let primary = Registrar::new(&registry, &selector)
        .start("primary", addr, &no_peer)
        .unwrap();
    assert_eq!(primary.selector, SelectorState::Failed);
    assert_eq!(primary.degradations[0].kind, DegradationKind::SelectorLoad);
    assert!(primary.published.is_some());

    let (stop, task) = spawn_service(primary, "p");
    assert_eq!(hello(addr).await, "hello from p (primary)\n");
    stop.send(()).unwrap();
    task.await.unwrap();
}

/// Full kernel path. Run as root with bpffs mounted and
/// `HOTSTANDBY_TEST_OBJECT` pointing at a compiled `failover_select.o`:
/// `cargo test -- --ignored kernel_selector`.
#[tokio::test]
#[ignore]
async fn kernel_selector_prefers_primary_then_fails_over() {
    let object = std::env::var("HOTSTANDBY_TEST_OBJECT").expect("HOTSTANDBY_TEST_OBJECT");
    let id = rand::random::<u32>();
    let config = hotstandby::FailoverConfig {
        listen: free_addr(),
        bpf_dir: "/sys/fs/bpf".into(),
        map_name: format!("hotstandby_test_{id:x}"),
        object: object.into(),
        entry: "select_listener".into(),
        lock_path: std::env::temp_dir().join(format!("hotstandby-test-{id:x}.lock")),
        backlog: 128,
        install_wait: std::time::Duration::from_secs(2),
        node_name: "kernel".into(),
    };
    let (registry, selector) = (config.registry(), config.selector());
    let probe = ProcNetProbe::default();

    let primary = Registrar::new(&registry, &selector)
        .start("primary", config.listen, &probe)
        .unwrap();
    assert_eq!(primary.selector, SelectorState::Installed, "{:?}", primary.degradations);
    let standby = Registrar::new(&registry, &selector)
        .start("standby", config.listen, &probe)
        .unwrap();
    assert!(!standby.is_degraded(), "{:?}", standby.degradations);

    let _install = primary.installation;
    let (stop_primary, primary_task) = spawn_service(
        Startup {
            installation: None,
            ..primary
        },
        "kp",
    );
    let (stop_standby, standby_task) = spawn_service(standby, "ks");

    for _ in 0..20 {
        assert_eq!(hello(config.listen).await, "hello from kp (primary)\n");
    }

    stop_primary.send(()).unwrap();
    primary_task.await.unwrap();
    assert!(matches!(registry.get(Role::Primary), Err(Error::NotFound(_))));
    for _ in 0..20 {
        assert_eq!(hello(config.listen).await, "hello from ks (standby)\n");
    }

    stop_standby.send(()).unwrap();
    standby_task.await.unwrap();
    let _ = std::fs::remove_file(config.registry_path());
    let _ = std::fs::remove_file(&config.lock_path);
}
