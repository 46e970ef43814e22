//! Hotstandby — SO_REUSEPORT failover between a primary and a standby
//! process, steered in the kernel.
//!
//! Both processes bind the same `IP:port` with `SO_REUSEPORT`. An
//! `sk_reuseport` BPF program attached to the socket group picks the
//! listener for every new connection from a pinned role → socket map:
//!
//! 1. **Target registry** ([`registry`]) — the pinned map, written by each
//!    process under its role key and outliving all of them.
//! 2. **Connection selector** ([`selector`], [`artifact`]) — primary if its
//!    socket is live, else standby, else reject. Loaded from an externally
//!    compiled object.
//! 3. **Role resolver** ([`resolver`], [`probe`]) — validates the declared
//!    role and checks `/proc/net/tcp*` for a listener already on the port.
//! 4. **Socket registrar** ([`registrar`], [`install`]) — binds, installs the
//!    selector once per group, publishes into the registry.
//!
//! Only an invalid role or an unusable address stops a process. Anything
//! else degrades failover and is reported, and the process keeps serving.
//!
//! ```no_run
//! # async fn run() -> Result<(), hotstandby::Error> {
//! use hotstandby::{FailoverConfig, ProcNetProbe, Registrar};
//!
//! let config = FailoverConfig::from_env();
//! let (registry, selector) = (config.registry(), config.selector());
//! let startup = Registrar::new(&registry, &selector)
//!     .start("primary", config.listen, &ProcNetProbe::default())?;
//! for d in &startup.degradations {
//!     eprintln!("degraded: {d}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod install;
pub mod probe;
pub mod registrar;
pub mod registry;
pub mod resolver;
pub mod role;
pub mod selector;
pub mod service;
pub mod sys;

pub use config::FailoverConfig;
pub use error::{Error, Result};
pub use install::{Installation, KernelSelector, MemorySelector, SelectorInstaller};
pub use probe::{PeerProbe, ProcNetProbe};
pub use registrar::{Degradation, DegradationKind, Phase, Registrar, SharedListener, Startup};
pub use registry::{ListenerRef, MemoryRegistry, PinnedPath, PinnedRegistry, TargetRegistry};
pub use resolver::Resolution;
pub use role::Role;
pub use selector::{select, RegistryView, Selection, Target};
