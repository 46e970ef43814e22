//! Hotstandby node: one member of a primary/standby pair sharing a port.
//!
//! Usage: `hotstandby <primary|standby>`; everything else comes from the
//! environment (see `FailoverConfig`).

use hotstandby::service::{self, ServiceInfo};
use hotstandby::{FailoverConfig, ProcNetProbe, Registrar};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let declared = std::env::args().nth(1).unwrap_or_default();
    let config = FailoverConfig::from_env();
    let registry = config.registry();
    let selector = config.selector();

    let mut registrar = Registrar::new(&registry, &selector);
    registrar.backlog = config.backlog;

    let startup = match registrar.start(&declared, config.listen, &ProcNetProbe::default()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("usage: hotstandby <primary|standby>");
            eprintln!();
            eprintln!("env vars:");
            eprintln!("  FAILOVER_LISTEN   — shared host:port (default: 127.0.0.1:8080)");
            eprintln!("  FAILOVER_BPF_DIR  — bpffs pin directory (default: /sys/fs/bpf/tc/globals)");
            eprintln!("  FAILOVER_MAP      — registry map name (default: failover_targets)");
            eprintln!("  FAILOVER_OBJECT   — compiled selector (default: ./bpf/failover_select.o)");
            eprintln!("  FAILOVER_ENTRY    — selector entry symbol (default: select_listener)");
            eprintln!("  FAILOVER_LOCK     — install lock file (default: $TMPDIR/hotstandby-selector.lock)");
            eprintln!("  FAILOVER_INSTALL_WAIT_MS — wait for another installer (default: 2000)");
            eprintln!("  NODE_NAME         — instance name (default: hostname)");
            return Err(e.into());
        }
    };

    let report = serde_json::to_string(&startup.report())?;
    if startup.is_degraded() {
        for d in &startup.degradations {
            tracing::warn!(kind = ?d.kind, detail = %d.detail, "running degraded");
        }
    }
    tracing::info!(report = %report, "startup complete");

    let info = ServiceInfo {
        node_name: config.node_name.clone(),
        role: startup.role,
    };
    let hotstandby::Startup {
        listener,
        installation: _installation,
        ..
    } = startup;

    service::serve_until(listener.into_inner(), info, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}
