//! End-to-end activation: gated hooks launching control loops.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::launcher::{ControlLoopLauncher, LoopSpec, ReconcileError, Reconciler};
use kiln_core::lifecycle::{activation_hook_name, HookOutcome};
use kiln_core::source::{DataSource, InMemorySource};
use kiln_core::{ClientConfig, GateRequirement, HookError, KilnConfig, LifecycleManager, SyncGates};
use tracing_subscriber::fmt::MakeWriter;

const POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Counter(AtomicUsize);

#[async_trait]
impl Reconciler for Counter {
    async fn reconcile(&self, _key: &str) -> Result<(), ReconcileError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn register(
    manager: &LifecycleManager,
    launcher: &ControlLoopLauncher,
    unit: &'static str,
    requirement: GateRequirement,
    source: Arc<InMemorySource>,
) {
    let launcher = launcher.clone();
    manager
        .register_activation_hook(activation_hook_name(unit), move |ctx| async move {
            ctx.wait_for(requirement).await?;
            let sources: Vec<Arc<dyn DataSource>> = vec![source];
            launcher
                .wait_for_sources(&sources, ctx.cancellation_token())
                .await?;
            launcher.launch(
                LoopSpec {
                    unit: unit.to_string(),
                    workers: 2,
                    sources,
                    reconciler: Arc::new(Counter::default()),
                },
                ctx.cancellation_token(),
            )?;
            Ok(())
        })
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(POLL * 5).await;
}

/// Log lines written by a fmt subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gated_hooks_launch_in_gate_order_and_stop_on_cancel() {
    let gates = SyncGates::new();
    let manager = LifecycleManager::new(gates.clone());
    let mut config = KilnConfig::default();
    config.controllers.sync_poll_interval = POLL;
    let launcher = ControlLoopLauncher::new(ClientConfig::new("http://127.0.0.1:1"), &config);

    let a_source = Arc::new(InMemorySource::new("a-items"));
    let b_source = Arc::new(InMemorySource::new("b-items"));
    a_source.mark_synced();
    b_source.mark_synced();

    register(&manager, &launcher, "a", GateRequirement::Required, a_source);
    register(
        &manager,
        &launcher,
        "b",
        GateRequirement::RequiredAndOptional,
        b_source,
    );

    let run = manager.run_activation_hooks().unwrap();
    settle().await;
    assert!(launcher.supervisor().handles().is_empty(), "no gate signaled yet");

    gates.required.signal();
    settle().await;
    assert!(launcher.supervisor().handle("a").is_some());
    assert!(launcher.supervisor().handle("b").is_none());

    gates.optional.signal();
    settle().await;
    let a = launcher.supervisor().handle("a").unwrap();
    let b = launcher.supervisor().handle("b").unwrap();
    assert!(b.started_at() >= a.started_at());

    let report = run.join().await;
    assert_eq!(report.completed().len(), 2);

    manager.cancel();
    assert!(launcher.supervisor().wait_stopped(POLL * 2).await);
    assert!(a.is_stopped());
    assert!(b.is_stopped());
    assert!(launcher.supervisor().active_workers().is_empty());
}

#[tokio::test]
async fn test_hook_on_unsignaled_gate_is_canceled() {
    let gates = SyncGates::new();
    let manager = LifecycleManager::new(gates.clone());
    let launcher = ControlLoopLauncher::new(
        ClientConfig::new("http://127.0.0.1:1"),
        &KilnConfig::default(),
    );
    register(
        &manager,
        &launcher,
        "never",
        GateRequirement::Required,
        Arc::new(InMemorySource::new("never-items")),
    );

    let run = manager.run_activation_hooks().unwrap();
    settle().await;
    manager.cancel();

    let report = tokio::time::timeout(Duration::from_secs(1), run.join())
        .await
        .unwrap();
    let name = activation_hook_name("never");
    assert!(matches!(
        report.outcome(&name),
        Some(HookOutcome::Canceled { reason }) if reason.contains("required sources")
    ));
    assert!(report.faulted().is_empty());
    assert!(launcher.supervisor().handles().is_empty());
}

#[tokio::test]
async fn test_unsynced_source_holds_launch_after_gate() {
    let gates = SyncGates::new();
    let manager = LifecycleManager::new(gates.clone());
    let mut config = KilnConfig::default();
    config.controllers.sync_poll_interval = POLL;
    let launcher = ControlLoopLauncher::new(ClientConfig::new("http://127.0.0.1:1"), &config);

    let exports = Arc::new(InMemorySource::new("exports"));
    register(
        &manager,
        &launcher,
        "export-controller",
        GateRequirement::Required,
        Arc::clone(&exports),
    );
    gates.required.signal();

    let run = manager.run_activation_hooks().unwrap();
    settle().await;
    assert!(launcher.supervisor().handle("export-controller").is_none());

    exports.mark_synced();
    settle().await;
    assert!(launcher.supervisor().handle("export-controller").is_some());

    run.join().await;
    manager.cancel();
}

#[tokio::test]
async fn test_faulted_hook_logged_at_error_with_its_name() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let manager = LifecycleManager::new(SyncGates::new());
    manager
        .register_activation_hook(activation_hook_name("billing"), |_ctx| async {
            Err(HookError::failed("quota store unreachable"))
        })
        .unwrap();
    manager
        .register_activation_hook(activation_hook_name("identity"), |_ctx| async { Ok(()) })
        .unwrap();

    let report = manager.run_activation_hooks().unwrap().join().await;
    assert_eq!(report.faulted(), vec!["kiln-start-billing"]);

    let output = logs.contents();
    let failed = output
        .lines()
        .find(|line| line.contains("activation hook failed"))
        .unwrap_or_else(|| panic!("no failure line in:\n{output}"));
    assert!(failed.contains("ERROR"));
    assert!(failed.contains("activation_hook=kiln-start-billing"));
    assert!(failed.contains("quota store unreachable"));
    assert!(output
        .lines()
        .any(|line| line.contains(" INFO ") && line.contains("kiln-start-identity")));
}
