//! Lifecycle and state machine tests against the in-memory ledger store
//!
//! Run with: cargo test -p flowgate --test flow_lifecycle_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use flowgate::{
    register, register_with_config, Approver, EngineConfig, FlowDefinition, FlowError,
    FlowState, FlowStep, InMemoryLedgerStore, LedgerStore, RejectPolicy, Step, StepClaim,
    StepOutcome, StepStatus, StoreError,
};

// ============================================
// Helpers
// ============================================

struct User {
    id: String,
    steps: Option<Vec<&'static str>>,
}

impl User {
    fn anyone(id: &str) -> Self {
        Self {
            id: id.to_string(),
            steps: None,
        }
    }

    fn only(id: &str, steps: &[&'static str]) -> Self {
        Self {
            id: id.to_string(),
            steps: Some(steps.to_vec()),
        }
    }
}

impl Approver for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_handle_flow_step(&self, _flow_id: &str, step_id: &str, _object_key: &str) -> bool {
        self.steps
            .as_ref()
            .map_or(true, |steps| steps.contains(&step_id))
    }
}

/// Records every handler invocation
#[derive(Clone, Default)]
struct Calls {
    count: Arc<AtomicUsize>,
    approved: Arc<Mutex<Vec<bool>>>,
}

impl Calls {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn step(&self, id: &str, fail: bool) -> Step<String> {
        let calls = self.clone();
        Step::new(id, format!("Sign off {id}")).with_handler(move |_: &String, approved| {
            calls.count.fetch_add(1, Ordering::SeqCst);
            calls.approved.lock().push(approved);
            if fail {
                anyhow::bail!("downstream system rejected the change");
            }
            Ok(())
        })
    }
}

/// Handler step that signals on entry and parks until released
fn gated_step(
    id: &str,
    calls: &Calls,
    fail: bool,
) -> (Step<String>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let calls = calls.clone();

    let step = Step::new(id, format!("Sign off {id}")).with_handler(move |_: &String, approved| {
        entered_tx.lock().send(()).ok();
        release_rx.lock().recv().ok();
        calls.count.fetch_add(1, Ordering::SeqCst);
        calls.approved.lock().push(approved);
        if fail {
            anyhow::bail!("downstream system rejected the change");
        }
        Ok(())
    });
    (step, entered_rx, release_tx)
}

fn plain(id: &str) -> Step<String> {
    Step::new(id, format!("Sign off {id}"))
}

/// CR = [[step-1], [step-2, step-3], [step-4]]
fn cr(store: &Arc<InMemoryLedgerStore>, config: EngineConfig) -> FlowDefinition<String> {
    register_with_config(
        "CR",
        store.clone(),
        vec![
            vec![plain("step-1")],
            vec![plain("step-2"), plain("step-3")],
            vec![plain("step-4")],
        ],
        config,
    )
    .unwrap()
}

fn ids(steps: &[FlowStep<'_, String>]) -> Vec<String> {
    steps.iter().map(|s| s.id().to_string()).collect()
}

// ============================================
// Lifecycle
// ============================================

#[tokio::test]
async fn test_concrete_cr_scenario() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-1"]);
    assert!(flow.in_progress().await.unwrap());

    let state = flow.approve("step-1", &alice, "ok").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 1 });
    assert_eq!(
        ids(&flow.next_steps().await.unwrap()),
        vec!["step-2", "step-3"]
    );

    flow.approve("step-2", &alice, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-3"]);

    flow.approve("step-3", &alice, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-4"]);

    let state = flow.approve("step-4", &alice, "ship it").await.unwrap();
    assert_eq!(state, FlowState::Completed);
    assert!(!flow.in_progress().await.unwrap());
    assert!(flow.next_steps().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_idempotent_clear() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());

    // Never started
    flow.clear().await.unwrap();
    assert_eq!(store.write_count(), 0);

    flow.start().await.unwrap();
    flow.clear().await.unwrap();
    // Already cleared
    flow.clear().await.unwrap();

    assert_eq!(store.write_count(), 2);
    assert_eq!(store.ledger_count(), 0);
    assert_eq!(flow.state().await.unwrap(), FlowState::NotStarted);
    assert!(!flow.in_progress().await.unwrap());
    assert!(flow.next_steps().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_resets_progress() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    flow.approve("step-1", &alice, "ok").await.unwrap();
    flow.approve("step-2", &alice, "ok").await.unwrap();

    flow.start().await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-1"]);
    assert!(flow.in_progress().await.unwrap());

    let ledger = store.get_steps("CR", "O1").await.unwrap();
    assert!(ledger.steps.iter().all(|s| s.outcome == StepOutcome::Pending));
}

#[tokio::test]
async fn test_restart_after_completion_and_clear() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let def = register::<String>("AB", store.clone(), vec![vec![plain("a")]]).unwrap();
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    flow.approve("a", &alice, "ok").await.unwrap();
    assert_eq!(flow.state().await.unwrap(), FlowState::Completed);

    // Completed -> start again
    flow.start().await.unwrap();
    assert_eq!(flow.state().await.unwrap(), FlowState::InProgress { stage: 0 });

    // Cleared -> start again
    flow.clear().await.unwrap();
    flow.start().await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a"]);
}

#[tokio::test]
async fn test_stage_gating() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let def = register::<String>(
        "G",
        store.clone(),
        vec![vec![plain("a"), plain("b")], vec![plain("c")]],
    )
    .unwrap();
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a", "b"]);

    let result = flow.approve("c", &alice, "too early").await;
    assert!(matches!(result, Err(FlowError::StepNotActionable { .. })));

    flow.approve("b", &alice, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a"]);

    flow.approve("a", &alice, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["c"]);
}

#[tokio::test]
async fn test_resolution_errors() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let alice = User::anyone("alice");

    let result = flow.approve("step-1", &alice, "ok").await;
    assert!(matches!(result, Err(FlowError::NotStarted { .. })));

    flow.start().await.unwrap();
    let result = flow.approve("step-9", &alice, "ok").await;
    assert!(matches!(result, Err(FlowError::UnknownStep { .. })));

    flow.approve("step-1", &alice, "ok").await.unwrap();
    let result = flow.approve("step-1", &alice, "twice").await;
    assert!(matches!(result, Err(FlowError::StepNotActionable { .. })));
}

#[tokio::test]
async fn test_resolution_is_recorded() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());

    flow.start().await.unwrap();
    let before = Utc::now();
    flow.approve("step-1", &User::anyone("alice"), "checked the diff")
        .await
        .unwrap();

    let ledger = store.get_steps("CR", "O1").await.unwrap();
    let row = ledger.step("step-1").unwrap();
    assert_eq!(row.outcome, StepOutcome::Approved);
    assert_eq!(row.resolved_by.as_deref(), Some("alice"));
    assert_eq!(row.rationale.as_deref(), Some("checked the diff"));
    assert!(row.resolved_at.unwrap() >= before);
    assert!(row.claim.is_none());
}

#[tokio::test]
async fn test_next_steps_resolve_directly() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    let next = flow.next_steps().await.unwrap();
    assert_eq!(next[0].message(), "Sign off step-1");

    let state = next[0].approve(&alice, "ok").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 1 });
}

// ============================================
// Authorization and handlers
// ============================================

#[tokio::test]
async fn test_forbidden_leaves_ledger_unchanged() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register::<String>("H", store.clone(), vec![vec![calls.step("a", false)]]).unwrap();
    let flow = def.bind("O1".to_string());
    let mallory = User::only("mallory", &["b"]);

    flow.start().await.unwrap();
    let before = store.get_steps("H", "O1").await.unwrap();
    let writes = store.write_count();

    let result = flow.approve("a", &mallory, "let me in").await;
    assert!(matches!(result, Err(FlowError::Forbidden { ref approver, .. }) if approver == "mallory"));

    let result = flow.reject("a", &mallory, "or out").await;
    assert!(matches!(result, Err(FlowError::Forbidden { .. })));

    assert_eq!(store.get_steps("H", "O1").await.unwrap(), before);
    assert_eq!(store.write_count(), writes);
    assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn test_handler_receives_outcome() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register_with_config::<String>(
        "H",
        store.clone(),
        vec![vec![calls.step("a", false)]],
        EngineConfig::default().with_reject_policy(RejectPolicy::FlagOnly),
    )
    .unwrap();
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    flow.reject("a", &alice, "not yet").await.unwrap();
    flow.approve("a", &alice, "now").await.unwrap();

    assert_eq!(calls.count(), 2);
    assert_eq!(*calls.approved.lock(), vec![false, true]);
}

#[test_log::test(tokio::test)]
async fn test_callback_failure_is_non_mutating() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register::<String>(
        "H",
        store.clone(),
        vec![vec![calls.step("a", true)], vec![plain("b")]],
    )
    .unwrap();
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    let before = store.get_steps("H", "O1").await.unwrap();

    let err = flow.approve("a", &alice, "ok").await.unwrap_err();
    match &err {
        FlowError::CallbackFailed { step_id, source, .. } => {
            assert_eq!(step_id, "a");
            assert!(source.to_string().contains("downstream system"));
        }
        other => panic!("expected CallbackFailed, got {other:?}"),
    }

    let after = store.get_steps("H", "O1").await.unwrap();
    assert_eq!(after.steps, before.steps);
    assert!(!after.step("a").unwrap().is_done());
    assert!(after.step("a").unwrap().claim.is_none());
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a"]);
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_steps_without_handler_write_once() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register::<String>(
        "H",
        store.clone(),
        vec![vec![plain("a")], vec![calls.step("b", false)]],
    )
    .unwrap();
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    let writes = store.write_count();

    flow.approve("a", &alice, "ok").await.unwrap();
    assert_eq!(store.write_count(), writes + 1);

    // Claim + commit
    flow.approve("b", &alice, "ok").await.unwrap();
    assert_eq!(store.write_count(), writes + 3);
}

// ============================================
// Reject policies
// ============================================

async fn completed_first_two_stages(policy: RejectPolicy) -> (Arc<InMemoryLedgerStore>, FlowDefinition<String>) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let def = cr(&store, EngineConfig::default().with_reject_policy(policy));
    let flow = def.bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    for step in ["step-1", "step-2", "step-3"] {
        flow.approve(step, &alice, "ok").await.unwrap();
    }
    (store, def)
}

#[tokio::test]
async fn test_reject_reopens_previous_stage() {
    let (store, def) = completed_first_two_stages(RejectPolicy::ReopenPreviousStage).await;
    let flow = def.bind("O1".to_string());
    let bob = User::anyone("bob");

    let state = flow.reject("step-4", &bob, "missing rollback plan").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 1 });
    assert_eq!(
        ids(&flow.next_steps().await.unwrap()),
        vec!["step-2", "step-3"]
    );

    let ledger = store.get_steps("CR", "O1").await.unwrap();
    assert_eq!(ledger.step("step-1").unwrap().outcome, StepOutcome::Approved);
    assert_eq!(ledger.step("step-4").unwrap().outcome, StepOutcome::Rejected);
    assert_eq!(
        ledger.step("step-4").unwrap().rationale.as_deref(),
        Some("missing rollback plan")
    );

    // Re-approving the reopened stage brings the rejected step back
    flow.approve("step-2", &bob, "ok").await.unwrap();
    flow.approve("step-3", &bob, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-4"]);

    let state = flow.approve("step-4", &bob, "fixed").await.unwrap();
    assert_eq!(state, FlowState::Completed);
}

#[tokio::test]
async fn test_reject_in_middle_stage_keeps_peer_approvals() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let alice = User::anyone("alice");

    flow.start().await.unwrap();
    flow.approve("step-1", &alice, "ok").await.unwrap();
    flow.approve("step-2", &alice, "ok").await.unwrap();

    flow.reject("step-3", &alice, "no").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-1"]);

    flow.approve("step-1", &alice, "again").await.unwrap();
    // step-2 kept its approval, step-3 awaits a new decision
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-3"]);
}

#[tokio::test]
async fn test_reject_restart_flow() {
    let (store, def) = completed_first_two_stages(RejectPolicy::RestartFlow).await;
    let flow = def.bind("O1".to_string());

    let state = flow.reject("step-4", &User::anyone("bob"), "start over").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 0 });
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-1"]);

    let ledger = store.get_steps("CR", "O1").await.unwrap();
    assert_eq!(ledger.step("step-4").unwrap().outcome, StepOutcome::Rejected);
    for step in ["step-1", "step-2", "step-3"] {
        assert_eq!(ledger.step(step).unwrap(), &StepStatus::pending(step));
    }
}

#[tokio::test]
async fn test_reject_flag_only() {
    let (store, def) = completed_first_two_stages(RejectPolicy::FlagOnly).await;
    let flow = def.bind("O1".to_string());

    let state = flow.reject("step-4", &User::anyone("bob"), "hmm").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 2 });
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-4"]);

    let ledger = store.get_steps("CR", "O1").await.unwrap();
    assert_eq!(ledger.step("step-2").unwrap().outcome, StepOutcome::Approved);
}

#[tokio::test]
async fn test_stage_zero_rejection_stays_actionable() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    let bob = User::anyone("bob");

    flow.start().await.unwrap();
    let state = flow.reject("step-1", &bob, "no").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 0 });
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["step-1"]);

    // Can be rejected again or approved
    flow.reject("step-1", &bob, "still no").await.unwrap();
    flow.approve("step-1", &bob, "fine").await.unwrap();
    assert_eq!(
        ids(&flow.next_steps().await.unwrap()),
        vec!["step-2", "step-3"]
    );
}

// ============================================
// Concurrency
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_run_handler_once() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register::<String>("H", store.clone(), vec![vec![calls.step("a", false)]]).unwrap();
    let flow = Arc::new(def.bind("O1".to_string()));
    flow.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let flow = Arc::clone(&flow);
        handles.push(tokio::spawn(async move {
            let user = User::anyone(&format!("user-{i}"));
            flow.approve("a", &user, "race").await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(FlowError::Conflict { .. }) | Err(FlowError::StepNotActionable { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(calls.count(), 1);
    assert_eq!(flow.state().await.unwrap(), FlowState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_approval_while_handler_runs() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let (step, entered, release) = gated_step("a", &calls, false);
    let def = register::<String>("PAIR", store.clone(), vec![vec![step, plain("b")]]).unwrap();
    let flow = Arc::new(def.bind("O1".to_string()));
    flow.start().await.unwrap();

    let first = tokio::spawn({
        let flow = Arc::clone(&flow);
        async move { flow.approve("a", &User::anyone("alice"), "ok").await }
    });
    tokio::task::spawn_blocking(move || entered.recv())
        .await
        .unwrap()
        .unwrap();

    // "a" is claimed and its handler is parked; "b" moves the ledger
    let state = flow.approve("b", &User::anyone("bob"), "ok").await.unwrap();
    assert_eq!(state, FlowState::InProgress { stage: 0 });
    release.send(()).unwrap();

    let state = first.await.unwrap().unwrap();
    assert_eq!(state, FlowState::Completed);
    assert_eq!(calls.count(), 1);

    let ledger = store.get_steps("PAIR", "O1").await.unwrap();
    let a = ledger.step("a").unwrap();
    assert_eq!(a.outcome, StepOutcome::Approved);
    assert_eq!(a.resolved_by.as_deref(), Some("alice"));
    assert!(a.claim.is_none());
    assert_eq!(ledger.step("b").unwrap().outcome, StepOutcome::Approved);
    assert_eq!(flow.state().await.unwrap(), FlowState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_approval_while_handler_fails() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let (step, entered, release) = gated_step("a", &calls, true);
    let def = register::<String>("PAIR", store.clone(), vec![vec![step, plain("b")]]).unwrap();
    let flow = Arc::new(def.bind("O1".to_string()));
    flow.start().await.unwrap();

    let first = tokio::spawn({
        let flow = Arc::clone(&flow);
        async move { flow.approve("a", &User::anyone("alice"), "ok").await }
    });
    tokio::task::spawn_blocking(move || entered.recv())
        .await
        .unwrap()
        .unwrap();

    flow.approve("b", &User::anyone("bob"), "ok").await.unwrap();
    release.send(()).unwrap();

    let result = first.await.unwrap();
    assert!(matches!(result, Err(FlowError::CallbackFailed { .. })));

    // The claim is released, so "a" is open again right away
    let ledger = store.get_steps("PAIR", "O1").await.unwrap();
    assert_eq!(ledger.step("a").unwrap(), &StepStatus::pending("a"));
    assert_eq!(ledger.step("b").unwrap().outcome, StepOutcome::Approved);
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a"]);
    assert_eq!(calls.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_of_one_stage() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let steps: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| calls.step(id, false))
        .collect();
    let def = register::<String>("WIDE", store.clone(), vec![steps, vec![plain("z")]]).unwrap();
    let flow = Arc::new(def.bind("O1".to_string()));
    flow.start().await.unwrap();

    let mut handles = Vec::new();
    for id in ["a", "b", "c", "d"] {
        let flow = Arc::clone(&flow);
        handles.push(tokio::spawn(async move {
            flow.approve(id, &User::anyone(&format!("owner-{id}")), "ok").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(calls.count(), 4);
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["z"]);
    let ledger = store.get_steps("WIDE", "O1").await.unwrap();
    assert!(ledger.steps.iter().all(|s| s.claim.is_none()));
}

#[tokio::test]
async fn test_live_claim_blocks_other_approvers() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register::<String>("H", store.clone(), vec![vec![calls.step("a", false)]]).unwrap();
    let flow = def.bind("O1".to_string());
    flow.start().await.unwrap();

    // Someone else is mid-resolution
    let ledger = store.get_steps("H", "O1").await.unwrap();
    let mut claimed = StepStatus::pending("a");
    claimed.claim = Some(StepClaim {
        claimed_by: "carol".into(),
        claimed_at: Utc::now(),
    });
    store
        .update_steps("H", "O1", ledger.version, vec![claimed])
        .await
        .unwrap();

    let result = flow.approve("a", &User::anyone("alice"), "me too").await;
    match result {
        Err(FlowError::Conflict { detail, .. }) => assert!(detail.contains("carol")),
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn test_stale_claim_is_taken_over() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let calls = Calls::default();
    let def = register_with_config::<String>(
        "H",
        store.clone(),
        vec![vec![calls.step("a", false)]],
        EngineConfig::default().with_claim_ttl(Duration::from_secs(60)),
    )
    .unwrap();
    let flow = def.bind("O1".to_string());
    flow.start().await.unwrap();

    // Claim left behind by a crashed process
    let ledger = store.get_steps("H", "O1").await.unwrap();
    let mut claimed = StepStatus::pending("a");
    claimed.claim = Some(StepClaim {
        claimed_by: "crashed".into(),
        claimed_at: Utc::now() - chrono::Duration::minutes(5),
    });
    store
        .update_steps("H", "O1", ledger.version, vec![claimed])
        .await
        .unwrap();

    let state = flow.approve("a", &User::anyone("alice"), "ok").await.unwrap();
    assert_eq!(state, FlowState::Completed);
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_restart_during_resolution_conflicts() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    flow.start().await.unwrap();

    let stale = store.get_steps("CR", "O1").await.unwrap();
    flow.start().await.unwrap();

    // A writer holding the pre-restart version cannot land
    let result = store
        .update_steps("CR", "O1", stale.version, vec![StepStatus::pending("step-1")])
        .await;
    assert!(matches!(result, Err(StoreError::Conflict { .. })));
}

// ============================================
// Store failures and definition evolution
// ============================================

#[tokio::test]
async fn test_store_unavailable_propagates() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let flow = cr(&store, EngineConfig::default()).bind("O1".to_string());
    flow.start().await.unwrap();

    store.set_unavailable(true);

    assert!(matches!(
        flow.start().await,
        Err(FlowError::Store(StoreError::Unavailable(_)))
    ));
    assert!(matches!(flow.clear().await, Err(FlowError::Store(_))));
    assert!(matches!(flow.in_progress().await, Err(FlowError::Store(_))));
    assert!(matches!(flow.next_steps().await, Err(FlowError::Store(_))));
    assert!(matches!(
        flow.approve("step-1", &User::anyone("alice"), "ok").await,
        Err(FlowError::Store(_))
    ));

    store.set_unavailable(false);
    assert!(flow.in_progress().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_definition_evolution() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let alice = User::anyone("alice");

    let v1 = register::<String>(
        "EVO",
        store.clone(),
        vec![vec![plain("a")], vec![plain("x")]],
    )
    .unwrap();
    v1.bind("O1".to_string()).start().await.unwrap();

    // "x" removed, "c" added after the instance was started
    let v2 = register::<String>(
        "EVO",
        store.clone(),
        vec![vec![plain("a")], vec![plain("c")]],
    )
    .unwrap();
    let flow = v2.bind("O1".to_string());

    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["a"]);
    flow.approve("a", &alice, "ok").await.unwrap();
    assert_eq!(ids(&flow.next_steps().await.unwrap()), vec!["c"]);

    let result = flow.approve("x", &alice, "orphan").await;
    assert!(matches!(result, Err(FlowError::UnknownStep { .. })));

    let state = flow.approve("c", &alice, "ok").await.unwrap();
    assert_eq!(state, FlowState::Completed);

    let ledger = store.get_steps("EVO", "O1").await.unwrap();
    assert_eq!(ledger.step("c").unwrap().outcome, StepOutcome::Approved);
    assert_eq!(ledger.step("x").unwrap().outcome, StepOutcome::Pending);
}

#[tokio::test]
async fn test_started_instances_and_status() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let def = cr(&store, EngineConfig::default());
    let alice = User::anyone("alice");

    def.bind("O1".to_string()).start().await.unwrap();
    let o2 = def.bind("O2".to_string());
    o2.start().await.unwrap();
    o2.approve("step-1", &alice, "ok").await.unwrap();
    def.bind("O3".to_string()).start().await.unwrap();
    def.bind("O3".to_string()).clear().await.unwrap();

    let mut keys = def.started_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["O1", "O2"]);

    let status = def.status("O2").await.unwrap();
    assert_eq!(status.state, FlowState::InProgress { stage: 1 });
    assert_eq!(status.next_steps, vec!["step-2", "step-3"]);
    assert_eq!(status.steps.len(), 4);
    assert_eq!(status.steps[0].resolved_by.as_deref(), Some("alice"));
    assert_eq!(status.steps[3].stage, 2);

    let status = def.status("O3").await.unwrap();
    assert_eq!(status.state, FlowState::NotStarted);
    assert!(status.steps.is_empty());

    let started = def.started().await.unwrap();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|s| s.in_progress()));
}
