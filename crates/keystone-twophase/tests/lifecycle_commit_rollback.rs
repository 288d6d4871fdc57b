//! End-to-end lifecycle coverage against the in-memory collaborators:
//! reserve → assemble → end-prepare → finish, on both the commit and the
//! rollback path, plus the refusal and cleanup cases around them.

use std::sync::Arc;

use keystone_twophase::collab::Clog;
use keystone_twophase::testkit::{TestEnv, TestXactSource};
use keystone_twophase::{
    BackendSession, LocalDistribXact, TwoPhaseConfig, TwoPhaseSubsystem, XactWalKind,
};
use keystone_types::{BackendId, ForkNumber, Oid, RelFileNode, TimestampTz, Xid};

const OWNER: Oid = Oid::new(10);
const OTHER_ROLE: Oid = Oid::new(11);
const DB: Oid = Oid::new(16384);

fn subsystem(env: &TestEnv, max_prepared: usize) -> Arc<TwoPhaseSubsystem> {
    let config = TwoPhaseConfig {
        max_prepared,
        max_real_backends: 10,
        wal_senders: 1,
        ..TwoPhaseConfig::default()
    };
    TwoPhaseSubsystem::new(config, env.collaborators())
}

fn session(
    sys: &Arc<TwoPhaseSubsystem>,
    backend: u32,
    role: Oid,
    superuser: bool,
) -> BackendSession {
    sys.begin_session(
        BackendId::new(backend).expect("nonzero backend id"),
        role,
        DB,
        superuser,
    )
}

fn prepare(
    sys: &Arc<TwoPhaseSubsystem>,
    session: &mut BackendSession,
    xid: u32,
    gid: &str,
    source: &TestXactSource,
) {
    sys.mark_as_preparing(
        session,
        Xid::new(xid),
        LocalDistribXact::local_only(),
        gid,
        TimestampTz::from_micros(1_000 + i64::from(xid)),
        session.role(),
        session.database(),
        None,
    )
    .expect("reserve");
    sys.start_prepare(session, source).expect("assemble");
    sys.end_prepare(session).expect("end prepare");
    session.post_prepare();
}

#[test]
fn duplicate_gid_leaves_table_unchanged_and_first_finishable() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 4);
    let mut s1 = session(&sys, 1, OWNER, false);

    prepare(&sys, &mut s1, 100, "tx-A", &TestXactSource::default());

    let mut s2 = session(&sys, 2, OWNER, false);
    let err = sys
        .mark_as_preparing(
            &mut s2,
            Xid::new(101),
            LocalDistribXact::local_only(),
            "tx-A",
            TimestampTz::from_micros(2),
            OWNER,
            DB,
            None,
        )
        .expect_err("duplicate gid");
    assert_eq!(err.condition(), "duplicate_object");
    assert_eq!(sys.prepared_xacts().len(), 1);

    assert!(sys
        .finish_prepared(&mut s2, "tx-A", true, true)
        .expect("first entry still finishable"));
}

#[test]
fn slab_exhaustion_then_release_allows_reserve() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);

    prepare(&sys, &mut s1, 100, "tx-A", &TestXactSource::default());
    prepare(&sys, &mut s1, 101, "tx-B", &TestXactSource::default());

    let err = sys
        .mark_as_preparing(
            &mut s1,
            Xid::new(102),
            LocalDistribXact::local_only(),
            "tx-C",
            TimestampTz::from_micros(3),
            OWNER,
            DB,
            None,
        )
        .expect_err("slab full");
    assert_eq!(err.condition(), "out_of_memory");

    assert!(sys
        .finish_prepared(&mut s1, "tx-A", true, true)
        .expect("finish frees a slot"));
    sys.mark_as_preparing(
        &mut s1,
        Xid::new(102),
        LocalDistribXact::local_only(),
        "tx-C",
        TimestampTz::from_micros(3),
        OWNER,
        DB,
        None,
    )
    .expect("slot available again");
}

#[test]
fn disabled_subsystem_rejects_reserve() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 0);
    let mut s1 = session(&sys, 1, OWNER, false);
    let err = sys
        .mark_as_preparing(
            &mut s1,
            Xid::new(100),
            LocalDistribXact::local_only(),
            "tx-A",
            TimestampTz::from_micros(1),
            OWNER,
            DB,
            None,
        )
        .expect_err("disabled");
    assert_eq!(err.condition(), "object_not_in_prerequisite_state");
}

#[test]
fn over_long_gid_is_rejected_before_any_state_change() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    let long = "g".repeat(200);
    let err = sys
        .mark_as_preparing(
            &mut s1,
            Xid::new(100),
            LocalDistribXact::local_only(),
            &long,
            TimestampTz::from_micros(1),
            OWNER,
            DB,
            None,
        )
        .expect_err("gid too long");
    assert_eq!(err.condition(), "invalid_parameter_value");
    assert_eq!(sys.table().counts(), (2, 0));
}

#[test]
fn happy_commit_orders_wal_unlinks_files_and_recycles() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);

    let source = TestXactSource {
        children: vec![Xid::new(201), Xid::new(202)],
        commit_rels: vec![RelFileNode::new(1, 2, 3)],
        abort_rels: vec![RelFileNode::new(1, 2, 9)],
    };
    prepare(&sys, &mut s1, 200, "tx-B", &source);

    // Prepared and visible: dummy proc published, view row present, index
    // entry registered and WAL flushed through the prepare record. The
    // commit-critical flag is only raised inside the state machine.
    let xid = Xid::new(200);
    assert!(!s1.in_commit());
    let _checkpointer_view = s1.in_commit_flag();
    assert!(env.procarray.contains_xid(xid));
    assert_eq!(sys.prepared_xacts().len(), 1);
    let begin = sys.post_checkpoint().lookup(xid).expect("index entry");
    assert!(env.wal.flushed_to() >= begin);

    let mut s2 = session(&sys, 2, OWNER, false);
    assert!(sys
        .finish_prepared(&mut s2, "tx-B", true, true)
        .expect("commit prepared"));

    // WAL order: prepare record then commit-prepared record.
    assert_eq!(
        env.wal.kinds(),
        vec![XactWalKind::Prepare, XactWalKind::CommitPrepared]
    );

    // The delete-on-commit rel went away across every fork; the
    // delete-on-abort rel survived.
    let unlinked = env.storage.unlinked();
    assert_eq!(unlinked.len(), ForkNumber::ALL.len());
    assert!(unlinked
        .iter()
        .all(|(rel, _)| *rel == RelFileNode::new(1, 2, 3)));

    // The xid stopped being in progress, the tree is committed, the entry
    // is back on the freelist, and the index entry is gone.
    assert!(!env.procarray.contains_xid(xid));
    assert!(env.procarray.removals().iter().any(|&(_, latest)| latest == Xid::new(202)));
    assert!(env.clog.did_commit(xid));
    assert!(env.clog.did_commit(Xid::new(201)));
    assert_eq!(sys.table().counts(), (2, 0));
    assert_eq!(sys.post_checkpoint().lookup(xid), None);
    assert_eq!(sys.prepared_xacts().len(), 0);
    assert_eq!(env.stats.commits(), 1);
    assert!(env.wal_senders.wakeups() >= 2);
}

#[test]
fn rollback_unlinks_abort_rels_and_marks_tree_aborted() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);

    let source = TestXactSource {
        children: vec![Xid::new(201), Xid::new(202)],
        commit_rels: vec![RelFileNode::new(1, 2, 3)],
        abort_rels: vec![RelFileNode::new(1, 2, 9)],
    };
    prepare(&sys, &mut s1, 200, "tx-B", &source);

    let mut s2 = session(&sys, 2, OWNER, false);
    assert!(sys
        .finish_prepared(&mut s2, "tx-B", false, true)
        .expect("rollback prepared"));

    assert_eq!(
        env.wal.kinds(),
        vec![XactWalKind::Prepare, XactWalKind::AbortPrepared]
    );
    assert!(env
        .storage
        .unlinked()
        .iter()
        .all(|(rel, _)| *rel == RelFileNode::new(1, 2, 9)));
    assert!(env.clog.did_abort(Xid::new(200)));
    assert!(env.clog.did_abort(Xid::new(201)));
    // No distributed tree is marked on abort.
    assert!(env.distributed_log.trees().is_empty());
    assert_eq!(env.stats.aborts(), 1);
    assert_eq!(sys.table().counts(), (2, 0));
}

#[test]
fn commit_of_distributed_gid_marks_distributed_tree() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);

    prepare(&sys, &mut s1, 300, "1234-42-seg0", &TestXactSource::default());
    let mut s2 = session(&sys, 2, OWNER, false);
    assert!(sys
        .finish_prepared(&mut s2, "1234-42-seg0", true, true)
        .expect("commit"));

    let trees = env.distributed_log.trees();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].xid, Xid::new(300));
    assert_eq!(trees[0].timestamp.0, 1234);
    assert_eq!(trees[0].distrib_xid.0, 42);
}

#[test]
fn foreign_role_cannot_finish_and_entry_stays_retryable() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());

    let mut intruder = session(&sys, 2, OTHER_ROLE, false);
    let err = sys
        .finish_prepared(&mut intruder, "tx-B", true, true)
        .expect_err("not the owner");
    assert_eq!(err.condition(), "insufficient_privilege");

    // Entry still PREPARED/unlocked: a superuser finishes it fine.
    let mut admin = session(&sys, 3, OTHER_ROLE, true);
    assert!(sys
        .finish_prepared(&mut admin, "tx-B", true, true)
        .expect("superuser may finish"));
}

#[test]
fn busy_entry_rejects_second_finisher() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());

    // First backend takes the entry lock and sits on it.
    let gid = keystone_types::Gid::new("tx-B").expect("valid gid");
    sys.table()
        .lock_for_finish(
            &gid,
            BackendId::new(7).expect("nonzero"),
            OWNER,
            false,
            DB,
            false,
        )
        .expect("lockable")
        .expect("found");

    let mut s2 = session(&sys, 2, OWNER, false);
    let err = sys
        .finish_prepared(&mut s2, "tx-B", true, true)
        .expect_err("busy");
    assert_eq!(err.condition(), "object_not_in_prerequisite_state");
}

#[test]
fn missing_gid_honors_raise_flag() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);

    assert!(!sys
        .finish_prepared(&mut s1, "tx-nope", true, false)
        .expect("quiet miss"));
    let err = sys
        .finish_prepared(&mut s1, "tx-nope", true, true)
        .expect_err("loud miss");
    assert_eq!(err.condition(), "undefined_object");
}

#[test]
fn unreadable_prepare_record_is_data_corruption_and_retryable_after_repair() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());
    let begin = sys.post_checkpoint().lookup(Xid::new(200)).expect("index entry");

    env.wal.corrupt_record(begin);
    let mut s2 = session(&sys, 2, OWNER, false);
    let err = sys
        .finish_prepared(&mut s2, "tx-B", true, true)
        .expect_err("corrupt record");
    assert_eq!(err.condition(), "data_corrupted");
    // The failed finisher must release its entry lock before retrying.
    s2.at_abort();

    // Repair the record (the corruption was a single byte flip) and retry
    // from another session.
    env.wal.corrupt_record(begin);
    let mut s3 = session(&sys, 3, OWNER, false);
    assert!(sys
        .finish_prepared(&mut s3, "tx-B", true, true)
        .expect("retry succeeds"));
}

#[test]
fn lost_prepare_record_reports_corruption() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());
    let begin = sys.post_checkpoint().lookup(Xid::new(200)).expect("index entry");

    env.wal.lose_record(begin);
    let mut s2 = session(&sys, 2, OWNER, false);
    let err = sys
        .finish_prepared(&mut s2, "tx-B", true, true)
        .expect_err("record gone");
    assert_eq!(err.condition(), "data_corrupted");
}

#[test]
fn dropping_session_mid_prepare_recycles_reservation() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    {
        let mut s1 = session(&sys, 1, OWNER, false);
        sys.mark_as_preparing(
            &mut s1,
            Xid::new(100),
            LocalDistribXact::local_only(),
            "tx-A",
            TimestampTz::from_micros(1),
            OWNER,
            DB,
            None,
        )
        .expect("reserve");
        assert_eq!(sys.table().counts(), (1, 1));
        // Session dies before end_prepare: abnormal termination.
    }
    assert_eq!(sys.table().counts(), (2, 0));

    // The GID is reusable immediately.
    let mut s2 = session(&sys, 2, OWNER, false);
    sys.mark_as_preparing(
        &mut s2,
        Xid::new(101),
        LocalDistribXact::local_only(),
        "tx-A",
        TimestampTz::from_micros(2),
        OWNER,
        DB,
        None,
    )
    .expect("gid free again");
}

#[test]
fn dropping_session_after_prepare_only_unlocks() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    {
        let mut s1 = session(&sys, 1, OWNER, false);
        let source = TestXactSource::default();
        sys.mark_as_preparing(
            &mut s1,
            Xid::new(100),
            LocalDistribXact::local_only(),
            "tx-A",
            TimestampTz::from_micros(1),
            OWNER,
            DB,
            None,
        )
        .expect("reserve");
        sys.start_prepare(&mut s1, &source).expect("assemble");
        sys.end_prepare(&mut s1).expect("end prepare");
        // Backend dies without post_prepare: entry is valid, so cleanup
        // must unlock it rather than recycle it.
    }
    assert_eq!(sys.table().counts(), (1, 1));
    assert_eq!(sys.prepared_xacts().len(), 1);

    let mut s2 = session(&sys, 2, OWNER, false);
    assert!(sys
        .finish_prepared(&mut s2, "tx-A", true, true)
        .expect("finishable after unlock"));
}

#[test]
fn view_rows_expose_prepared_fields() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());

    let rows = sys.prepared_xacts();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].transaction, Xid::new(200));
    assert_eq!(rows[0].gid.as_str(), "tx-B");
    assert_eq!(rows[0].prepared, TimestampTz::from_micros(1_200));
    assert_eq!(rows[0].ownerid, OWNER);
    assert_eq!(rows[0].dbid, DB);
}

#[test]
fn resync_intents_track_pending_work() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());

    sys.incr_resync_intent("tx-B").expect("incr");
    sys.incr_resync_intent("tx-B").expect("incr");
    sys.decr_resync_intent("tx-B").expect("decr");
    let snapshot = sys.table().snapshot_all();
    assert_eq!(snapshot[0].resync_intent_count, 1);

    let err = sys.incr_resync_intent("tx-nope").expect_err("unknown gid");
    assert_eq!(err.condition(), "undefined_object");
}

#[test]
fn syncrep_waits_cover_prepare_and_finish() {
    let env = TestEnv::new();
    let sys = subsystem(&env, 2);
    let mut s1 = session(&sys, 1, OWNER, false);
    prepare(&sys, &mut s1, 200, "tx-B", &TestXactSource::default());
    let mut s2 = session(&sys, 2, OWNER, false);
    sys.finish_prepared(&mut s2, "tx-B", true, true)
        .expect("commit");

    let waited = env.syncrep.waited();
    assert_eq!(waited.len(), 2);
    assert!(waited[1] > waited[0]);
}
