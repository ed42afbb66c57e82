mod common;

use common::{Event, ScriptedFactory};
use dbctx_core::{
    CleanupMode, Command, ConnectionState, DbContext, DbError, IsolationLevel, SqliteContext,
};
use std::time::Duration;

fn context() -> (DbContext<ScriptedFactory>, ScriptedFactory) {
    let factory = ScriptedFactory::new();
    (DbContext::new(factory.clone()), factory)
}

/// Transaction id the context bound the last query to, `None` when unbound.
fn bound_transaction(ctx: &DbContext<ScriptedFactory>) -> Option<i64> {
    ctx.query::<Option<i64>>(&Command::new("SELECT tx"))
        .unwrap()
        .single()
        .unwrap()
}

fn is_create(event: &Event) -> bool {
    matches!(event, Event::Create)
}

#[test]
fn context_and_scope_types_are_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<DbContext<ScriptedFactory>>();
    assert_send_sync::<SqliteContext>();
}

#[test]
fn connection_is_created_lazily_and_only_once() {
    let (ctx, factory) = context();
    assert!(!ctx.has_connection());
    assert_eq!(factory.count(is_create), 0);

    ctx.query::<Option<i64>>(&Command::new("SELECT 1")).unwrap();
    ctx.execute(&Command::new("UPDATE t SET x = 1")).unwrap();
    {
        let outer = ctx.begin().unwrap();
        let inner = ctx.begin().unwrap();
        ctx.execute(&Command::new("UPDATE t SET x = 2")).unwrap();
        inner.commit().unwrap();
        outer.commit().unwrap();
    }
    ctx.begin().unwrap().rollback().unwrap();

    assert!(ctx.has_connection());
    assert_eq!(factory.count(is_create), 1);
}

#[test]
fn statements_bind_to_the_innermost_scope() {
    let (ctx, _factory) = context();
    assert_eq!(bound_transaction(&ctx), None);

    let outer = ctx.begin().unwrap();
    assert_eq!(bound_transaction(&ctx), Some(1));

    let inner = ctx.begin().unwrap();
    assert_eq!(ctx.current_scope(), Some(inner.id()));
    assert_eq!(ctx.scope_ids(), vec![inner.id(), outer.id()]);
    assert_eq!(bound_transaction(&ctx), Some(2));

    inner.commit().unwrap();
    assert_eq!(ctx.current_scope(), Some(outer.id()));
    assert_eq!(bound_transaction(&ctx), Some(1));

    outer.commit().unwrap();
    assert_eq!(ctx.current_scope(), None);
    assert_eq!(bound_transaction(&ctx), None);
}

#[test]
fn execute_binds_to_the_innermost_scope() {
    let (ctx, factory) = context();
    let outer = ctx.begin().unwrap();
    let inner = ctx.begin().unwrap();
    ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();
    inner.rollback().unwrap();
    ctx.execute(&Command::new("INSERT INTO t VALUES (2)")).unwrap();
    outer.commit().unwrap();

    let executes: Vec<Event> = factory
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Execute(_)))
        .collect();
    assert_eq!(executes, vec![Event::Execute(Some(2)), Event::Execute(Some(1))]);
}

#[test]
fn scope_that_opened_the_connection_closes_it() {
    let (ctx, factory) = context();
    let unit = ctx.begin().unwrap();
    assert_eq!(unit.cleanup_mode(), CleanupMode::DeregisterAndClose);
    assert_eq!(ctx.connection_state(), ConnectionState::Open);

    ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();
    unit.commit().unwrap();

    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(
        factory.events(),
        vec![
            Event::Create,
            Event::Open,
            Event::Begin(1),
            Event::Execute(Some(1)),
            Event::Commit(1),
            Event::Dispose(1),
            Event::Close,
        ]
    );
}

#[test]
fn nested_scope_leaves_an_already_open_connection_open() {
    let (ctx, factory) = context();
    let outer = ctx.begin().unwrap();
    let inner = ctx.begin().unwrap();
    assert_eq!(outer.cleanup_mode(), CleanupMode::DeregisterAndClose);
    assert_eq!(inner.cleanup_mode(), CleanupMode::DeregisterOnly);

    inner.commit().unwrap();
    assert_eq!(ctx.connection_state(), ConnectionState::Open);
    assert_eq!(ctx.active_scopes(), 1);

    outer.commit().unwrap();
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(factory.count(|event| matches!(event, Event::Open)), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Close)), 1);
}

#[test]
fn finalization_happens_at_most_once() {
    let (ctx, factory) = context();

    let committed = ctx.begin().unwrap();
    committed.commit().unwrap();
    committed.rollback().unwrap();
    match committed.commit() {
        Err(DbError::InvalidState(message)) => {
            assert_eq!(message, "cannot commit a unit of work more than once")
        }
        other => panic!("expected invalid state, got {other:?}"),
    }
    drop(committed);

    let rolled_back = ctx.begin().unwrap();
    rolled_back.rollback().unwrap();
    rolled_back.rollback().unwrap();
    assert!(matches!(rolled_back.commit(), Err(DbError::InvalidState(_))));
    drop(rolled_back);

    assert_eq!(factory.count(|event| matches!(event, Event::Commit(_))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(_))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Dispose(_))), 2);
}

#[test]
fn dropping_an_unfinished_scope_rolls_it_back() {
    let (ctx, factory) = context();
    {
        let _unit = ctx.begin().unwrap();
        ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();
    }
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(1))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Commit(_))), 0);
}

#[test]
fn close_rolls_back_every_scope_newest_first() {
    let (ctx, factory) = context();
    let first = ctx.begin().unwrap();
    let second = ctx.begin().unwrap();
    let third = ctx.begin().unwrap();

    ctx.close().unwrap();

    assert!(ctx.is_closed());
    assert!(!ctx.has_connection());
    assert_eq!(ctx.active_scopes(), 0);
    assert!(!first.is_active() && !second.is_active() && !third.is_active());

    let rollbacks: Vec<Event> = factory
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Rollback(_)))
        .collect();
    assert_eq!(
        rollbacks,
        vec![Event::Rollback(3), Event::Rollback(2), Event::Rollback(1)]
    );

    drop((first, second, third));
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(_))), 3);
    assert_eq!(factory.count(|event| matches!(event, Event::DropConnection)), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Close)), 1);
}

#[test]
fn close_rolls_back_a_scope_that_registers_while_it_drains() {
    let (ctx, factory) = context();
    factory.hold_begin();

    std::thread::scope(|scope| {
        let beginner = scope.spawn(|| ctx.begin());
        factory.wait_for_held_begin();

        let closer = scope.spawn(|| ctx.close());
        while !ctx.is_closed() {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        factory.release_begin();

        let unit = beginner.join().unwrap().unwrap();
        closer.join().unwrap().unwrap();
        assert!(!unit.is_active());
    });

    assert_eq!(ctx.active_scopes(), 0);
    assert!(!ctx.has_connection());
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(1))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::DropConnection)), 1);
}

#[test]
fn close_is_idempotent_and_refuses_later_work() {
    let (ctx, factory) = context();
    ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();
    ctx.close().unwrap();
    let events_after_close = factory.events();

    ctx.close().unwrap();
    assert_eq!(factory.events(), events_after_close);

    assert!(matches!(ctx.begin(), Err(DbError::InvalidState(_))));
    assert!(matches!(
        ctx.execute(&Command::new("INSERT INTO t VALUES (2)")),
        Err(DbError::InvalidState(_))
    ));
    assert!(matches!(
        ctx.query::<i64>(&Command::new("SELECT 1")),
        Err(DbError::InvalidState(_))
    ));
    assert_eq!(factory.count(is_create), 1);
}

#[test]
fn dropping_the_context_tears_it_down() {
    let factory = ScriptedFactory::new();
    {
        let ctx = DbContext::new(factory.clone());
        let unit = ctx.begin().unwrap();
        std::mem::forget(unit);
    }
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(1))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::DropConnection)), 1);
}

#[test]
fn failed_begin_closes_the_connection_it_opened() {
    let (ctx, factory) = context();
    factory.fail_begin(true);

    assert!(matches!(ctx.begin(), Err(DbError::Driver(_))));
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(
        factory.events(),
        vec![Event::Create, Event::Open, Event::Close]
    );

    factory.fail_begin(false);
    ctx.begin().unwrap().commit().unwrap();
    assert_eq!(factory.count(is_create), 1);
}

#[test]
fn failed_nested_begin_keeps_the_outer_scope_and_connection() {
    let (ctx, factory) = context();
    let outer = ctx.begin().unwrap();

    factory.fail_begin(true);
    assert!(ctx.begin().is_err());
    assert_eq!(ctx.connection_state(), ConnectionState::Open);
    assert_eq!(ctx.current_scope(), Some(outer.id()));
    factory.fail_begin(false);

    outer.commit().unwrap();
}

#[test]
fn factory_failure_surfaces_as_configuration_error() {
    let (ctx, factory) = context();
    factory.fail_create(true);

    assert!(matches!(ctx.begin(), Err(DbError::Configuration(_))));
    assert!(!ctx.has_connection());
    assert_eq!(ctx.active_scopes(), 0);
}

#[test]
fn failed_commit_still_disposes_and_deregisters() {
    let (ctx, factory) = context();
    let unit = ctx.begin().unwrap();
    ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();

    factory.fail_commit(true);
    assert!(matches!(unit.commit(), Err(DbError::Driver(_))));

    assert!(!unit.is_active());
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(factory.count(|event| matches!(event, Event::Dispose(1))), 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Commit(_))), 0);

    assert!(matches!(unit.commit(), Err(DbError::InvalidState(_))));
    drop(unit);
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(_))), 0);
}

#[test]
fn failed_rollback_still_deregisters() {
    let (ctx, factory) = context();
    let unit = ctx.begin().unwrap();

    factory.fail_rollback(true);
    assert!(matches!(unit.rollback(), Err(DbError::Driver(_))));
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);

    factory.fail_rollback(false);
    unit.rollback().unwrap();
}

#[test]
fn execute_outside_a_scope_opens_and_closes_around_the_call() {
    let (ctx, factory) = context();
    assert_eq!(ctx.execute(&Command::new("DELETE FROM t")).unwrap(), 1);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);

    factory.fail_execute(true);
    assert!(ctx.execute(&Command::new("DELETE FROM t")).is_err());
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);

    assert_eq!(
        factory.events(),
        vec![
            Event::Create,
            Event::Open,
            Event::Execute(None),
            Event::Close,
            Event::Open,
            Event::Close,
        ]
    );
}

#[test]
fn query_multiple_reads_every_result_set() {
    let (ctx, _factory) = context();
    let unit = ctx.begin().unwrap();

    let mut grid = ctx.query_multiple(&Command::new("SELECT tx; SELECT tx")).unwrap();
    assert_eq!(grid.remaining(), 2);
    assert_eq!(grid.read_first::<Option<i64>>().unwrap(), Some(Some(1)));
    assert_eq!(
        grid.read::<Option<i64>>().unwrap().collect_all().unwrap(),
        vec![Some(1)]
    );
    assert!(grid.is_consumed());
    assert!(matches!(grid.read::<i64>(), Err(DbError::InvalidState(_))));

    unit.commit().unwrap();
}

#[test]
fn in_unit_of_work_commits_on_ok_and_rolls_back_on_err() {
    let (ctx, factory) = context();

    let value = ctx
        .in_unit_of_work(IsolationLevel::Serializable, |ctx| {
            ctx.execute(&Command::new("INSERT INTO t VALUES (1)"))
        })
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(factory.count(|event| matches!(event, Event::Commit(1))), 1);

    let failed: Result<(), DbError> = ctx.in_unit_of_work(IsolationLevel::default(), |ctx| {
        ctx.execute(&Command::new("INSERT INTO t VALUES (2)"))?;
        Err(DbError::InvalidState("order rejected".to_string()))
    });
    assert!(matches!(failed, Err(DbError::InvalidState(_))));
    assert_eq!(factory.count(|event| matches!(event, Event::Rollback(2))), 1);
    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
}

#[test]
fn threads_share_the_current_scope() {
    let (ctx, factory) = context();
    let outer = ctx.begin().unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..25 {
                    assert_eq!(bound_transaction(&ctx), Some(1));
                }
            });
        }
    });

    outer.commit().unwrap();
    assert_eq!(factory.count(|event| matches!(event, Event::Query(Some(1)))), 100);
}

#[test]
fn concurrent_nested_scopes_all_finish_cleanly() {
    let (ctx, factory) = context();
    let outer = ctx.begin().unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..20 {
                    let unit = ctx.begin().unwrap();
                    assert_eq!(unit.cleanup_mode(), CleanupMode::DeregisterOnly);
                    ctx.execute(&Command::new("INSERT INTO t VALUES (1)")).unwrap();
                    unit.commit().unwrap();
                }
            });
        }
    });

    assert_eq!(ctx.scope_ids(), vec![outer.id()]);
    outer.commit().unwrap();

    assert_eq!(ctx.active_scopes(), 0);
    assert_eq!(ctx.connection_state(), ConnectionState::Closed);
    assert_eq!(factory.count(|event| matches!(event, Event::Commit(_))), 161);
    assert_eq!(factory.count(is_create), 1);
}
