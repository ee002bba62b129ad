//! End-to-end process scenarios driven through the public engine API

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::engine::{ProcessEngine, Variables};
use crate::error::ProcessEngineError;
use crate::events::{HistoryEvent, VecHistorySink};
use crate::handler::{HandlerRegistry, TaskError};
use crate::model::{ProcessBuilder, ProcessDefinition, TimerDefinition};
use crate::runtime::{ExecutionId, RecordingTimerService};

fn engine_with(
    definitions: Vec<ProcessDefinition>,
    handlers: HandlerRegistry,
) -> (ProcessEngine, Arc<VecHistorySink>) {
    let history = Arc::new(VecHistorySink::new());
    let mut engine = ProcessEngine::new()
        .with_handlers(handlers)
        .with_history(history.clone());
    for definition in definitions {
        engine.deploy(definition).unwrap();
    }
    (engine, history)
}

fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn only_at(engine: &ProcessEngine, pi: ExecutionId, node: &str) -> ExecutionId {
    let at = engine.active_executions_at(pi, node);
    assert_eq!(at.len(), 1, "expected one execution at '{}', found {:?}", node, at);
    at[0]
}

fn deletions_with(history: &VecHistorySink, reason: &str) -> usize {
    history
        .events()
        .iter()
        .filter(|e| e.delete_reason() == Some(reason))
        .count()
}

/// Handler registry recording a label per invocation
fn recording(names: &[&str]) -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    for name in names {
        let calls = calls.clone();
        let label = name.to_string();
        handlers.register_fn(*name, move |ctx| {
            let calls = calls.clone();
            let label = label.clone();
            async move {
                calls.lock().unwrap().push(label);
                Ok(ctx)
            }
        });
    }
    (handlers, calls)
}

#[tokio::test]
async fn test_parallel_join_waits_for_every_branch() {
    let def = ProcessBuilder::new("fork-join", "Fork join")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .parallel_gateway("join")
        .user_task("after")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "after")
        .flow("after", "end")
        .build();
    let (mut engine, history) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("fork-join", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["a", "b"]);

    let a = only_at(&engine, pi, "a");
    engine.trigger(a, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["b"]);

    let b = only_at(&engine, pi, "b");
    engine.trigger(b, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert_eq!(engine.executions_of(pi).len(), 1);

    engine.trigger(pi, Variables::new()).await.unwrap();
    assert!(engine.is_ended(pi));
    let afters = history
        .started_nodes()
        .into_iter()
        .filter(|n| n == "after")
        .count();
    assert_eq!(afters, 1);
}

#[tokio::test]
async fn test_exclusive_gateway_takes_first_true_flow() {
    let def = ProcessBuilder::new("route", "Route")
        .start_event("start")
        .exclusive_gateway("gw")
        .user_task("a")
        .user_task("b")
        .user_task("d")
        .user_task("c")
        .flow("start", "gw")
        .conditional_flow("gw", "a", "${x > 10}")
        .conditional_flow("gw", "b", "${x > 1}")
        .conditional_flow("gw", "d", "${x > 2}")
        .default_flow("gw", "c")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let first = engine
        .start_process_instance_by_key("route", vars(&[("x", json!(5))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(first), vec!["b"]);

    let fallback = engine
        .start_process_instance_by_key("route", vars(&[("x", json!(0))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(fallback), vec!["c"]);
}

#[tokio::test]
async fn test_exclusive_gateway_without_match_fails() {
    let def = ProcessBuilder::new("strict", "Strict")
        .start_event("start")
        .exclusive_gateway("gw")
        .user_task("a")
        .flow("start", "gw")
        .conditional_flow("gw", "a", "${x > 10}")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let err = engine
        .start_process_instance_by_key("strict", vars(&[("x", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessEngineError::NoOutgoingSequenceFlow { ref node_id } if node_id == "gw"));
    assert!(engine.process_instances().is_empty());
}

#[tokio::test]
async fn test_skip_expression_bypasses_condition() {
    let def = ProcessBuilder::new("skip", "Skip")
        .start_event("start")
        .exclusive_gateway("gw")
        .user_task("a")
        .user_task("c")
        .flow("start", "gw")
        .conditional_flow("gw", "a", "${x > 100}")
        .skip_expression("${skip}")
        .default_flow("gw", "c")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let skipped = engine
        .start_process_instance_by_key(
            "skip",
            vars(&[
                ("_SKIP_EXPRESSION_ENABLED", json!(true)),
                ("skip", json!(true)),
                ("x", json!(0)),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(skipped), vec!["a"]);

    let normal = engine
        .start_process_instance_by_key("skip", vars(&[("skip", json!(true)), ("x", json!(0))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(normal), vec!["c"]);
}

#[tokio::test]
async fn test_inclusive_gateway_joins_only_taken_branches() {
    let def = ProcessBuilder::new("inclusive", "Inclusive")
        .start_event("start")
        .inclusive_gateway("split")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .inclusive_gateway("merge")
        .user_task("after")
        .flow("start", "split")
        .conditional_flow("split", "a", "${x > 0}")
        .conditional_flow("split", "b", "${x > 5}")
        .conditional_flow("split", "c", "${x > 100}")
        .flow("a", "merge")
        .flow("b", "merge")
        .flow("c", "merge")
        .flow("merge", "after")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("inclusive", vars(&[("x", json!(10))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["a", "b"]);

    let a = only_at(&engine, pi, "a");
    engine.trigger(a, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["b"]);

    let b = only_at(&engine, pi, "b");
    engine.trigger(b, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert_eq!(engine.executions_of(pi).len(), 1);
}

#[tokio::test]
async fn test_sequential_multi_instance_counts_loops() {
    let def = ProcessBuilder::new("batch", "Batch")
        .start_event("start")
        .service_task("work", "record")
        .sequential_multi_instance("3")
        .end_event("end")
        .flow("start", "work")
        .flow("work", "end")
        .build();
    let counters = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    {
        let counters = counters.clone();
        handlers.register_fn("record", move |ctx| {
            let counters = counters.clone();
            async move {
                let counter = ctx.get("loopCounter").and_then(Value::as_i64);
                counters.lock().unwrap().push(counter);
                Ok(ctx)
            }
        });
    }
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("batch", Variables::new())
        .await
        .unwrap();
    assert!(engine.is_ended(pi));
    assert_eq!(*counters.lock().unwrap(), vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn test_inclusive_gateway_without_match_fails() {
    let def = ProcessBuilder::new("notify", "Notify")
        .start_event("start")
        .inclusive_gateway("split")
        .user_task("mail")
        .user_task("sms")
        .flow("start", "split")
        .conditional_flow("split", "mail", "${email}")
        .conditional_flow("split", "sms", "${phone}")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let err = engine
        .start_process_instance_by_key(
            "notify",
            vars(&[("email", json!(false)), ("phone", json!(false))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessEngineError::NoOutgoingSequenceFlow { ref node_id } if node_id == "split"));
    assert!(engine.process_instances().is_empty());
}

#[tokio::test]
async fn test_sequential_multi_instance_stops_on_completion_condition() {
    let def = ProcessBuilder::new("quorum", "Quorum")
        .start_event("start")
        .service_task("ask", "ask")
        .sequential_multi_instance("4")
        .completion_condition("${nrOfCompletedInstances >= 2}")
        .user_task("after")
        .flow("start", "ask")
        .flow("ask", "after")
        .build();
    let counters = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    {
        let counters = counters.clone();
        handlers.register_fn("ask", move |ctx| {
            let counters = counters.clone();
            async move {
                let counter = ctx.get("loopCounter").and_then(Value::as_i64);
                counters.lock().unwrap().push(counter);
                Ok(ctx)
            }
        });
    }
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("quorum", Variables::new())
        .await
        .unwrap();
    assert_eq!(*counters.lock().unwrap(), vec![Some(0), Some(1)]);
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert_eq!(engine.executions_of(pi).len(), 1);
}

#[tokio::test]
async fn test_sequential_multi_instance_over_collection() {
    let def = ProcessBuilder::new("mail", "Mail")
        .start_event("start")
        .service_task("send", "send")
        .multi_instance(crate::model::LoopCharacteristics {
            is_sequential: true,
            collection: Some("recipients".to_string()),
            element_variable: Some("recipient".to_string()),
            ..Default::default()
        })
        .end_event("end")
        .flow("start", "send")
        .flow("send", "end")
        .build();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    {
        let sent = sent.clone();
        handlers.register_fn("send", move |ctx| {
            let sent = sent.clone();
            async move {
                let recipient = ctx.get("recipient").cloned().unwrap_or(Value::Null);
                sent.lock().unwrap().push(recipient);
                Ok(ctx)
            }
        });
    }
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("mail", vars(&[("recipients", json!(["ann", "bo"]))]))
        .await
        .unwrap();
    assert!(engine.is_ended(pi));
    assert_eq!(*sent.lock().unwrap(), vec![json!("ann"), json!("bo")]);
}

#[tokio::test]
async fn test_multi_instance_with_zero_or_negative_cardinality() {
    let def = ProcessBuilder::new("none", "None")
        .start_event("start")
        .user_task("work")
        .parallel_multi_instance("${count}")
        .user_task("after")
        .flow("start", "work")
        .flow("work", "after")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("none", vars(&[("count", json!(0))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);

    let err = engine
        .start_process_instance_by_key("none", vars(&[("count", json!(-2))]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessEngineError::InvalidCardinality { .. }));
}

#[tokio::test]
async fn test_parallel_multi_instance_completion_condition() {
    let def = ProcessBuilder::new("vote", "Vote")
        .start_event("start")
        .user_task("review")
        .parallel_multi_instance("5")
        .completion_condition("${nrOfCompletedInstances >= 2}")
        .user_task("after")
        .end_event("end")
        .flow("start", "review")
        .flow("review", "after")
        .flow("after", "end")
        .build();
    let (mut engine, history) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("vote", Variables::new())
        .await
        .unwrap();
    let reviewers = engine.active_executions_at(pi, "review");
    assert_eq!(reviewers.len(), 5);
    let counters: Vec<_> = reviewers
        .iter()
        .map(|id| engine.tree().get(*id).unwrap().variables.get("loopCounter").cloned())
        .collect();
    assert_eq!(
        counters,
        (0..5).map(|i| Some(json!(i))).collect::<Vec<_>>()
    );

    engine.trigger(reviewers[0], Variables::new()).await.unwrap();
    assert_eq!(engine.active_executions_at(pi, "review").len(), 4);
    let root = engine.execution(reviewers[0]).unwrap().parent.unwrap();
    assert_eq!(engine.get_variable(root, "nrOfCompletedInstances"), Some(&json!(1)));
    assert_eq!(engine.get_variable(root, "nrOfActiveInstances"), Some(&json!(4)));

    engine.trigger(reviewers[1], Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert_eq!(deletions_with(&history, "multi-instance completed"), 3);
}

#[tokio::test]
async fn test_sequential_multi_instance_sub_process() {
    let def = ProcessBuilder::new("rounds", "Rounds")
        .start_event("start")
        .sub_process("round")
        .sequential_multi_instance("2")
        .start_event("round-start")
        .in_scope("round")
        .user_task("play")
        .in_scope("round")
        .end_event("round-end")
        .in_scope("round")
        .user_task("after")
        .flow("start", "round")
        .flow("round-start", "play")
        .flow("play", "round-end")
        .flow("round", "after")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("rounds", Variables::new())
        .await
        .unwrap();
    for expected in 0..2 {
        let play = only_at(&engine, pi, "play");
        assert_eq!(engine.get_variable(play, "loopCounter"), Some(&json!(expected)));
        engine.trigger(play, Variables::new()).await.unwrap();
    }
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
}

#[tokio::test]
async fn test_interrupting_timer_boundary_cancels_inner_paths() {
    let def = ProcessBuilder::new("deadline", "Deadline")
        .start_event("start")
        .sub_process("work")
        .start_event("work-start")
        .in_scope("work")
        .parallel_gateway("fork")
        .in_scope("work")
        .user_task("draft")
        .in_scope("work")
        .user_task("check")
        .in_scope("work")
        .parallel_gateway("join")
        .in_scope("work")
        .end_event("work-end")
        .in_scope("work")
        .timer_boundary_event("timeout", "work", TimerDefinition::duration("PT1H"), true)
        .user_task("escalated")
        .user_task("done")
        .flow("start", "work")
        .flow("work-start", "fork")
        .flow("fork", "draft")
        .flow("fork", "check")
        .flow("draft", "join")
        .flow("check", "join")
        .flow("join", "work-end")
        .flow("work", "done")
        .flow("timeout", "escalated")
        .build();
    let timers = Arc::new(RecordingTimerService::new());
    let (engine, history) = engine_with(vec![def], HandlerRegistry::new());
    let mut engine = engine.with_timer_service(timers.clone());

    let pi = engine
        .start_process_instance_by_key("deadline", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["check", "draft"]);
    assert_eq!(timers.scheduled().len(), 1);
    let job = engine.jobs(pi)[0].id.clone();

    engine.fire_job(&job).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["escalated"]);
    assert!(engine.jobs(pi).is_empty());
    assert!(engine.subscriptions(pi).is_empty());
    assert_eq!(
        deletions_with(&history, "boundary event 'timeout' interrupted 'work'"),
        2
    );

    let err = engine.fire_job(&job).await.unwrap_err();
    assert!(matches!(err, ProcessEngineError::JobNotFound(_)));
}

#[tokio::test]
async fn test_non_interrupting_boundary_forks_a_path() {
    let def = ProcessBuilder::new("remind", "Remind")
        .start_event("start")
        .user_task("work")
        .signal_boundary_event("reminder", "work", "remind", false)
        .user_task("notify")
        .end_event("end")
        .end_event("notify-end")
        .flow("start", "work")
        .flow("work", "end")
        .flow("reminder", "notify")
        .flow("notify", "notify-end")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("remind", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["work"]);

    let delivered = engine
        .signal_event_received("remind", Variables::new())
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(engine.active_node_ids(pi), vec!["notify", "work"]);

    let work = only_at(&engine, pi, "work");
    engine.trigger(work, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["notify"]);
    assert!(!engine.is_ended(pi));

    let notify = only_at(&engine, pi, "notify");
    engine.trigger(notify, Variables::new()).await.unwrap();
    assert!(engine.is_ended(pi));
}

#[tokio::test]
async fn test_terminate_end_kills_concurrent_paths() {
    let def = ProcessBuilder::new("abort", "Abort")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .task("quick")
        .terminate_end_event("kill")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("fork", "quick")
        .flow("quick", "kill")
        .build();
    let (mut engine, history) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("abort", Variables::new())
        .await
        .unwrap();
    assert!(engine.is_ended(pi));
    assert!(engine.executions_of(pi).is_empty());
    assert_eq!(deletions_with(&history, "terminate end event"), 3);
}

#[tokio::test]
async fn test_signal_delivery_is_counted_once() {
    let waiting = ProcessBuilder::new("wait", "Wait")
        .start_event("start")
        .signal_catch_event("go", "go")
        .end_event("end")
        .flow("start", "go")
        .flow("go", "end")
        .build();
    let (mut engine, _) = engine_with(vec![waiting], HandlerRegistry::new());

    let first = engine
        .start_process_instance_by_key("wait", Variables::new())
        .await
        .unwrap();
    let second = engine
        .start_process_instance_by_key("wait", Variables::new())
        .await
        .unwrap();

    let delivered = engine
        .signal_event_received("go", vars(&[("by", json!("ops"))]))
        .await
        .unwrap();
    assert_eq!(delivered, 2);
    assert!(engine.is_ended(first));
    assert!(engine.is_ended(second));

    let again = engine
        .signal_event_received("go", Variables::new())
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_signal_thrown_before_subscription_in_same_command() {
    let def = ProcessBuilder::new("race", "Race")
        .start_event("start")
        .parallel_gateway("fork")
        .signal_throw_event("announce", "go")
        .end_event("announced")
        .task("slow")
        .signal_catch_event("listen", "go")
        .user_task("after")
        .flow("start", "fork")
        .flow("fork", "announce")
        .flow("fork", "slow")
        .flow("announce", "announced")
        .flow("slow", "listen")
        .flow("listen", "after")
        .build();
    let (mut engine, history) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("race", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert!(engine.subscriptions(pi).is_empty());
    let afters = history
        .started_nodes()
        .into_iter()
        .filter(|n| n == "after")
        .count();
    assert_eq!(afters, 1);
}

#[tokio::test]
async fn test_compensation_runs_handler_of_completed_activity() {
    let def = ProcessBuilder::new("booking", "Booking")
        .start_event("start")
        .service_task("book", "book")
        .compensate_boundary_event("book-comp", "book", "unbook")
        .service_task("unbook", "unbook")
        .for_compensation()
        .compensate_throw_event("undo", None)
        .user_task("after")
        .flow("start", "book")
        .flow("book", "undo")
        .flow("undo", "after")
        .build();
    let (handlers, calls) = recording(&["book", "unbook"]);
    let (mut engine, history) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("booking", Variables::new())
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["book", "unbook"]);
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert!(engine.subscriptions(pi).is_empty());
    assert!(history.events().iter().any(|e| matches!(
        e,
        HistoryEvent::CompensationStarted { activity_id, handler_id, .. }
            if activity_id == "book" && handler_id == "unbook"
    )));
}

#[tokio::test]
async fn test_transaction_cancel_compensates_and_leaves_through_boundary() {
    let def = ProcessBuilder::new("trip", "Trip")
        .start_event("start")
        .transaction("tx")
        .start_event("tx-start")
        .in_scope("tx")
        .service_task("reserve", "reserve")
        .in_scope("tx")
        .compensate_boundary_event("reserve-comp", "reserve", "release")
        .service_task("release", "release")
        .in_scope("tx")
        .for_compensation()
        .cancel_end_event("tx-cancel")
        .in_scope("tx")
        .cancel_boundary_event("tx-cancelled", "tx")
        .user_task("cancelled")
        .user_task("done")
        .flow("start", "tx")
        .flow("tx-start", "reserve")
        .flow("reserve", "tx-cancel")
        .flow("tx", "done")
        .flow("tx-cancelled", "cancelled")
        .build();
    let (handlers, calls) = recording(&["reserve", "release"]);
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("trip", Variables::new())
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["reserve", "release"]);
    assert_eq!(engine.active_node_ids(pi), vec!["cancelled"]);
    assert_eq!(engine.executions_of(pi).len(), 1);
}

#[tokio::test]
async fn test_call_activity_maps_variables() {
    let child = ProcessBuilder::new("double", "Double")
        .start_event("start")
        .service_task("calc", "double")
        .end_event("end")
        .flow("start", "calc")
        .flow("calc", "end")
        .build();
    let parent = ProcessBuilder::new("parent", "Parent")
        .start_event("start")
        .call_activity("call", "double")
        .with_input("amount", "amountIn")
        .with_output("result", "result")
        .user_task("after")
        .flow("start", "call")
        .flow("call", "after")
        .build();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("double", |mut ctx| async move {
        let amount = ctx.get("amountIn").and_then(Value::as_i64).unwrap_or(0);
        ctx.set("result", json!(amount * 2));
        Ok(ctx)
    });
    let (mut engine, history) = engine_with(vec![child, parent], handlers);

    let pi = engine
        .start_process_instance_by_key("parent", vars(&[("amount", json!(21))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert_eq!(engine.get_variable(pi, "result"), Some(&json!(42)));
    assert_eq!(engine.process_instances(), vec![pi]);
    assert!(history
        .events()
        .iter()
        .any(|e| matches!(e, HistoryEvent::SubProcessInstanceLinked { super_execution_id, .. } if *super_execution_id == pi)));
}

#[tokio::test]
async fn test_deleting_parent_removes_called_instance() {
    let child = ProcessBuilder::new("approve", "Approve")
        .start_event("start")
        .user_task("sign")
        .end_event("end")
        .flow("start", "sign")
        .flow("sign", "end")
        .build();
    let parent = ProcessBuilder::new("parent", "Parent")
        .start_event("start")
        .call_activity("call", "approve")
        .end_event("end")
        .flow("start", "call")
        .flow("call", "end")
        .build();
    let (mut engine, _) = engine_with(vec![child, parent], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("parent", Variables::new())
        .await
        .unwrap();
    let instances = engine.process_instances();
    assert_eq!(instances.len(), 2);
    let sub = engine.execution(pi).unwrap().sub_process_instance.unwrap();
    assert_eq!(engine.execution(sub).unwrap().super_execution, Some(pi));

    engine.delete_process_instance(pi, "withdrawn").await.unwrap();
    assert!(engine.is_ended(pi));
    assert!(engine.is_ended(sub));
    assert!(engine.process_instances().is_empty());
}

#[tokio::test]
async fn test_called_instance_completion_resumes_parent() {
    let child = ProcessBuilder::new("approve", "Approve")
        .start_event("start")
        .user_task("sign")
        .end_event("end")
        .flow("start", "sign")
        .flow("sign", "end")
        .build();
    let parent = ProcessBuilder::new("parent", "Parent")
        .start_event("start")
        .call_activity("call", "approve")
        .with_output("signedBy", "signer")
        .end_event("end")
        .flow("start", "call")
        .flow("call", "end")
        .build();
    let (mut engine, _) = engine_with(vec![child, parent], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("parent", Variables::new())
        .await
        .unwrap();
    let sub = engine.execution(pi).unwrap().sub_process_instance.unwrap();
    engine
        .trigger(sub, vars(&[("signedBy", json!("kim"))]))
        .await
        .unwrap();
    assert!(engine.is_ended(sub));
    assert!(engine.is_ended(pi));
}

#[tokio::test]
async fn test_business_error_caught_by_boundary() {
    let def = ProcessBuilder::new("pay", "Pay")
        .start_event("start")
        .service_task("charge", "charge")
        .error_boundary_event("declined", "charge", Some("DECLINED"))
        .user_task("manual")
        .end_event("end")
        .flow("start", "charge")
        .flow("charge", "end")
        .flow("declined", "manual")
        .build();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("charge", |_ctx| async move {
        Err(TaskError::business("DECLINED", "card declined"))
    });
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("pay", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["manual"]);
    assert_eq!(engine.executions_of(pi).len(), 1);
}

#[tokio::test]
async fn test_error_crosses_call_activity() {
    let child = ProcessBuilder::new("validate", "Validate")
        .start_event("start")
        .error_end_event("invalid", "INVALID")
        .flow("start", "invalid")
        .build();
    let parent = ProcessBuilder::new("parent", "Parent")
        .start_event("start")
        .call_activity("call", "validate")
        .error_boundary_event("caught", "call", None)
        .user_task("fix")
        .end_event("end")
        .flow("start", "call")
        .flow("call", "end")
        .flow("caught", "fix")
        .build();
    let (mut engine, _) = engine_with(vec![child, parent], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("parent", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["fix"]);
    assert_eq!(engine.process_instances(), vec![pi]);
}

#[tokio::test]
async fn test_unhandled_business_error_aborts_start() {
    let def = ProcessBuilder::new("pay", "Pay")
        .start_event("start")
        .service_task("charge", "charge")
        .end_event("end")
        .flow("start", "charge")
        .flow("charge", "end")
        .build();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("charge", |_ctx| async move {
        Err(TaskError::business("DECLINED", "card declined"))
    });
    let (mut engine, history) = engine_with(vec![def], handlers);

    let err = engine
        .start_process_instance_by_key("pay", Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessEngineError::UnhandledError { ref code, .. } if code == "DECLINED"));
    assert!(engine.process_instances().is_empty());
    assert!(history.events().is_empty());
}

#[tokio::test]
async fn test_event_based_gateway_first_event_wins() {
    let def = ProcessBuilder::new("await", "Await")
        .start_event("start")
        .event_based_gateway("choice")
        .message_catch_event("paid", "payment")
        .timer_catch_event("expired", TimerDefinition::duration("P1D"))
        .user_task("ship")
        .user_task("cancel")
        .flow("start", "choice")
        .flow("choice", "paid")
        .flow("choice", "expired")
        .flow("paid", "ship")
        .flow("expired", "cancel")
        .build();
    let timers = Arc::new(RecordingTimerService::new());
    let (engine, _) = engine_with(vec![def], HandlerRegistry::new());
    let mut engine = engine.with_timer_service(timers.clone());

    let paid = engine
        .start_process_instance_by_key("await", Variables::new())
        .await
        .unwrap();
    assert_eq!(engine.subscriptions(paid).len(), 2);
    engine
        .message_event_received(paid, "payment", vars(&[("amount", json!(9))]))
        .await
        .unwrap();
    assert_eq!(engine.active_node_ids(paid), vec!["ship"]);
    assert!(engine.subscriptions(paid).is_empty());
    assert!(engine.jobs(paid).is_empty());
    assert!(timers.scheduled().is_empty());
    assert_eq!(engine.get_variable(paid, "amount"), Some(&json!(9)));

    let expired = engine
        .start_process_instance_by_key("await", Variables::new())
        .await
        .unwrap();
    let job = engine.jobs(expired)[0].id.clone();
    engine.fire_job(&job).await.unwrap();
    assert_eq!(engine.active_node_ids(expired), vec!["cancel"]);
    assert!(engine.subscriptions(expired).is_empty());
}

#[tokio::test]
async fn test_failed_join_rolls_back_whole_command() {
    let def = ProcessBuilder::new("audit", "Audit")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .parallel_gateway("join")
        .service_task("audit", "audit")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "audit")
        .flow("audit", "end")
        .build();
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("audit", |_ctx| async move { Err(TaskError::failed("ledger offline")) });
    let (mut engine, _) = engine_with(vec![def], handlers);

    let pi = engine
        .start_process_instance_by_key("audit", Variables::new())
        .await
        .unwrap();
    let a = only_at(&engine, pi, "a");
    engine.trigger(a, Variables::new()).await.unwrap();
    let before: Vec<_> = engine.executions_of(pi).into_iter().cloned().collect();

    let b = only_at(&engine, pi, "b");
    let err = engine.trigger(b, Variables::new()).await.unwrap_err();
    assert!(matches!(err, ProcessEngineError::TaskFailed { .. }));
    let after: Vec<_> = engine.executions_of(pi).into_iter().cloned().collect();
    assert_eq!(before, after);
    assert_eq!(engine.active_node_ids(pi), vec!["b"]);
}

#[tokio::test]
async fn test_trigger_rejects_execution_that_is_not_waiting() {
    let def = ProcessBuilder::new("remind", "Remind")
        .start_event("start")
        .user_task("work")
        .signal_boundary_event("reminder", "work", "remind", false)
        .user_task("after")
        .end_event("notified")
        .flow("start", "work")
        .flow("work", "after")
        .flow("reminder", "notified")
        .build();
    let (mut engine, _) = engine_with(vec![def], HandlerRegistry::new());

    let pi = engine
        .start_process_instance_by_key("remind", Variables::new())
        .await
        .unwrap();
    let root = engine.execution(pi).unwrap();
    assert!(!root.is_active);
    assert_eq!(root.children.len(), 1);

    let err = engine.trigger(pi, Variables::new()).await.unwrap_err();
    assert!(matches!(err, ProcessEngineError::InvalidState(_)));
    assert_eq!(engine.execution(pi).unwrap().node(), Some("work"));
    assert_eq!(engine.active_node_ids(pi), vec!["work"]);
    assert_eq!(engine.subscriptions(pi).len(), 1);

    let work = only_at(&engine, pi, "work");
    assert_ne!(work, pi);
    engine.trigger(work, Variables::new()).await.unwrap();
    assert_eq!(engine.active_node_ids(pi), vec!["after"]);
    assert!(engine.subscriptions(pi).is_empty());
}
