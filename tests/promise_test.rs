#[cfg(test)]
mod tests {
    use deferred::{
        all, all_settled, from_fn, race, Error, EventLoop, LoopConfig, Outcome, Promise,
        Resolution, Resolver, Status,
    };
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::{thread, time::Duration};

    #[test]
    fn test_promise_resolved_from_another_thread() {
        let mut event_loop = EventLoop::new();
        let (promise, resolver) = Promise::<i32, String>::pending(&event_loop.handle());

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(42);
        });

        let result = event_loop.block_on(promise).unwrap();
        assert_eq!(result, Ok(42));
        producer.join().expect("The producer thread has panicked");
    }

    #[test]
    fn test_promise_rejected_from_another_thread() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let promise = Promise::<String, String>::new(&handle, |resolver| {
            thread::spawn(move || resolver.reject("reject!!".into()));
            Ok(())
        });
        let recovered = promise.catch(|reason| Ok(format!("recovered from {reason}")));

        assert_eq!(
            event_loop.block_on(recovered).unwrap(),
            Ok("recovered from reject!!".to_string())
        );
    }

    #[test]
    fn test_reaction_on_settled_promise_is_asynchronous() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let promise = Promise::<&str, ()>::resolved(&handle, "x");
        promise.then(move |value| {
            assert_eq!(value, "x");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        event_loop.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        event_loop.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chain_from_three_fulfills_with_eight() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let chained = Promise::<i32, ()>::resolved(&handle, 3)
            .then(|v| Ok(v + 1))
            .then(|v| Ok(v * 2));
        assert_eq!(event_loop.block_on(chained).unwrap(), Ok(8));
    }

    #[test]
    fn test_register_reaction_chain() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let chained = Promise::<i32, String>::resolved(&handle, 3)
            .register_reaction(Some(Box::new(|v: i32| Resolution::Fulfill(v + 1))), None)
            .register_reaction(None, Some(Box::new(|_: String| Resolution::Fulfill(0))))
            .register_reaction(Some(Box::new(|v: i32| Resolution::Fulfill(v * 2))), None);
        event_loop.run().unwrap();
        assert_eq!(chained.value(), Some(8));
    }

    #[test]
    fn test_rejection_propagates_until_intercepted() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let skipped = Arc::new(AtomicUsize::new(0));

        let counter = skipped.clone();
        let intercepted = Promise::<i32, String>::rejected(&handle, "err".into())
            .then(move |v| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })
            .then(|v| Ok(v + 1))
            .register_rejection_reaction(|reason| Resolution::Fulfill(reason.len() as i32));

        event_loop.run().unwrap();
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(intercepted.value(), Some(3));
    }

    #[test]
    fn test_all_of_resolved_values() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let combined = all(
            &handle,
            vec![
                Promise::<i32, &str>::resolved(&handle, 1),
                Promise::resolved(&handle, 2),
            ],
        );
        assert_eq!(event_loop.block_on(combined).unwrap(), Ok(vec![1, 2]));
    }

    #[test]
    fn test_all_with_a_rejection() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let combined = all(
            &handle,
            vec![
                Promise::<i32, &str>::resolved(&handle, 1),
                Promise::rejected(&handle, "err"),
            ],
        );
        assert_eq!(event_loop.block_on(combined).unwrap(), Err("err"));
    }

    #[test]
    fn test_all_settled_records() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let settled = all_settled(
            &handle,
            vec![
                Promise::<i32, String>::resolved(&handle, 1),
                Promise::rejected(&handle, "e".into()),
            ],
        );
        let outcomes = event_loop.block_on(settled).unwrap().unwrap();

        assert_eq!(
            outcomes,
            vec![
                Outcome::Fulfilled { value: 1 },
                Outcome::Rejected {
                    reason: "e".to_string()
                },
            ]
        );
        assert_eq!(
            serde_json::to_value(&outcomes).unwrap(),
            serde_json::json!([
                { "status": "fulfilled", "value": 1 },
                { "status": "rejected", "reason": "e" }
            ])
        );
    }

    #[test]
    fn test_race_against_a_promise_that_never_settles() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let never = Promise::<&str, ()>::new(&handle, |_resolver| Ok(()));
        let raced = race(&handle, vec![never.clone(), Promise::resolved(&handle, "x")]);

        assert_eq!(event_loop.block_on(raced).unwrap(), Ok("x"));
        assert_eq!(never.status(), Status::Pending);
    }

    #[test]
    fn test_reactions_run_before_earlier_timers() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        let timer_log = log.clone();
        handle.set_timeout(Duration::ZERO, move || timer_log.lock().unwrap().push("timer"));
        let reaction_log = log.clone();
        Promise::<(), ()>::resolved(&handle, ()).then(move |_| {
            reaction_log.lock().unwrap().push("reaction");
            Ok(())
        });
        log.lock().unwrap().push("sync");

        event_loop.run().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["sync", "reaction", "timer"]);
    }

    /// Each click starts a promise that a timer fulfills later; the
    /// synchronous part of every click is logged before any fulfillment.
    #[test]
    fn test_counter_promises_settle_after_synchronous_code() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = Vec::new();

        for count in 1..=3u32 {
            log.lock().unwrap().push(format!("{count}) started"));
            let timer = handle.clone();
            let executor_log = log.clone();
            let promise = Promise::<u32, ()>::new(&handle, move |resolver| {
                executor_log.lock().unwrap().push(format!("{count}) executor"));
                let delay = Duration::from_millis(u64::from(4 - count) * 5);
                timer.set_timeout(delay, move || resolver.resolve(count));
                Ok(())
            });
            let fulfilled_log = log.clone();
            pending.push(promise.then(move |value| {
                fulfilled_log.lock().unwrap().push(format!("{value}) fulfilled"));
                Ok(value)
            }));
            log.lock().unwrap().push(format!("{count}) created"));
        }

        let values = event_loop.block_on(all(&handle, pending)).unwrap();
        assert_eq!(values, Ok(vec![1, 2, 3]));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "1) started", "1) executor", "1) created",
                "2) started", "2) executor", "2) created",
                "3) started", "3) executor", "3) created",
                "3) fulfilled", "2) fulfilled", "1) fulfilled",
            ]
        );
    }

    #[test]
    fn test_adopting_a_custom_thenable() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let timer = handle.clone();
        let thenable = from_fn(move |resolver: Resolver<String, String>| {
            timer.set_timeout(Duration::from_millis(1), move || {
                resolver.resolve("from thenable".into());
                resolver.reject("ignored".into());
            });
        });
        let adopted = Promise::<i32, String>::resolved(&handle, 0)
            .and_then(move |_| Resolution::adopt(thenable));

        assert_eq!(
            event_loop.block_on(adopted).unwrap(),
            Ok("from thenable".to_string())
        );
    }

    #[test]
    fn test_nested_adoption_flattens() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let innermost = Promise::<i32, ()>::resolved(&handle, 9);
        let middle = Promise::<i32, ()>::resolve_with(&handle, innermost.into());
        let outer = Promise::<i32, ()>::resolve_with(&handle, middle.into());
        assert_eq!(event_loop.block_on(outer).unwrap(), Ok(9));
    }

    #[test]
    fn test_block_on_stalls_when_every_resolver_is_gone() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (promise, resolver) = Promise::<i32, ()>::pending(&handle);
        let chained = promise.then(|v| Ok(v));
        drop(resolver);

        assert!(matches!(event_loop.block_on(chained), Err(Error::Stalled)));
    }

    #[test]
    fn test_block_on_park_timeout() {
        let mut event_loop = EventLoop::with_config(LoopConfig {
            park_timeout_ms: Some(10),
            ..LoopConfig::default()
        });
        let (promise, _resolver) = Promise::<i32, ()>::pending(&event_loop.handle());
        assert!(matches!(event_loop.block_on(promise), Err(Error::Stalled)));
    }

    #[test]
    fn test_awaiting_inside_block_on() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let timer = handle.clone();
        let first = Promise::<i32, String>::new(&handle, move |resolver| {
            timer.set_timeout(Duration::from_millis(2), move || resolver.resolve(20));
            Ok(())
        });
        let second = first.then(|v| Ok(v + 1));

        let sum = event_loop
            .block_on(async move {
                let a = first.await?;
                let b = second.await?;
                Ok::<_, String>(a + b)
            })
            .unwrap();
        assert_eq!(sum, Ok(41));
    }

    #[rstest]
    #[case::fulfilled(Ok(5), Status::Fulfilled)]
    #[case::rejected(Err("nope"), Status::Rejected)]
    fn test_settlement_is_final(#[case] first: Result<i32, &'static str>, #[case] status: Status) {
        let mut event_loop = EventLoop::new();
        let (promise, resolver) = Promise::<i32, &str>::pending(&event_loop.handle());
        let other = resolver.clone();
        resolver.resolve_with(first.into());

        other.resolve(100);
        other.reject("later");
        event_loop.run().unwrap();

        assert_eq!(promise.status(), status);
        assert_eq!(promise.value(), first.ok());
        assert_eq!(promise.reason(), first.err());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(8)]
    fn test_all_settled_length_matches_input(#[case] len: usize) {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let inputs = (0..len).map(|i| {
            if i % 2 == 0 {
                Promise::<usize, usize>::resolved(&handle, i)
            } else {
                Promise::rejected(&handle, i)
            }
        });
        let outcomes = event_loop
            .block_on(all_settled(&handle, inputs))
            .unwrap()
            .unwrap();
        assert_eq!(outcomes.len(), len);
        for (i, outcome) in outcomes.into_iter().enumerate() {
            assert_eq!(outcome.into_result().unwrap_or_else(|reason| reason), i);
        }
    }
}
