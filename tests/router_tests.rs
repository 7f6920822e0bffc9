//! Integration tests for the host pool and request routing

mod common;

use common::router;
use scalegate::host::{Availability, HostLimits, HostSpec};
use scalegate::router::{AttemptedHosts, HostMatch, HostRouter, PoolSnapshot, RouteRequest};
use scalegate::selector::{HeterogeneousSelector, RandomSelector, RoundRobinSelector, TypeAffineSelector};
use hyper::header::COOKIE;
use hyper::{HeaderMap, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn spec(n: u16) -> HostSpec {
    HostSpec::new(format!("http://10.0.{}.{}:8080", n / 256, n % 256).parse().unwrap())
}

fn tight_router(max_connections: usize, max_queue_size: usize) -> Arc<HostRouter> {
    HostRouter::new(
        Arc::new(RoundRobinSelector::new()),
        HostLimits {
            max_connections,
            max_queue_size,
            problem_retry: Duration::from_secs(60),
        },
    )
}

#[test]
fn test_snapshots_are_consistent_under_concurrent_adds() {
    let router = router();
    let writers: Vec<_> = (0..4u16)
        .map(|w| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                for i in 0..50u16 {
                    let n = w * 100 + i;
                    router.add_host(spec(n).with_route(format!("r{}", n)));
                }
            })
        })
        .collect();

    // Every published snapshot is internally consistent: each route points at
    // a host that is in the same snapshot's list
    let reader = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..2000 {
                let snapshot = router.snapshot();
                assert!(snapshot.hosts.len() >= last, "pool shrank without removals");
                last = snapshot.hosts.len();
                assert_eq!(snapshot.route_count(), snapshot.hosts.len());
                for host in &snapshot.hosts {
                    let route = host.route_id.as_deref().unwrap();
                    assert!(Arc::ptr_eq(snapshot.route(route).unwrap(), host));
                }
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();
    assert_eq!(router.len(), 200);
}

fn member(n: u16) -> HostSpec {
    spec(n)
        .with_route(format!("r{}", n))
        .with_instance_id(format!("i-{}", n))
}

/// Every route points at a host in the same snapshot and every host's route
/// points back at it
fn assert_consistent(snapshot: &PoolSnapshot) {
    assert_eq!(snapshot.route_count(), snapshot.hosts.len());
    for host in &snapshot.hosts {
        let route = host.route_id.as_deref().unwrap();
        assert!(Arc::ptr_eq(snapshot.route(route).unwrap(), host));
    }
}

#[test]
fn test_snapshots_are_consistent_under_mixed_writes() {
    let router = router();
    for n in 0..100 {
        router.add_host(member(n));
    }

    let adder = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            for n in 100..200 {
                router.add_host(member(n));
            }
        })
    };

    // Half the original members leave by instance id, half by URI
    let remover = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            for n in 0..100u16 {
                let key = if n % 2 == 0 {
                    HostMatch::InstanceId(format!("i-{}", n))
                } else {
                    HostMatch::Uri(spec(n).uri)
                };
                let removed = router.remove_host(&key).expect("member present");
                assert_eq!(removed.route_id.as_deref(), Some(format!("r{}", n).as_str()));
                assert!(removed.is_closed());
            }
        })
    };

    let reader = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            for _ in 0..2000 {
                assert_consistent(&router.snapshot());
            }
        })
    };

    // Selected hosts always come whole from some published pool
    let selector = {
        let router = Arc::clone(&router);
        thread::spawn(move || {
            let names = vec!["JSESSIONID".to_string()];
            for i in 0..2000u16 {
                let route = format!("r{}", i % 200);
                let mut headers = HeaderMap::new();
                headers.insert(COOKIE, format!("JSESSIONID=abc.{}", route).parse().unwrap());
                let request = RouteRequest::from_parts(&"/".parse().unwrap(), &headers, &names);

                let Some(host) = router.select_host(&request, &AttemptedHosts::new()) else {
                    continue;
                };
                let route_id = host.route_id.as_deref().unwrap();
                let n: u16 = route_id.trim_start_matches('r').parse().unwrap();
                assert!(n < 200);
                assert_eq!(host.uri, spec(n).uri);
                assert_eq!(host.instance_id.as_deref(), Some(format!("i-{}", n).as_str()));
            }
        })
    };

    for handle in [adder, remover, reader, selector] {
        handle.join().unwrap();
    }

    let snapshot = router.snapshot();
    assert_consistent(&snapshot);
    assert_eq!(snapshot.hosts.len(), 100);
    assert!(snapshot.route("r0").is_none());
    assert!(snapshot.route("r99").is_none());
    assert!(snapshot.route("r150").is_some());
}

#[test]
fn test_held_snapshot_survives_removal() {
    let router = router();
    router.add_host(spec(1).with_instance_id("i-1"));
    router.add_host(spec(2).with_instance_id("i-2"));

    let held = router.snapshot();
    let removed = router
        .remove_host(&HostMatch::InstanceId("i-1".to_string()))
        .unwrap();

    assert_eq!(held.hosts.len(), 2);
    assert_eq!(router.len(), 1);
    assert!(removed.is_closed());
    assert_eq!(removed.availability(), Availability::Closed);
}

#[test]
fn test_round_robin_spreads_requests() {
    let router = router();
    for n in 1..=3 {
        router.add_host(spec(n));
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let host = router
            .select_host(&RouteRequest::default(), &AttemptedHosts::new())
            .unwrap();
        *counts.entry(host.uri.to_string()).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&c| c == 10));
}

#[test]
fn test_sticky_session_with_every_selector() {
    let mut affinity = HashMap::new();
    affinity.insert("countprimes".to_string(), "m4.large".to_string());
    let mut fixed = HashMap::new();
    fixed.insert("tellmenow".to_string(), 0);

    let selectors: Vec<Arc<dyn scalegate::selector::HostSelector>> = vec![
        Arc::new(RoundRobinSelector::new()),
        Arc::new(RandomSelector),
        Arc::new(TypeAffineSelector::new(affinity)),
        Arc::new(HeterogeneousSelector::new(fixed, 0)),
    ];

    let names = vec!["JSESSIONID".to_string()];
    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, "JSESSIONID=0AF3.node3.x".parse().unwrap());
    let uri: Uri = "/run?type=countprimes&arg=7&id=1".parse().unwrap();
    let request = RouteRequest::from_parts(&uri, &headers, &names);

    for selector in selectors {
        let router = HostRouter::new(selector, HostLimits::default());
        for n in 1..=4 {
            router.add_host(spec(n).with_route(format!("node{}", n)).with_instance_type("c4.xlarge"));
        }

        for _ in 0..10 {
            let host = router.select_host(&request, &AttemptedHosts::new()).unwrap();
            assert_eq!(host.route_id.as_deref(), Some("node3"), "selector {}", router.selector_name());
        }
    }
}

#[test]
fn test_unknown_or_malformed_session_falls_back() {
    let router = router();
    router.add_host(spec(1).with_route("r1"));

    let names = vec!["JSESSIONID".to_string()];
    for cookie in ["JSESSIONID=noroute", "JSESSIONID=abc.r9", "JSESSIONID=abc."] {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie.parse().unwrap());
        let request = RouteRequest::from_parts(&"/".parse().unwrap(), &headers, &names);
        assert!(router.select_host(&request, &AttemptedHosts::new()).is_some(), "{}", cookie);
    }
}

#[test]
fn test_failover_prefers_available_then_full_then_problem() {
    // One connection fills a host; one more fills its queue
    let router = tight_router(1, 1);
    let problem = router.add_host(spec(1));
    let full = router.add_host(spec(2));
    let available = router.add_host(spec(3));

    problem.mark_problem();
    let _full_conn = full.acquire();
    assert_eq!(problem.availability(), Availability::Problem);
    assert_eq!(full.availability(), Availability::Full);
    assert_eq!(available.availability(), Availability::Available);

    let request = RouteRequest::default();
    let mut attempted = AttemptedHosts::new();

    let first = router.select_host(&request, &attempted).unwrap();
    assert!(Arc::ptr_eq(&first, &available));
    attempted.insert(first);

    let second = router.select_host(&request, &attempted).unwrap();
    assert!(Arc::ptr_eq(&second, &full));
    attempted.insert(second);

    let third = router.select_host(&request, &attempted).unwrap();
    assert!(Arc::ptr_eq(&third, &problem));
    attempted.insert(third);

    assert!(router.select_host(&request, &attempted).is_none());
    assert_eq!(attempted.len(), 3);
}

#[test]
fn test_full_queue_is_last_resort() {
    let router = tight_router(1, 1);
    let saturated = router.add_host(spec(1));
    let _a = saturated.acquire();
    let _b = saturated.acquire();
    assert_eq!(saturated.availability(), Availability::FullQueue);

    let picked = router
        .select_host(&RouteRequest::default(), &AttemptedHosts::new())
        .unwrap();
    assert!(Arc::ptr_eq(&picked, &saturated));

    let fresh = router.add_host(spec(2));
    for _ in 0..4 {
        let picked = router
            .select_host(&RouteRequest::default(), &AttemptedHosts::new())
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &fresh));
    }
}

#[test]
fn test_connection_guard_releases_capacity() {
    let router = tight_router(1, 4);
    let host = router.add_host(spec(1));

    {
        let _conn = host.acquire();
        assert_eq!(host.availability(), Availability::Full);
        assert_eq!(host.connections().active(), 1);
    }

    assert_eq!(host.availability(), Availability::Available);
    assert_eq!(host.connections().active(), 0);
}

#[test]
fn test_heterogeneous_reserves_fixed_hosts() {
    let mut fixed = HashMap::new();
    fixed.insert("tellmenow".to_string(), 0);
    fixed.insert("memorykiller".to_string(), 1);
    let router = HostRouter::new(Arc::new(HeterogeneousSelector::new(fixed, 2)), HostLimits::default());
    for n in 1..=5 {
        router.add_host(spec(n));
    }
    let snapshot = router.snapshot();

    let pick = |category: Option<&str>| {
        let request = match category {
            Some(c) => RouteRequest::default().with_category(c),
            None => RouteRequest::default(),
        };
        router.select_host(&request, &AttemptedHosts::new()).unwrap()
    };

    assert!(Arc::ptr_eq(&pick(Some("tellmenow")), &snapshot.hosts[0]));
    assert!(Arc::ptr_eq(&pick(Some("memorykiller")), &snapshot.hosts[1]));
    assert!(Arc::ptr_eq(&pick(None), &snapshot.hosts[2]));

    for _ in 0..9 {
        let host = pick(Some("418wisdom"));
        let idx = snapshot.hosts.iter().position(|h| Arc::ptr_eq(h, &host)).unwrap();
        assert!(idx >= 2, "general traffic landed on reserved host {}", idx);
    }
}
