//! End-to-end mesh scenarios on the simulation platform

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};

use canopy_bridge::{GatewayOutcome, RequestOptions};
use canopy_core::{MonotonicClock, NodeId};
use canopy_node::{MeshConfig, MeshMode};
use canopy_sim::{Scripted, SimHttp, SimNet, SimNode};

const STEP: Duration = Duration::from_millis(100);
const PROBE_URL: &str = "http://www.msftconnecttest.com/connecttest.txt";
const PROBE_BODY: &str = "Microsoft Connect Test";

fn config() -> MeshConfig {
    MeshConfig::new("canopy", "pwd")
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn run(net: &SimNet, nodes: &mut [&mut SimNode], duration: Duration) {
    net.run(nodes, duration, STEP);
}

fn counter() -> (Rc<RefCell<u32>>, impl Fn() -> u32) {
    let cell = Rc::new(RefCell::new(0u32));
    let reader = Rc::clone(&cell);
    (cell, move || *reader.borrow())
}

/// Two staggered nodes discover each other and exchange topology.
#[test]
fn two_nodes_join_and_sync() {
    init_tracing();
    let net = SimNet::new();
    let mut a = net.node(100, config());
    let mut b = net.node(200, config());

    a.init().unwrap();
    run(&net, &mut [&mut a], Duration::from_secs(2));
    b.init().unwrap();
    run(&net, &mut [&mut a, &mut b], Duration::from_secs(5));

    assert_eq!(a.node_list(false), vec![NodeId(200)]);
    assert_eq!(b.node_list(false), vec![NodeId(100)]);
    assert_eq!(a.node_list(true), vec![NodeId(100), NodeId(200)]);
    assert!(a.has_active_mesh_connections());
    assert!(b.is_connected(NodeId(100)));
}

/// Duplicate-id fork: when a second connection advertises an id already
/// routed through an older connection, the older connection is dropped.
#[test]
fn duplicate_node_id_drops_older_connection() {
    let net = SimNet::new();
    let mut a = net.node(100, config());
    let mut b = net.node(200, config());

    let (new_conns, new_count) = counter();
    let (changed, changed_count) = counter();
    let (dropped, dropped_count) = counter();
    a.on_new_connection(move |_, _| *new_conns.borrow_mut() += 1);
    a.on_changed_connections(move |_| *changed.borrow_mut() += 1);
    a.on_dropped_connection(move |_, _| *dropped.borrow_mut() += 1);

    a.init().unwrap();
    run(&net, &mut [&mut a], Duration::from_secs(2));
    b.init().unwrap();
    run(&net, &mut [&mut a, &mut b], Duration::from_secs(4));
    assert_eq!(a.node_list(false), vec![NodeId(200)]);
    assert_eq!(changed_count(), 1);

    // A second node with the same id attaches while the first is frozen.
    let mut c = net.node(200, config());
    c.init().unwrap();
    run(&net, &mut [&mut a, &mut c], Duration::from_secs(5));

    assert_eq!(a.node_list(false), vec![NodeId(200)]);
    assert_eq!(new_count(), 2);
    assert_eq!(dropped_count(), 1);
    // The swap kept the node set identical, so no further change fired.
    assert_eq!(changed_count(), 1);
}

/// Build the line A - B - C - D by hiding farther APs from each joiner.
fn build_line(net: &SimNet) -> (SimNode, SimNode, SimNode, SimNode) {
    let mut a = net.node(100, config());
    let mut b = net.node(200, config());
    let mut c = net.node(300, config());
    let mut d = net.node(400, config());

    // C only hears B; D only hears C.
    net.airspace
        .set_link_visible(SimNet::mac_for(300), SimNet::mac_for(100), false);
    net.airspace
        .set_link_visible(SimNet::mac_for(400), SimNet::mac_for(100), false);
    net.airspace
        .set_link_visible(SimNet::mac_for(400), SimNet::mac_for(200), false);

    a.init().unwrap();
    net.run(&mut [&mut a], Duration::from_secs(2), STEP);
    b.init().unwrap();
    net.run(&mut [&mut a, &mut b], Duration::from_secs(4), STEP);
    c.init().unwrap();
    net.run(&mut [&mut a, &mut b, &mut c], Duration::from_secs(4), STEP);
    d.init().unwrap();
    // Long enough for membership to travel the whole line through the
    // periodic sub-tree exchanges.
    net.run(
        &mut [&mut a, &mut b, &mut c, &mut d],
        Duration::from_secs(25),
        STEP,
    );
    (a, b, c, d)
}

/// Broadcast fan-out over a line: every other node sees the payload
/// exactly once, the sender not at all.
#[test]
fn broadcast_reaches_each_node_exactly_once() {
    let net = SimNet::new();
    let (mut a, mut b, mut c, mut d) = build_line(&net);

    let all = vec![NodeId(100), NodeId(200), NodeId(300), NodeId(400)];
    assert_eq!(a.node_list(true), all);
    assert_eq!(d.node_list(true), all);

    let received: Rc<RefCell<Vec<(u32, NodeId, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    for (node, id) in [(&mut a, 100u32), (&mut b, 200), (&mut c, 300), (&mut d, 400)] {
        let log = Rc::clone(&received);
        node.on_receive(move |_ctx, from, msg| {
            log.borrow_mut().push((id, from, msg.clone()));
        });
    }

    assert!(a.send_broadcast(json!("X"), false));
    run(&net, &mut [&mut a, &mut b, &mut c, &mut d], Duration::from_secs(3));

    let mut seen: Vec<(u32, NodeId, Value)> = received.borrow().clone();
    seen.sort_by_key(|(id, _, _)| *id);
    assert_eq!(
        seen,
        vec![
            (200, NodeId(100), json!("X")),
            (300, NodeId(100), json!("X")),
            (400, NodeId(100), json!("X")),
        ]
    );
}

/// Unicast traverses the line without dispatching at intermediate hops.
#[test]
fn unicast_forwards_to_exactly_one_destination() {
    let net = SimNet::new();
    let (mut a, mut b, mut c, mut d) = build_line(&net);

    let received: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    for (node, id) in [(&mut b, 200u32), (&mut c, 300), (&mut d, 400)] {
        let log = Rc::clone(&received);
        node.on_receive(move |_ctx, _from, _msg| log.borrow_mut().push(id));
    }

    a.send_single(NodeId(400), json!("to the end")).unwrap();
    run(&net, &mut [&mut a, &mut b, &mut c, &mut d], Duration::from_secs(3));
    assert_eq!(*received.borrow(), vec![400]);

    // Unknown destination fails synchronously.
    assert!(a.send_single(NodeId(999), json!("nowhere")).is_err());
}

/// Two nodes with a 10ms boot-clock skew converge under 200us.
#[test]
fn time_sync_convergence() {
    let net = SimNet::new();
    let mut a = net.node(100, config());
    let mut b = net.node_with_skew(200, config(), Duration::from_millis(10));

    let (adjusted, adjusted_count) = counter();
    b.on_node_time_adjusted(move |_, _| *adjusted.borrow_mut() += 1);

    a.init().unwrap();
    for _ in 0..20 {
        a.update();
        net.clock.advance(STEP);
    }
    b.init().unwrap();

    // Before any exchange the clocks disagree by the skew.
    assert!((a.node_time() as i64 - b.node_time() as i64).abs() >= 9_000);

    // Covers the on-attach exchange plus one periodic round.
    for _ in 0..400 {
        a.update();
        b.update();
        net.clock.advance(STEP);
    }

    assert!(adjusted_count() >= 1);
    let diff = (a.node_time() as i64 - b.node_time() as i64).abs();
    assert!(diff < 200, "clocks still {diff}us apart");
}

struct GatewayWorld {
    net: SimNet,
    http: SimHttp,
    bridge: SimNode,
    sensor: SimNode,
}

/// Bridge R on the router plus sensor S joined to R's mesh, with R's
/// status beacon already in S's registry.
fn gateway_world() -> GatewayWorld {
    init_tracing();
    let net = SimNet::new();
    net.airspace
        .add_router_ap("home", [9, 9, 9, 9, 9, 9], 11, -50);
    let http = SimHttp::new();

    let mut bridge = net.node(500, config()).with_http(http.clone());
    bridge.init_as_bridge("home", "routerpw", None).unwrap();
    net.run(&mut [&mut bridge], Duration::from_secs(2), STEP);
    assert!(bridge.is_bridge());

    let mut sensor = net.node(600, config()).with_http(http.clone());
    sensor.init().unwrap();
    let mut pair = [&mut bridge, &mut sensor];
    net.run(&mut pair, Duration::from_secs(5), STEP);
    assert!(pair[1].is_connected(NodeId(500)));

    // Wait out the periodic status beacon so the sensor knows its bridge.
    net.run(&mut pair, Duration::from_secs(31), STEP);
    assert!(pair[1].has_internet_connection());

    GatewayWorld {
        net,
        http,
        bridge,
        sensor,
    }
}

fn outcome_sink() -> (Rc<RefCell<Vec<GatewayOutcome>>>, Box<dyn FnMut(&GatewayOutcome)>) {
    let sink: Rc<RefCell<Vec<GatewayOutcome>>> = Rc::new(RefCell::new(Vec::new()));
    let writer = Rc::clone(&sink);
    (
        sink,
        Box::new(move |outcome: &GatewayOutcome| writer.borrow_mut().push(outcome.clone())),
    )
}

/// Captive portal: the probe body mismatch fails the request with the
/// exact non-retryable error, exactly once, with no retry.
#[test]
fn captive_portal_fails_fast_without_retry() {
    let GatewayWorld {
        net,
        http,
        mut bridge,
        mut sensor,
    } = gateway_world();

    http.push(PROBE_URL, Scripted::ok(200, PROBE_BODY));
    http.push(PROBE_URL, Scripted::ok(302, "<login>"));

    let (outcomes, callback) = outcome_sink();
    sensor
        .send_to_internet("https://api.example/ok", json!(""), RequestOptions::default(), callback)
        .unwrap();

    net.run(&mut [&mut bridge, &mut sensor], Duration::from_secs(5), STEP);

    {
        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].http_status, 0);
        assert_eq!(
            outcomes[0].error.as_deref(),
            Some("Captive portal detected - requires web authentication. Check router/WiFi settings")
        );
    }

    // No retry ever reached the target, and the callback stays at one.
    net.run(&mut [&mut bridge, &mut sensor], Duration::from_secs(20), STEP);
    assert_eq!(outcomes.borrow().len(), 1);
    assert!(!http.requests().iter().any(|u| u.contains("api.example")));
}

/// HTTP 203 twice, then 200: the sender retries with 2s and 4s backoffs
/// and resolves success on the third attempt.
#[test]
fn http_203_recovers_after_backoff() {
    let GatewayWorld {
        net,
        http,
        mut bridge,
        mut sensor,
    } = gateway_world();

    let target = "https://api.example/ok";
    http.set(PROBE_URL, Scripted::ok(200, PROBE_BODY));
    http.push(target, Scripted::ok(203, "cached"));
    http.push(target, Scripted::ok(203, "cached"));
    http.push(target, Scripted::ok(200, "done"));

    let (outcomes, callback) = outcome_sink();
    let started_us = net.clock.now_us();
    sensor
        .send_to_internet(
            target,
            json!(""),
            RequestOptions {
                max_attempts: 3,
                backoff_base: Duration::from_secs(2),
                deadline: Duration::from_secs(30),
            },
            callback,
        )
        .unwrap();

    let mut resolved_at_us = None;
    for _ in 0..150 {
        bridge.update();
        sensor.update();
        net.clock.advance(STEP);
        if resolved_at_us.is_none() && !outcomes.borrow().is_empty() {
            resolved_at_us = Some(net.clock.now_us());
        }
    }

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].http_status, 200);

    // Two backoffs of 2s and 4s, plus a little mesh round-trip latency.
    let elapsed = resolved_at_us.expect("request resolved") - started_us;
    assert!(elapsed >= 5_900_000, "resolved too early: {elapsed}us");
    assert!(elapsed < 10_000_000, "resolved too late: {elapsed}us");

    let target_hits = http.requests().iter().filter(|u| *u == target).count();
    assert_eq!(target_hits, 3);
}

/// Offline queue drains priority-first once a bridge appears.
#[test]
fn offline_queue_flushes_on_internet_transition() {
    let net = SimNet::new();
    net.airspace
        .add_router_ap("home", [9, 9, 9, 9, 9, 9], 11, -50);
    let http = SimHttp::new();
    http.set(PROBE_URL, Scripted::ok(200, PROBE_BODY));
    http.set("http://sink/critical", Scripted::ok(200, "ok"));
    http.set("http://sink/normal", Scripted::ok(200, "ok"));

    // The sensor starts alone: no bridge, no internet.
    let mut sensor = net.node(600, config()).with_http(http.clone());
    sensor.init().unwrap();
    let (flushed, flushed_count) = counter();
    sensor.on_queue_flushed(move |_| *flushed.borrow_mut() += 1);

    assert!(sensor.queue_message("http://sink/normal", json!(1), canopy_bridge::Priority::Normal));
    assert!(sensor.queue_message(
        "http://sink/critical",
        json!(2),
        canopy_bridge::Priority::Critical
    ));
    assert_eq!(sensor.queued_messages(), 2);
    assert!(!sensor.has_internet_connection());

    // A bridge comes up; the sensor joins and learns of it.
    let mut bridge = net.node(500, config()).with_http(http.clone());
    bridge.init_as_bridge("home", "routerpw", None).unwrap();
    net.run(
        &mut [&mut bridge, &mut sensor],
        Duration::from_secs(45),
        STEP,
    );

    assert_eq!(sensor.queued_messages(), 0);
    assert_eq!(flushed_count(), 1);
    let order: Vec<String> = http
        .requests()
        .into_iter()
        .filter(|u| u.starts_with("http://sink/"))
        .collect();
    assert_eq!(order, vec!["http://sink/critical", "http://sink/normal"]);
}

/// Abdication: the bridge steps down voluntarily, advertising itself
/// unhealthy so peers stop routing egress through it at once.
#[test]
fn bridge_abdication_clears_role_and_registry() {
    let GatewayWorld {
        net,
        mut bridge,
        mut sensor,
        ..
    } = gateway_world();

    let (role_drops, drop_count) = counter();
    bridge.on_bridge_role_changed(move |_, is_bridge, _| {
        if !is_bridge {
            *role_drops.borrow_mut() += 1;
        }
    });

    bridge.abdicate_bridge("maintenance window");
    assert!(!bridge.is_bridge());
    assert_eq!(drop_count(), 1);

    net.run(&mut [&mut bridge, &mut sensor], Duration::from_secs(3), STEP);
    // The final unhealthy beacon reached the sensor: no egress remains.
    assert!(!sensor.has_internet_connection());
    assert!(
        sensor
            .send_to_internet(
                "https://api.example/ok",
                json!(""),
                RequestOptions::default(),
                Box::new(|_| {})
            )
            .is_err()
    );
}

/// Bridge failover: the bridge dies, its registry entry expires, and the
/// credentialed peer promotes itself and takes the role over.
#[test]
fn bridge_failover_promotes_credentialed_peer() {
    let net = SimNet::new();
    net.airspace
        .add_router_ap("home", [9, 9, 9, 9, 9, 9], 11, -50);
    let http = SimHttp::new();
    http.set(PROBE_URL, Scripted::ok(200, PROBE_BODY));

    let (bridge, _bridge_radio, bridge_tcp) = net.node_with_handles(500, config());
    let mut bridge = bridge.with_http(http.clone());
    bridge.init_as_bridge("home", "routerpw", None).unwrap();
    net.run(&mut [&mut bridge], Duration::from_secs(2), STEP);

    let mut peer = net
        .node(700, config().with_router("home", "routerpw"))
        .with_http(http.clone());
    peer.init().unwrap();
    let (role_changes, role_count) = counter();
    peer.on_bridge_role_changed(move |_, is_bridge, _reason| {
        if is_bridge {
            *role_changes.borrow_mut() += 1;
        }
    });
    net.run(&mut [&mut bridge, &mut peer], Duration::from_secs(40), STEP);
    assert!(peer.is_connected(NodeId(500)));
    assert!(!peer.bridges().is_empty());

    // Kill the bridge outright: AP off the air, sockets reset.
    net.airspace.remove_ap(SimNet::mac_for(500));
    net.wire.kill(bridge_tcp.stack_id());

    let killed_at = net.clock.now_us();
    let mut elapsed = Duration::ZERO;
    while elapsed < Duration::from_secs(120) {
        peer.update();
        net.clock.advance(STEP);
        elapsed += STEP;
        if role_count() > 0 {
            break;
        }
    }

    assert!(peer.is_bridge(), "peer never took the bridge role over");
    assert_eq!(role_count(), 1);
    assert!(peer.has_internet_connection());
    let took_us = net.clock.now_us() - killed_at;
    assert!(
        took_us <= 90_000_000,
        "failover took {}s",
        took_us / 1_000_000
    );
}

/// Two credentialed nodes, no bridge: the election monitor promotes one
/// and the other rejoins its new mesh.
#[test]
fn election_promotes_monitor_detected_candidate() {
    let net = SimNet::new();
    let router_bssid = [9, 9, 9, 9, 9, 9];
    net.airspace.add_router_ap("home", router_bssid, 11, -50);
    let http = SimHttp::new();
    http.set(PROBE_URL, Scripted::ok(200, PROBE_BODY));

    let mut a = net
        .node(100, config().with_router("home", "routerpw"))
        .with_http(http.clone());
    let (a_roles, a_role_count) = counter();
    a.on_bridge_role_changed(move |_, is_bridge, _| {
        if is_bridge {
            *a_roles.borrow_mut() += 1;
        }
    });

    a.init().unwrap();
    run(&net, &mut [&mut a], Duration::from_secs(2));

    // B starts half a minute later, so only A's monitor can fire first.
    let mut b = net
        .node(200, config().with_router("home", "routerpw"))
        .with_http(http.clone());
    net.run(&mut [&mut a], Duration::from_secs(35), STEP);
    b.init().unwrap();
    net.run(&mut [&mut a, &mut b], Duration::from_secs(10), STEP);
    assert!(b.is_connected(NodeId(100)));

    // A's startup grace ends around t=62s; give the campaign, takeover,
    // and B's rejoin ample room.
    net.run(&mut [&mut a, &mut b], Duration::from_secs(60), STEP);

    assert!(a.is_bridge());
    assert_eq!(a.mode(), MeshMode::Bridge);
    assert_eq!(a_role_count(), 1);
    assert!(!b.is_bridge());
    net.run(&mut [&mut a, &mut b], Duration::from_secs(40), STEP);
    assert!(a.node_list(false).contains(&NodeId(200)), "B never rejoined");
    assert!(b.bridges().iter().any(|i| i.node_id == NodeId(100)));
}
