use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_test::assert_ok;
use uuid::Uuid;

use robot_arena::config::MatchSettings;
use robot_arena::game::{GameMatch, MatchHandle, MatchPhase, Participant, StepOutcome};
use robot_arena::protocol::{EndReason, MatchOver};
use robot_arena::script::RhaiEngine;
use robot_arena::util::time::tick_delta;

const IDLE: &str = "let idle = true;";

const FIRE_ONCE: &str = r#"
    if state.fired == () {
        robot.fire(0, 3);
        state.fired = true;
    }
"#;

fn build(codes: &[&str]) -> (GameMatch, MatchHandle, Arc<Mutex<Option<MatchOver>>>) {
    let participants = codes
        .iter()
        .enumerate()
        .map(|(i, code)| Participant::new(Uuid::new_v4(), format!("robot-{i}"), *code))
        .collect();
    let result = Arc::new(Mutex::new(None));
    let sink = result.clone();
    let (game_match, handle) = GameMatch::new(
        Uuid::new_v4(),
        participants,
        MatchSettings::default(),
        RhaiEngine::default(),
        Some(Box::new(move |over| {
            assert!(sink.lock().replace(over).is_none(), "callback ran twice");
        })),
    )
    .expect("match builds");
    (game_match, handle, result)
}

#[test]
fn test_missile_crosses_arena_and_hits() {
    let (mut game_match, _handle, result) = build(&[FIRE_ONCE, IDLE]);
    let shooter = game_match.robots()[0].id;
    let target = game_match.robots()[1].id;
    let dt = tick_delta(30);

    let mut hit_tick = None;
    for _ in 0..60 {
        let StepOutcome::Snapshot(snapshot) = game_match.step(dt) else {
            panic!("match ended early");
        };
        if snapshot.tick == 1 {
            assert_eq!(snapshot.events.fires.len(), 1);
            assert_eq!(snapshot.events.fires[0].owner_id, shooter);
            assert_eq!(snapshot.missiles.len(), 1);
        }
        if let Some(hit) = snapshot.events.hits.first() {
            assert_eq!(hit.target_id, target);
            assert_eq!(snapshot.events.explosions[0].size, 3.0);
            assert!(snapshot.missiles.is_empty());
            hit_tick = Some(snapshot.tick);
            break;
        }
    }

    // 600 units at 20 units per tick
    let hit_tick = hit_tick.expect("missile reached the target");
    assert!((27..=29).contains(&hit_tick), "hit on tick {hit_tick}");
    assert_eq!(game_match.robot(target).map(|r| r.damage()), Some(30.0));

    game_match.trigger_self_destruct(target).expect("self destruct");
    let over = result.lock().clone().expect("match over");
    assert_eq!(over.winner_id, Some(shooter));
    assert_eq!(over.reason, EndReason::LastStanding);

    let shooter_stats = &over.robots[0];
    assert_eq!(shooter_stats.shots_fired, 1);
    assert_eq!(shooter_stats.shots_hit, 1);
    assert_eq!(shooter_stats.damage_dealt, 30.0);
    let target_stats = &over.robots[1];
    assert_eq!(target_stats.damage_taken, 100.0);
    assert_eq!(target_stats.destroyed_at_tick, Some(hit_tick));
}

#[test]
fn test_snapshot_ticks_strictly_increase() {
    let (mut game_match, handle, _) = build(&[IDLE, IDLE, IDLE]);
    let mut rx = handle.subscribe();

    for _ in 0..10 {
        game_match.step(tick_delta(30));
    }

    let mut last = 0;
    while let Ok(snapshot) = rx.try_recv() {
        assert!(snapshot.tick > last);
        assert_eq!(snapshot.robots.len(), 3);
        last = snapshot.tick;
    }
    assert_eq!(last, 10);
    assert_eq!(game_match.tick(), 10);
}

#[test]
fn test_head_on_collision_damages_both() {
    let (mut game_match, _, _) = build(&["robot.drive(0, 5);", "robot.drive(180, 5);"]);
    let dt = tick_delta(30);

    let mut bumped = false;
    for _ in 0..60 {
        if let StepOutcome::Snapshot(snapshot) = game_match.step(dt) {
            if snapshot.events.hits.len() == 2 {
                bumped = true;
                break;
            }
        }
    }

    assert!(bumped);
    let robots = game_match.robots();
    assert_eq!(robots[0].damage(), 0.5);
    assert_eq!(robots[1].damage(), 0.5);
    assert!(robots[1].x - robots[0].x >= 30.0 - 1e-3);
}

#[tokio::test(start_paused = true)]
async fn test_running_match_ends_on_self_destruct() {
    let (tx, rx) = oneshot::channel();
    let participants = vec![
        Participant::new(Uuid::new_v4(), "a", IDLE),
        Participant::new(Uuid::new_v4(), "b", IDLE),
    ];
    let (a, b) = (participants[0].id, participants[1].id);
    let (game_match, handle) = GameMatch::new(
        Uuid::new_v4(),
        participants,
        MatchSettings::default(),
        RhaiEngine::default(),
        Some(Box::new(move |over| {
            let _ = tx.send(over);
        })),
    )
    .expect("match builds");

    let mut snapshots = handle.subscribe();
    let task = game_match.start();

    let first = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot in time")
        .expect("snapshot");
    assert_eq!(first.tick, 1);

    assert_ok!(handle.self_destruct(b).await);
    let over = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("result in time")
        .expect("result");
    assert_eq!(over.winner_id, Some(a));
    assert_eq!(over.final_events.destructions.len(), 1);

    let game_match = task.await.expect("match task");
    assert_eq!(game_match.phase(), MatchPhase::Ended);
    assert!(handle.is_finished());
    assert_eq!(handle.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_without_result() {
    let (game_match, handle, result) = build(&[IDLE, IDLE]);
    let task = game_match.start();

    handle.stop();
    handle.stop();

    let game_match = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("stopped in time")
        .expect("match task");
    assert_eq!(game_match.phase(), MatchPhase::Stopped);
    assert!(result.lock().is_none());
    assert!(handle.is_finished());
    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_ends_match() {
    let (game_match, handle, result) = build(&[IDLE, IDLE]);
    let leaver = game_match.robots()[1].id;
    let stayer = game_match.robots()[0].id;
    let task = game_match.start();

    assert_ok!(handle.remove_participant(leaver).await);
    let game_match = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("ended in time")
        .expect("match task");

    assert_eq!(game_match.phase(), MatchPhase::Ended);
    let over = result.lock().clone().expect("match over");
    assert_eq!(over.reason, EndReason::Disconnect);
    assert_eq!(over.winner_id, Some(stayer));
}
