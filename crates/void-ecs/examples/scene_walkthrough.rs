//! Walks a small scene through spawns, a query with deferred commands, and
//! an event flush. Run with `RUST_LOG=void_ecs=trace` to see transitions.

use anyhow::Result;
use void_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Velocity {
    dx: f32,
    dy: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Fuel(u32);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SceneConfig::from_json_str(r#"{ "entity_capacity": 16 }"#)?;
    let mut scene = Scene::with_config(config);
    scene.register_component::<Position>("position");
    scene.register_component::<Velocity>("velocity");
    scene.register_component::<Fuel>("fuel");

    scene.subscribe(|event| tracing::info!(?event, "scene event"));

    for i in 0..3 {
        scene
            .spawn()
            .with(Position { x: i as f32, y: 0.0 })
            .with(Velocity { dx: 1.0, dy: 0.0 })
            .with(Fuel(i))
            .build();
    }
    let probe = scene
        .spawn()
        .with_json("position", &serde_json::json!({ "x": 10.0, "y": 5.0 }))?
        .build();
    scene.flush_events();

    // Move everything with fuel; anything that runs dry loses its velocity.
    for tick in 0..3 {
        scene
            .query::<(&mut Position, &Velocity, &mut Fuel)>()
            .for_each(|entity, (position, velocity, fuel), commands| {
                position.x += velocity.dx;
                position.y += velocity.dy;
                match fuel.0.checked_sub(1) {
                    Some(left) => fuel.0 = left,
                    None => commands.remove_component::<Velocity>(entity),
                }
            });
        let report = scene.last_apply_report();
        tracing::info!(tick, applied = report.applied, "tick done");
        scene.flush_events();
    }

    let moving = scene.query::<&Velocity>().count();
    let parked = scene.query::<&Position>().without::<Velocity>().count();
    println!("moving: {moving}, parked: {parked}");

    for entity in scene.alive_entities() {
        if let Some(components) = scene.all_components(entity)? {
            println!("{entity}: {}", serde_json::to_string(&components)?);
        }
    }
    println!("probe archetype: {:?}", scene.location(probe).map(|l| l.archetype));

    Ok(())
}
